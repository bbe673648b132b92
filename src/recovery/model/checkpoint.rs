//! Data model for a single checkpoint, from the barrier that starts it
//! to the immutable record a recovery restores from.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use super::progress::*;
use super::state::*;

/// Marker injected by sources into the data stream.
///
/// Every element a task emits before it forwards a barrier belongs to
/// checkpoint `checkpoint_id`; everything after belongs to later ones.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barrier {
    pub checkpoint_id: CheckpointId,
    pub attempt: Attempt,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStatus {
    Pending,
    Completed,
    Expired,
}

/// A task reporting that it snapshotted its state for a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Ack {
    pub(crate) attempt: Attempt,
    pub(crate) task: TaskId,
    pub(crate) checkpoint_id: CheckpointId,
    pub(crate) state: StateBytes,
}

/// A task reporting it could not take part in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Decline {
    pub(crate) attempt: Attempt,
    pub(crate) task: TaskId,
    pub(crate) checkpoint_id: CheckpointId,
    pub(crate) reason: String,
}

/// A checkpoint the coordinator is still collecting acks for.
#[derive(Debug)]
pub(crate) struct Checkpoint {
    pub(crate) id: CheckpointId,
    pub(crate) attempt: Attempt,
    pub(crate) triggered_at: DateTime<Utc>,
    /// Monotonic clock reading used for expiry.
    pub(crate) started: Instant,
    /// Every task that must ack before this can complete.
    pub(crate) expected: BTreeSet<TaskId>,
    pub(crate) acks: BTreeMap<TaskId, StateBytes>,
    pub(crate) status: CheckpointStatus,
}

impl Checkpoint {
    pub(crate) fn new(
        id: CheckpointId,
        attempt: Attempt,
        expected: BTreeSet<TaskId>,
        started: Instant,
    ) -> Self {
        Self {
            id,
            attempt,
            triggered_at: Utc::now(),
            started,
            expected,
            acks: BTreeMap::new(),
            status: CheckpointStatus::Pending,
        }
    }

    pub(crate) fn barrier(&self) -> Barrier {
        Barrier {
            checkpoint_id: self.id,
            attempt: self.attempt,
            triggered_at: self.triggered_at,
        }
    }

    pub(crate) fn is_fully_acked(&self) -> bool {
        self.acks.len() == self.expected.len()
    }
}

/// A checkpoint for which every task acked.
///
/// This is never mutated once built; it is shared by reference between
/// the coordinator, the store and the tasks restoring from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCheckpoint {
    pub id: CheckpointId,
    pub attempt: Attempt,
    pub triggered_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// One encoded [`TaskSnapshot`] per task of the job.
    pub snapshots: BTreeMap<TaskId, StateBytes>,
}

impl CompletedCheckpoint {
    pub(crate) fn from_pending(checkpoint: Checkpoint) -> Self {
        Self {
            id: checkpoint.id,
            attempt: checkpoint.attempt,
            triggered_at: checkpoint.triggered_at,
            completed_at: Utc::now(),
            snapshots: checkpoint.acks,
        }
    }

    /// Decode the snapshot a task took for this checkpoint.
    ///
    /// Missing snapshots decode as empty state.
    pub fn task_snapshot(&self, task: &TaskId) -> crate::errors::HarnessResult<TaskSnapshot> {
        match self.snapshots.get(task) {
            Some(blob) => TaskSnapshot::decode(blob),
            None => Ok(TaskSnapshot::default()),
        }
    }
}

#[test]
fn fully_acked_when_every_expected_task_acked() {
    let expected = BTreeSet::from([TaskId::new(0, 0), TaskId::new(0, 1)]);
    let mut checkpoint = Checkpoint::new(CheckpointId(4), Attempt(1), expected, Instant::now());
    assert!(!checkpoint.is_fully_acked());

    checkpoint
        .acks
        .insert(TaskId::new(0, 0), StateBytes(b"{}".to_vec()));
    assert!(!checkpoint.is_fully_acked());
    checkpoint
        .acks
        .insert(TaskId::new(0, 1), StateBytes(b"{}".to_vec()));
    assert!(checkpoint.is_fully_acked());

    let barrier = checkpoint.barrier();
    assert_eq!(barrier.checkpoint_id, CheckpointId(4));
    assert_eq!(barrier.attempt, Attempt(1));

    let completed = CompletedCheckpoint::from_pending(checkpoint);
    assert_eq!(completed.snapshots.len(), 2);
    assert!(completed
        .task_snapshot(&TaskId::new(3, 3))
        .unwrap()
        .is_empty());
}
