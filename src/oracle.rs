//! The completion oracle.
//!
//! The one place outside of the job master that can tell what a job
//! run is doing. The master publishes every status change, completed
//! checkpoint and recovery here; anything else (tests, the status
//! webserver, a caller's own polling) only reads.
//!
//! Published state is the master's view after the fact: a status seen
//! here has already been written to the checkpoint store.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Condvar;
use parking_lot::Mutex;
use serde::Serialize;

use crate::execution::coordinator::CheckpointStats;
use crate::recovery::model::*;

/// A point-in-time copy of what the oracle knows about a job run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobState {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempt: Attempt,
    pub last_completed_checkpoint: Option<CheckpointId>,
    pub recoveries: Vec<RecoveryRecord>,
    pub failure: Option<FailureReason>,
    pub checkpoints: CheckpointStats,
    pub updated_at: DateTime<Utc>,
}

/// How waiting for a job to end turned out.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Finished(JobState),
    Failed {
        reason: FailureReason,
        state: JobState,
    },
    /// The job was still going when the wait gave up.
    TimedOut(JobState),
}

impl Completion {
    pub fn state(&self) -> &JobState {
        match self {
            Completion::Finished(state)
            | Completion::Failed { state, .. }
            | Completion::TimedOut(state) => state,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Completion::Finished(_))
    }
}

struct Shared {
    state: Mutex<JobState>,
    changed: Condvar,
}

/// Cheap to clone; every clone sees the same job.
#[derive(Clone)]
pub struct CompletionOracle {
    shared: Arc<Shared>,
}

impl CompletionOracle {
    pub(crate) fn new(job_id: JobId) -> Self {
        let state = JobState {
            job_id,
            status: JobStatus::Running,
            attempt: Attempt::INITIAL,
            last_completed_checkpoint: None,
            recoveries: Vec::new(),
            failure: None,
            checkpoints: CheckpointStats::default(),
            updated_at: Utc::now(),
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn snapshot(&self) -> JobState {
        self.shared.state.lock().clone()
    }

    pub fn status(&self) -> JobStatus {
        self.shared.state.lock().status
    }

    pub fn last_completed_checkpoint(&self) -> Option<CheckpointId> {
        self.shared.state.lock().last_completed_checkpoint
    }

    /// If outputs can be inspected now.
    ///
    /// True once the job finished. While the job runs undisturbed it
    /// is also true as soon as one checkpoint completed, since
    /// everything before that checkpoint has reached the outputs and
    /// won't be rolled back. Never true while recovering or after a
    /// failure.
    pub fn is_safe_to_inspect(&self) -> bool {
        let state = self.shared.state.lock();
        match state.status {
            JobStatus::Finished => true,
            JobStatus::Running => {
                state.failure.is_none() && state.last_completed_checkpoint.is_some()
            }
            JobStatus::Recovering | JobStatus::Failed => false,
        }
    }

    /// Block until the job finishes or fails, or `timeout` passes.
    pub fn wait_for_completion(&self, timeout: Duration) -> Completion {
        let state = self.wait_until(timeout, |state| state.status.is_terminal());
        match (state.status, &state.failure) {
            (JobStatus::Finished, _) => Completion::Finished(state),
            (JobStatus::Failed, Some(reason)) => Completion::Failed {
                reason: reason.clone(),
                state,
            },
            (JobStatus::Failed, None) => Completion::Failed {
                reason: FailureReason::Internal("failed without a reason".to_string()),
                state,
            },
            _ => Completion::TimedOut(state),
        }
    }

    /// Block until checkpoint `checkpoint_id` (or a later one) has
    /// completed. Returns the latest completed checkpoint, or `None`
    /// if the job ended or `timeout` passed first.
    pub fn wait_for_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        timeout: Duration,
    ) -> Option<CheckpointId> {
        let reached = |state: &JobState| {
            state
                .last_completed_checkpoint
                .is_some_and(|last| last >= checkpoint_id)
        };
        let state = self.wait_until(timeout, |state| {
            reached(state) || state.status.is_terminal()
        });
        if reached(&state) {
            state.last_completed_checkpoint
        } else {
            None
        }
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&JobState) -> bool) -> JobState {
        // A timeout too large to represent is the same as no timeout.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.state.lock();
        while !done(&state) {
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    self.shared.changed.wait_until(&mut state, deadline);
                }
                None => self.shared.changed.wait(&mut state),
            }
        }
        state.clone()
    }

    fn update(&self, f: impl FnOnce(&mut JobState)) {
        let mut state = self.shared.state.lock();
        f(&mut state);
        state.updated_at = Utc::now();
        self.shared.changed.notify_all();
    }

    pub(crate) fn set_status(&self, status: JobStatus, attempt: Attempt) {
        self.update(|state| {
            state.status = status;
            state.attempt = attempt;
        });
    }

    pub(crate) fn checkpoint_completed(&self, checkpoint_id: CheckpointId) {
        self.update(|state| {
            state.last_completed_checkpoint = Some(checkpoint_id);
        });
    }

    pub(crate) fn set_checkpoint_stats(&self, stats: CheckpointStats) {
        self.update(|state| state.checkpoints = stats);
    }

    pub(crate) fn recovered(&self, record: RecoveryRecord) {
        self.update(|state| {
            state.attempt = record.attempt;
            state.recoveries.push(record);
        });
    }

    pub(crate) fn fail(&self, reason: FailureReason, attempt: Attempt) {
        self.update(|state| {
            state.status = JobStatus::Failed;
            state.attempt = attempt;
            state.failure = Some(reason);
        });
    }
}

#[test]
fn wait_for_completion_times_out_while_running() {
    let oracle = CompletionOracle::new(JobId("job".to_string()));
    let start = Instant::now();
    let completion = oracle.wait_for_completion(Duration::from_millis(50));
    let elapsed = start.elapsed();

    assert!(matches!(completion, Completion::TimedOut(ref state) if state.status == JobStatus::Running));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
    assert!(!oracle.is_safe_to_inspect());
}

#[test]
fn waiters_wake_on_finish() {
    let oracle = CompletionOracle::new(JobId("job".to_string()));
    let waiter = {
        let oracle = oracle.clone();
        std::thread::spawn(move || oracle.wait_for_completion(Duration::from_secs(30)))
    };
    std::thread::sleep(Duration::from_millis(20));
    oracle.checkpoint_completed(CheckpointId(2));
    oracle.set_status(JobStatus::Finished, Attempt(0));

    let completion = waiter.join().unwrap();
    assert!(completion.is_finished());
    assert_eq!(
        completion.state().last_completed_checkpoint,
        Some(CheckpointId(2))
    );
    assert!(oracle.is_safe_to_inspect());
}

#[test]
fn failed_completion_carries_reason() {
    let oracle = CompletionOracle::new(JobId("job".to_string()));
    oracle.fail(FailureReason::RecoveryExhausted, Attempt(1));
    match oracle.wait_for_completion(Duration::ZERO) {
        Completion::Failed { reason, state } => {
            assert_eq!(reason, FailureReason::RecoveryExhausted);
            assert_eq!(state.attempt, Attempt(1));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn wait_for_checkpoint_accepts_later_ids() {
    let oracle = CompletionOracle::new(JobId("job".to_string()));
    assert_eq!(
        oracle.wait_for_checkpoint(CheckpointId(3), Duration::from_millis(10)),
        None
    );
    oracle.checkpoint_completed(CheckpointId(4));
    assert_eq!(
        oracle.wait_for_checkpoint(CheckpointId(3), Duration::from_millis(10)),
        Some(CheckpointId(4))
    );
    assert!(oracle.is_safe_to_inspect());
    oracle.set_status(JobStatus::Recovering, Attempt(1));
    assert!(!oracle.is_safe_to_inspect());

    oracle.set_status(JobStatus::Finished, Attempt(0));
    assert_eq!(
        oracle.wait_for_checkpoint(CheckpointId(9), Duration::from_secs(30)),
        None
    );
}
