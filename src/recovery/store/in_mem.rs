//! Implementation of an in-memory checkpoint store.
//!
//! This is the default store: checkpoints survive task failures
//! because they live with the job master, but not the process.

use std::collections::BTreeMap;

use super::CheckpointStore;
use super::JobRecord;
use crate::errors::HarnessResult;
use crate::recovery::model::*;

/// A checkpoint store with all data in memory.
#[derive(Debug, Default)]
pub struct InMemStore {
    checkpoints: BTreeMap<CheckpointId, CompletedCheckpoint>,
    jobs: BTreeMap<JobId, JobRecord>,
}

impl InMemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint_ids(&self) -> Vec<CheckpointId> {
        self.checkpoints.keys().copied().collect()
    }
}

impl CheckpointStore for InMemStore {
    fn save_completed(&mut self, checkpoint: &CompletedCheckpoint) -> HarnessResult<()> {
        tracing::trace!("Saving checkpoint {}", checkpoint.id);
        self.checkpoints.insert(checkpoint.id, checkpoint.clone());
        Ok(())
    }

    fn load_latest(&self) -> HarnessResult<Option<CompletedCheckpoint>> {
        Ok(self
            .checkpoints
            .last_key_value()
            .map(|(_id, checkpoint)| checkpoint.clone()))
    }

    fn retain_latest(&mut self, keep: usize) -> HarnessResult<usize> {
        let discard = self.checkpoints.len().saturating_sub(keep);
        let garbage: Vec<_> = self.checkpoints.keys().take(discard).copied().collect();
        for checkpoint_id in &garbage {
            self.checkpoints.remove(checkpoint_id);
        }
        Ok(garbage.len())
    }

    fn record_job(&mut self, record: &JobRecord) -> HarnessResult<()> {
        self.jobs.insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    fn load_job(&self, job_id: &JobId) -> HarnessResult<Option<JobRecord>> {
        Ok(self.jobs.get(job_id).cloned())
    }
}

#[cfg(test)]
fn completed(id: u64) -> CompletedCheckpoint {
    CompletedCheckpoint {
        id: CheckpointId(id),
        attempt: Attempt(0),
        triggered_at: chrono::Utc::now(),
        completed_at: chrono::Utc::now(),
        snapshots: BTreeMap::from([(TaskId::new(0, 0), StateBytes(vec![id as u8]))]),
    }
}

#[test]
fn load_latest_returns_highest_id() {
    let mut store = InMemStore::new();
    assert_eq!(store.load_latest().unwrap(), None);

    store.save_completed(&completed(2)).unwrap();
    store.save_completed(&completed(1)).unwrap();

    let found = store.load_latest().unwrap().unwrap();
    assert_eq!(found.id, CheckpointId(2));
    assert_eq!(
        found.snapshots,
        BTreeMap::from([(TaskId::new(0, 0), StateBytes(vec![2]))])
    );
}

#[test]
fn retain_latest_discards_oldest() {
    let mut store = InMemStore::new();
    for id in 1..=4 {
        store.save_completed(&completed(id)).unwrap();
    }

    assert_eq!(store.retain_latest(2).unwrap(), 2);
    assert_eq!(store.checkpoint_ids(), vec![CheckpointId(3), CheckpointId(4)]);
    assert_eq!(store.retain_latest(2).unwrap(), 0);
}

#[test]
fn job_record_upserts() {
    let mut store = InMemStore::new();
    let job_id = JobId("job".to_string());
    let mut record = JobRecord {
        job_id: job_id.clone(),
        status: JobStatus::Running,
        attempt: Attempt(0),
        last_completed: None,
        failure: None,
        updated_at: chrono::Utc::now(),
    };
    store.record_job(&record).unwrap();
    record.status = JobStatus::Finished;
    record.last_completed = Some(CheckpointId(3));
    store.record_job(&record).unwrap();

    assert_eq!(store.load_job(&job_id).unwrap(), Some(record));
    assert_eq!(store.load_job(&JobId("other".to_string())).unwrap(), None);
}
