//! Implementations of checkpoint stores.
//!
//! A store keeps the completed checkpoints of one job, and the
//! durable record of how that job is doing. Only completed
//! checkpoints are ever written; partial snapshots of pending ones
//! live in the coordinator until they complete or are discarded.
//!
//! There is one trait you'll have to implement to make a new store:
//! [`CheckpointStore`].

pub(crate) mod in_mem;
pub(crate) mod sqlite;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

pub use in_mem::InMemStore;
pub use sqlite::SqliteStore;

use crate::config::StoreConfig;
use crate::errors::HarnessResult;
use crate::recovery::model::*;

/// What a job run looked like the last time its status or progress
/// changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempt: Attempt,
    pub last_completed: Option<CheckpointId>,
    /// Set once the job failed.
    pub failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub trait CheckpointStore: Send {
    fn save_completed(&mut self, checkpoint: &CompletedCheckpoint) -> HarnessResult<()>;

    /// The completed checkpoint with the highest ID, if any.
    fn load_latest(&self) -> HarnessResult<Option<CompletedCheckpoint>>;

    /// Discard all but the `keep` newest completed checkpoints.
    /// Returns how many were discarded.
    fn retain_latest(&mut self, keep: usize) -> HarnessResult<usize>;

    fn record_job(&mut self, record: &JobRecord) -> HarnessResult<()>;

    fn load_job(&self, job_id: &JobId) -> HarnessResult<Option<JobRecord>>;
}

pub(crate) fn open_store(
    config: &StoreConfig,
    job_id: &JobId,
) -> HarnessResult<Box<dyn CheckpointStore>> {
    match config {
        StoreConfig::InMemory => Ok(Box::new(InMemStore::new())),
        StoreConfig::Sqlite { db_file } => Ok(Box::new(SqliteStore::open(db_file, job_id.clone())?)),
    }
}
