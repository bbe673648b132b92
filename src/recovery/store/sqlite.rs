//! SQLite implementation of a checkpoint store.
//!
//! Several jobs can share one database file; every row is keyed by
//! the job ID the store was opened for.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use super::CheckpointStore;
use super::JobRecord;
use crate::errors::tracked_err;
use crate::errors::HarnessError;
use crate::errors::HarnessResult;
use crate::errors::Reraise;
use crate::recovery::model::*;

fn get_migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE checkpoints ( \
             job_id TEXT NOT NULL, \
             checkpoint_id INTEGER NOT NULL CHECK (checkpoint_id > 0), \
             attempt INTEGER NOT NULL CHECK (attempt >= 0), \
             triggered_at TEXT NOT NULL, \
             completed_at TEXT NOT NULL, \
             PRIMARY KEY (job_id, checkpoint_id) \
             ) STRICT",
        ),
        // One row per task snapshot; goes away with its checkpoint.
        M::up(
            "CREATE TABLE snapshots ( \
             job_id TEXT NOT NULL, \
             checkpoint_id INTEGER NOT NULL, \
             stage INTEGER NOT NULL CHECK (stage >= 0), \
             instance INTEGER NOT NULL CHECK (instance >= 0), \
             state BLOB NOT NULL, \
             PRIMARY KEY (job_id, checkpoint_id, stage, instance), \
             FOREIGN KEY (job_id, checkpoint_id) \
             REFERENCES checkpoints (job_id, checkpoint_id) ON DELETE CASCADE \
             ) STRICT",
        ),
        M::up(
            "CREATE TABLE job_runs ( \
             job_id TEXT NOT NULL PRIMARY KEY, \
             status TEXT NOT NULL, \
             attempt INTEGER NOT NULL CHECK (attempt >= 0), \
             last_completed INTEGER, \
             failure TEXT, \
             updated_at TEXT NOT NULL \
             ) STRICT",
        ),
    ])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> HarnessResult<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations().to_latest(conn)?;
    Ok(())
}

fn parse_ts(raw: &str) -> HarnessResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            tracked_err(
                HarnessError::Store,
                &format!("bad timestamp {raw:?} in checkpoint DB: {err}"),
            )
        })
}

pub struct SqliteStore {
    conn: Connection,
    job_id: JobId,
}

impl SqliteStore {
    /// Open, creating if needed, a database file.
    pub fn open(db_file: &Path, job_id: JobId) -> HarnessResult<Self> {
        tracing::info!("Opening checkpoint store for job {job_id} at {db_file:?}");
        let conn = Connection::open_with_flags(
            db_file,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .reraise_with(|| format!("can't open checkpoint DB at {db_file:?}"))?;
        Self::setup(conn, job_id)
    }

    pub fn open_in_memory(job_id: JobId) -> HarnessResult<Self> {
        let conn = Connection::open_in_memory().reraise("can't open in-memory checkpoint DB")?;
        Self::setup(conn, job_id)
    }

    fn setup(mut conn: Connection, job_id: JobId) -> HarnessResult<Self> {
        setup_conn(&mut conn)?;
        Ok(Self { conn, job_id })
    }

    pub fn checkpoint_ids(&self) -> HarnessResult<Vec<CheckpointId>> {
        let mut stmt = self.conn.prepare(
            "SELECT checkpoint_id \
             FROM checkpoints \
             WHERE job_id = ?1 \
             ORDER BY checkpoint_id",
        )?;
        let ids = stmt
            .query_map((&self.job_id.0,), |row| Ok(CheckpointId(row.get(0)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

impl CheckpointStore for SqliteStore {
    fn save_completed(&mut self, checkpoint: &CompletedCheckpoint) -> HarnessResult<()> {
        tracing::trace!("Writing checkpoint {}", checkpoint.id);
        let txn = self.conn.transaction()?;
        txn.execute(
            "INSERT INTO checkpoints (job_id, checkpoint_id, attempt, triggered_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (job_id, checkpoint_id) DO UPDATE \
             SET attempt = EXCLUDED.attempt, \
             triggered_at = EXCLUDED.triggered_at, \
             completed_at = EXCLUDED.completed_at",
            (
                &self.job_id.0,
                checkpoint.id.0,
                checkpoint.attempt.0,
                checkpoint.triggered_at.to_rfc3339(),
                checkpoint.completed_at.to_rfc3339(),
            ),
        )?;
        for (task, state) in &checkpoint.snapshots {
            txn.execute(
                "INSERT INTO snapshots (job_id, checkpoint_id, stage, instance, state) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (job_id, checkpoint_id, stage, instance) DO UPDATE \
                 SET state = EXCLUDED.state",
                (
                    &self.job_id.0,
                    checkpoint.id.0,
                    task.stage.0,
                    task.instance.0,
                    &state.0,
                ),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    fn load_latest(&self) -> HarnessResult<Option<CompletedCheckpoint>> {
        let head = self
            .conn
            .query_row(
                "SELECT checkpoint_id, attempt, triggered_at, completed_at \
                 FROM checkpoints \
                 WHERE job_id = ?1 \
                 ORDER BY checkpoint_id DESC \
                 LIMIT 1",
                (&self.job_id.0,),
                |row| {
                    Ok((
                        CheckpointId(row.get(0)?),
                        Attempt(row.get(1)?),
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, attempt, triggered_at, completed_at)) = head else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT stage, instance, state \
             FROM snapshots \
             WHERE job_id = ?1 AND checkpoint_id = ?2",
        )?;
        let snapshots = stmt
            .query_map((&self.job_id.0, id.0), |row| {
                Ok((
                    TaskId::new(row.get(0)?, row.get(1)?),
                    StateBytes(row.get(2)?),
                ))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(Some(CompletedCheckpoint {
            id,
            attempt,
            triggered_at: parse_ts(&triggered_at)?,
            completed_at: parse_ts(&completed_at)?,
            snapshots,
        }))
    }

    fn retain_latest(&mut self, keep: usize) -> HarnessResult<usize> {
        let removed = self.conn.execute(
            "DELETE FROM checkpoints \
             WHERE job_id = ?1 AND checkpoint_id NOT IN ( \
             SELECT checkpoint_id FROM checkpoints \
             WHERE job_id = ?1 \
             ORDER BY checkpoint_id DESC \
             LIMIT ?2 \
             )",
            (&self.job_id.0, keep),
        )?;
        if removed > 0 {
            tracing::debug!("Discarded {removed} old checkpoints of job {}", self.job_id);
        }
        Ok(removed)
    }

    fn record_job(&mut self, record: &JobRecord) -> HarnessResult<()> {
        self.conn.execute(
            "INSERT INTO job_runs (job_id, status, attempt, last_completed, failure, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (job_id) DO UPDATE \
             SET status = EXCLUDED.status, \
             attempt = EXCLUDED.attempt, \
             last_completed = EXCLUDED.last_completed, \
             failure = EXCLUDED.failure, \
             updated_at = EXCLUDED.updated_at",
            (
                &record.job_id.0,
                record.status.as_str(),
                record.attempt.0,
                record.last_completed.map(|id| id.0),
                &record.failure,
                record.updated_at.to_rfc3339(),
            ),
        )?;
        Ok(())
    }

    fn load_job(&self, job_id: &JobId) -> HarnessResult<Option<JobRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT status, attempt, last_completed, failure, updated_at \
                 FROM job_runs \
                 WHERE job_id = ?1",
                (&job_id.0,),
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        Attempt(row.get(1)?),
                        row.get::<_, Option<u64>>(2)?.map(CheckpointId),
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((status, attempt, last_completed, failure, updated_at)) = row else {
            return Ok(None);
        };
        let status = JobStatus::parse(&status).ok_or_else(|| {
            tracked_err(
                HarnessError::Store,
                &format!("unknown job status {status:?} in checkpoint DB"),
            )
        })?;
        Ok(Some(JobRecord {
            job_id: job_id.clone(),
            status,
            attempt,
            last_completed,
            failure,
            updated_at: parse_ts(&updated_at)?,
        }))
    }
}

#[cfg(test)]
fn completed(id: u64, tasks: usize) -> CompletedCheckpoint {
    CompletedCheckpoint {
        id: CheckpointId(id),
        attempt: Attempt(1),
        triggered_at: Utc::now(),
        completed_at: Utc::now(),
        snapshots: (0..tasks)
            .map(|i| (TaskId::new(i % 2, i / 2), StateBytes(format!("{id}-{i}").into_bytes())))
            .collect(),
    }
}

#[test]
fn save_then_load_latest() {
    let dir = tempfile::tempdir().unwrap();
    let db_file = dir.path().join("checkpoints.sqlite3");
    let job_id = JobId("wc-1".to_string());

    let expected = completed(2, 4);
    {
        let mut store = SqliteStore::open(&db_file, job_id.clone()).unwrap();
        store.save_completed(&completed(1, 4)).unwrap();
        store.save_completed(&expected).unwrap();
    }

    // Re-open to check it was durable.
    let store = SqliteStore::open(&db_file, job_id).unwrap();
    let found = store.load_latest().unwrap().unwrap();
    assert_eq!(found.id, expected.id);
    assert_eq!(found.attempt, expected.attempt);
    assert_eq!(found.snapshots, expected.snapshots);
    assert_eq!(
        found.completed_at.timestamp_micros(),
        expected.completed_at.timestamp_micros()
    );
}

#[test]
fn retain_latest_cascades_to_snapshots() {
    let mut store = SqliteStore::open_in_memory(JobId("job".to_string())).unwrap();
    for id in 1..=3 {
        store.save_completed(&completed(id, 3)).unwrap();
    }
    assert_eq!(store.retain_latest(1).unwrap(), 2);
    assert_eq!(store.checkpoint_ids().unwrap(), vec![CheckpointId(3)]);

    let snapshot_rows: u64 = store
        .conn
        .query_row("SELECT COUNT(*) FROM snapshots", (), |row| row.get(0))
        .unwrap();
    assert_eq!(snapshot_rows, 3);
}

#[test]
fn jobs_sharing_a_file_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let db_file = dir.path().join("shared.sqlite3");

    let mut a = SqliteStore::open(&db_file, JobId("a".to_string())).unwrap();
    let b = SqliteStore::open(&db_file, JobId("b".to_string())).unwrap();
    a.save_completed(&completed(5, 1)).unwrap();

    assert_eq!(b.load_latest().unwrap(), None);
    assert_eq!(a.load_latest().unwrap().unwrap().id, CheckpointId(5));
}

#[test]
fn job_record_round_trip() {
    let mut store = SqliteStore::open_in_memory(JobId("job".to_string())).unwrap();
    let job_id = JobId("job".to_string());
    assert_eq!(store.load_job(&job_id).unwrap(), None);

    let record = JobRecord {
        job_id: job_id.clone(),
        status: JobStatus::Failed,
        attempt: Attempt(2),
        last_completed: Some(CheckpointId(7)),
        failure: Some("recovery exhausted".to_string()),
        updated_at: Utc::now(),
    };
    store.record_job(&record).unwrap();
    let found = store.load_job(&job_id).unwrap().unwrap();
    assert_eq!(found.status, JobStatus::Failed);
    assert_eq!(found.attempt, Attempt(2));
    assert_eq!(found.last_completed, Some(CheckpointId(7)));
    assert_eq!(found.failure, record.failure);
}
