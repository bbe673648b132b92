//! Data model naming the parts of a job run and tracking where it is
//! in its lifecycle.

use std::fmt::Display;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Identifies a single submitted job.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl Display for JobId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.write_str(&self.0)
    }
}

/// Monotonically increasing ID for a checkpoint within a job.
///
/// IDs are never reused, even across recovery attempts.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId(pub u64);

impl CheckpointId {
    /// The first checkpoint a job triggers.
    pub const FIRST: CheckpointId = CheckpointId(1);

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for CheckpointId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "chk-{}", self.0)
    }
}

/// Incrementing number for each deployment of a job's tasks.
///
/// Every message a task sends and every barrier is labeled with the
/// attempt it belongs to, so anything from a superseded deployment
/// can be told apart and dropped.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Attempt(pub u64);

impl Attempt {
    pub const INITIAL: Attempt = Attempt(0);

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Attempt {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "{}", self.0)
    }
}

/// Position of a stage in the execution graph, counted from the
/// sources.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageIndex(pub usize);

/// Which parallel instance of a stage.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceIndex(pub usize);

/// One parallel instance of one stage.
///
/// Ordering is by stage then instance.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub stage: StageIndex,
    pub instance: InstanceIndex,
}

impl TaskId {
    pub fn new(stage: usize, instance: usize) -> Self {
        Self {
            stage: StageIndex(stage),
            instance: InstanceIndex(instance),
        }
    }
}

impl Display for TaskId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "{}.{}", self.stage.0, self.instance.0)
    }
}

/// Lifecycle of a job run.
///
/// `Finished` and `Failed` are terminal.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Recovering,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "RUNNING",
            JobStatus::Recovering => "RECOVERING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub(crate) fn parse(status: &str) -> Option<Self> {
        match status {
            "RUNNING" => Some(JobStatus::Running),
            "RECOVERING" => Some(JobStatus::Recovering),
            "FINISHED" => Some(JobStatus::Finished),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.write_str(self.as_str())
    }
}

/// Why a job ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// A task failed and there was no completed checkpoint to restore
    /// the job's state from.
    RecoveryExhausted,
    /// A task failed after the configured number of restarts was
    /// already used up.
    RestartsExhausted { restarts: u32 },
    /// The job was cancelled through its handle.
    Cancelled,
    /// The runtime itself broke; the message says how.
    Internal(String),
}

impl Display for FailureReason {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match self {
            FailureReason::RecoveryExhausted => {
                fmt.write_str("recovery exhausted: no completed checkpoint to restore from")
            }
            FailureReason::RestartsExhausted { restarts } => {
                write!(fmt, "restarts exhausted after {restarts} restarts")
            }
            FailureReason::Cancelled => fmt.write_str("cancelled"),
            FailureReason::Internal(msg) => write!(fmt, "internal error: {msg}"),
        }
    }
}

/// One recovery performed during a job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    /// Attempt that was started by this recovery.
    pub attempt: Attempt,
    /// Checkpoint whose state the new attempt was seeded with, if any.
    pub restored_from: Option<CheckpointId>,
    pub failed_task: TaskId,
    pub cause: String,
    pub at: DateTime<Utc>,
}

#[test]
fn task_id_orders_by_stage_then_instance() {
    let mut ids = vec![TaskId::new(1, 0), TaskId::new(0, 2), TaskId::new(0, 1)];
    ids.sort();
    assert_eq!(
        ids,
        vec![TaskId::new(0, 1), TaskId::new(0, 2), TaskId::new(1, 0)]
    );
    assert_eq!(TaskId::new(1, 4).to_string(), "1.4");
}

#[test]
fn job_status_str_round_trip() {
    for status in [
        JobStatus::Running,
        JobStatus::Recovering,
        JobStatus::Finished,
        JobStatus::Failed,
    ] {
        assert_eq!(JobStatus::parse(status.as_str()), Some(status));
    }
    assert_eq!(JobStatus::parse("PAUSED"), None);
}

#[test]
fn checkpoint_id_serde_tokens() {
    use serde_test::assert_tokens;
    use serde_test::Token;

    assert_tokens(
        &CheckpointId(3),
        &[Token::NewtypeStruct { name: "CheckpointId" }, Token::U64(3)],
    );
    assert_tokens(
        &JobStatus::Recovering,
        &[Token::UnitVariant {
            name: "JobStatus",
            variant: "RECOVERING",
        }],
    );
}
