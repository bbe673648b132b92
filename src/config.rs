//! Configuration for submitting a job.
//!
//! Everything has a default that matches a small local test cluster,
//! can be overridden field by field, loaded from JSON, or adjusted
//! from `FAULTLINE_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::tracked_err;
use crate::errors::HarnessError;
use crate::errors::HarnessResult;
use crate::errors::Reraise;

/// How and how often checkpoints are taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Time between triggering consecutive checkpoints.
    pub interval: Duration,
    /// A pending checkpoint not fully acknowledged within this long is
    /// expired. `None` never expires checkpoints.
    pub expiry_timeout: Option<Duration>,
    /// Upper bound on checkpoints pending at once.
    pub max_concurrent_checkpoints: usize,
    /// Completed checkpoints kept in the store; older ones are
    /// discarded after each completion.
    pub retained_checkpoints: usize,
    /// Elements a task will hold back while aligning barriers before
    /// it declines the checkpoint.
    pub alignment_buffer_capacity: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            expiry_timeout: Some(Duration::from_secs(10)),
            max_concurrent_checkpoints: 1,
            retained_checkpoints: 1,
            alignment_buffer_capacity: 10_000,
        }
    }
}

impl CheckpointConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_expiry_timeout(mut self, expiry_timeout: Option<Duration>) -> Self {
        self.expiry_timeout = expiry_timeout;
        self
    }

    pub fn with_alignment_buffer_capacity(mut self, capacity: usize) -> Self {
        self.alignment_buffer_capacity = capacity;
        self
    }

    fn validate(&self) -> HarnessResult<()> {
        if self.interval.is_zero() {
            return Err(tracked_err(
                HarnessError::Config,
                "checkpoint interval must be greater than zero",
            ));
        }
        if self.max_concurrent_checkpoints == 0 {
            return Err(tracked_err(
                HarnessError::Config,
                "max_concurrent_checkpoints must be at least 1",
            ));
        }
        if self.retained_checkpoints == 0 {
            return Err(tracked_err(
                HarnessError::Config,
                "retained_checkpoints must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Shape of the simulated cluster.
///
/// Each process runs a group of task threads; the total parallelism
/// of every stage is `processes * workers_per_process`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub processes: usize,
    pub workers_per_process: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            processes: 2,
            workers_per_process: 3,
        }
    }
}

impl ClusterConfig {
    pub fn new(processes: usize, workers_per_process: usize) -> Self {
        Self {
            processes,
            workers_per_process,
        }
    }

    pub fn parallelism(&self) -> usize {
        self.processes * self.workers_per_process
    }

    fn validate(&self) -> HarnessResult<()> {
        if self.processes == 0 || self.workers_per_process == 0 {
            return Err(tracked_err(
                HarnessError::Config,
                "cluster needs at least one process with at least one worker",
            ));
        }
        Ok(())
    }
}

/// Knobs for the task runtime and recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of each task's input channel.
    pub channel_capacity: usize,
    /// How long a cancelled deployment gets to stop on its own before
    /// its remaining threads are abandoned.
    pub cancel_grace_period: Duration,
    /// Pause before redeploying after a failure.
    pub restart_delay: Duration,
    /// Give up after this many recoveries. `None` keeps recovering as
    /// long as there is a checkpoint to recover from.
    pub max_restarts: Option<u32>,
    /// How long idle tasks sleep before polling again.
    pub idle_cooldown: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            cancel_grace_period: Duration::from_secs(2),
            restart_delay: Duration::ZERO,
            max_restarts: None,
            idle_cooldown: Duration::from_millis(1),
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> HarnessResult<()> {
        if self.channel_capacity == 0 {
            return Err(tracked_err(
                HarnessError::Config,
                "channel_capacity must be at least 1",
            ));
        }
        if self.idle_cooldown.is_zero() {
            return Err(tracked_err(
                HarnessError::Config,
                "idle_cooldown must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Where completed checkpoints and the job record are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    InMemory,
    /// A SQLite database file, created if missing.
    Sqlite { db_file: PathBuf },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::InMemory
    }
}

/// Everything needed to run a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub checkpoint: CheckpointConfig,
    pub cluster: ClusterConfig,
    pub runtime: RuntimeConfig,
    pub store: StoreConfig,
}

impl JobConfig {
    /// Defaults overridden by any `FAULTLINE_*` environment variables
    /// that are set.
    pub fn from_env() -> HarnessResult<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> HarnessResult<Self> {
        let config: Self = serde_json::from_str(json).reraise("error parsing job config")?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from variables found through `lookup`.
    pub(crate) fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> HarnessResult<()> {
        if let Some(ms) = parse_var::<u64>(&lookup, "FAULTLINE_CHECKPOINT_INTERVAL_MS")? {
            self.checkpoint.interval = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("FAULTLINE_CHECKPOINT_TIMEOUT_MS") {
            self.checkpoint.expiry_timeout = match raw.trim() {
                "none" | "" => None,
                ms => Some(Duration::from_millis(ms.parse().map_err(|_| {
                    tracked_err(
                        HarnessError::Config,
                        &format!("FAULTLINE_CHECKPOINT_TIMEOUT_MS must be milliseconds or 'none'; got {raw:?}"),
                    )
                })?)),
            };
        }
        if let Some(processes) = parse_var(&lookup, "FAULTLINE_PROCESSES")? {
            self.cluster.processes = processes;
        }
        if let Some(workers) = parse_var(&lookup, "FAULTLINE_WORKERS_PER_PROCESS")? {
            self.cluster.workers_per_process = workers;
        }
        if let Some(path) = lookup("FAULTLINE_SQLITE_DB") {
            self.store = StoreConfig::Sqlite {
                db_file: PathBuf::from(path),
            };
        }
        self.validate()
    }

    pub fn validate(&self) -> HarnessResult<()> {
        self.checkpoint.validate()?;
        self.cluster.validate()?;
        self.runtime.validate()
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> HarnessResult<Option<T>> {
    match lookup(name) {
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            tracked_err(
                HarnessError::Config,
                &format!("{name} must be a non-negative integer; got {raw:?}"),
            )
        }),
        None => Ok(None),
    }
}

#[test]
fn defaults_match_test_cluster() {
    let config = JobConfig::default();
    assert_eq!(config.checkpoint.interval, Duration::from_millis(500));
    assert_eq!(config.checkpoint.expiry_timeout, Some(Duration::from_secs(10)));
    assert_eq!(config.cluster.parallelism(), 6);
    assert_eq!(config.runtime.restart_delay, Duration::ZERO);
    assert_eq!(config.store, StoreConfig::InMemory);
    config.validate().unwrap();
}

#[test]
fn env_overrides() {
    use std::collections::HashMap;

    let vars = HashMap::from([
        ("FAULTLINE_CHECKPOINT_INTERVAL_MS", "100"),
        ("FAULTLINE_CHECKPOINT_TIMEOUT_MS", "none"),
        ("FAULTLINE_PROCESSES", "1"),
        ("FAULTLINE_WORKERS_PER_PROCESS", "4"),
    ]);
    let mut config = JobConfig::default();
    config
        .apply_env(|name| vars.get(name).map(|v| v.to_string()))
        .unwrap();

    assert_eq!(config.checkpoint.interval, Duration::from_millis(100));
    assert_eq!(config.checkpoint.expiry_timeout, None);
    assert_eq!(config.cluster, ClusterConfig::new(1, 4));
}

#[test]
fn env_rejects_garbage() {
    let mut config = JobConfig::default();
    let err = config
        .apply_env(|name| (name == "FAULTLINE_PROCESSES").then(|| "two".to_string()))
        .unwrap_err();
    assert!(matches!(err, HarnessError::Config(_)));
    assert!(err.to_string().contains("FAULTLINE_PROCESSES"));
}

#[test]
fn validation_rejects_zero_parallelism() {
    let mut config = JobConfig::default();
    config.cluster.workers_per_process = 0;
    assert!(matches!(config.validate(), Err(HarnessError::Config(_))));
}

#[test]
fn from_json_fills_defaults() {
    let config = JobConfig::from_json(
        r#"{"checkpoint": {"interval": {"secs": 0, "nanos": 50000000}}, "store": {"type": "sqlite", "db_file": "/tmp/x.sqlite3"}}"#,
    )
    .unwrap();
    assert_eq!(config.checkpoint.interval, Duration::from_millis(50));
    assert_eq!(config.checkpoint.max_concurrent_checkpoints, 1);
    assert_eq!(
        config.store,
        StoreConfig::Sqlite {
            db_file: PathBuf::from("/tmp/x.sqlite3")
        }
    );
}
