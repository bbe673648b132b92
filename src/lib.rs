//! Checkpoint coordination and recovery for testing stream jobs under
//! failures.
//!
//! A [`pipeline::Pipeline`] is submitted to a [`run::Cluster`], which
//! compiles it into stages of parallel tasks, one thread each. While
//! the job runs, its master periodically injects checkpoint barriers
//! at the sources; every task snapshots its state once a barrier has
//! arrived on all of its inputs, and a checkpoint is complete once
//! every task acknowledged it. When any task fails, all tasks are
//! restarted from the latest completed checkpoint.
//!
//! The [`oracle::CompletionOracle`] of a job is how test code knows
//! when it is safe to look at the job's outputs.
//!
//! Internal code lives in the modules below; see each for how the
//! parts fit together.

pub(crate) mod barrier;
pub mod config;
pub mod errors;
pub mod execution;
pub mod inputs;
pub(crate) mod metrics;
pub(crate) mod operators;
pub mod oracle;
pub mod outputs;
pub mod pipeline;
pub mod recovery;
pub mod run;
pub mod testing;
pub mod tracing;
pub(crate) mod webserver;
pub(crate) mod worker;

/// Items flowing through a pipeline.
pub type Item = serde_json::Value;

pub use crate::config::JobConfig;
pub use crate::errors::HarnessError;
pub use crate::errors::HarnessResult;
pub use crate::execution::JobHandle;
pub use crate::oracle::Completion;
pub use crate::oracle::CompletionOracle;
pub use crate::pipeline::Pipeline;
pub use crate::run::Cluster;
