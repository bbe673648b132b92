//! Submitting pipelines to a cluster.
//!
//! A [`Cluster`] is the process × slot topology jobs are deployed on.
//! Processes are simulated: every task is a thread in the current
//! process, named after the process and slot it would run in.
//!
//! ```
//! use std::time::Duration;
//!
//! use faultline::config::JobConfig;
//! use faultline::pipeline::Pipeline;
//! use faultline::run::Cluster;
//! use faultline::testing::{CollectOutput, TestingInput};
//! use serde_json::json;
//!
//! let out = CollectOutput::new();
//! let mut pipeline = Pipeline::new("plus-one");
//! pipeline
//!     .input("inp", TestingInput::new((0..10).map(|i| json!(i)).collect()))
//!     .map("plus-one", |x| json!(x.as_i64().unwrap_or(0) + 1))
//!     .output("out", out.clone());
//!
//! let cluster = Cluster::new(JobConfig::default()).unwrap();
//! let completion = cluster.execute(&pipeline).unwrap();
//! assert!(completion.is_finished());
//! assert_eq!(out.len(), 10);
//! ```

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;

use crate::config::JobConfig;
use crate::errors::HarnessResult;
use crate::errors::Reraise;
use crate::execution::graph::ExecutionGraph;
use crate::execution::master::JobMaster;
use crate::execution::JobHandle;
use crate::metrics::initialize_metrics;
use crate::oracle::Completion;
use crate::oracle::CompletionOracle;
use crate::pipeline::Pipeline;
use crate::recovery::model::JobId;
use crate::recovery::store::open_store;
use crate::webserver::api_port;
use crate::webserver::run_webserver;

static NEXT_JOB: AtomicU64 = AtomicU64::new(0);

/// Job IDs key everything in a checkpoint store, and a store file can
/// outlive the process. The random suffix keeps runs of the same
/// pipeline in different processes apart.
fn new_job_id(name: &str, seq: u64) -> JobId {
    JobId(format!("{name}-{seq}-{:016x}", fastrand::u64(..)))
}

/// Serve the job API on its own small runtime; the server stops when
/// the runtime is dropped.
fn start_server_runtime(pipeline: &Pipeline, oracle: CompletionOracle) -> HarnessResult<Runtime> {
    // The pipeline is fixed for the whole run.
    let pipeline_json = pipeline.describe();
    let port = api_port()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("webserver-threads")
        .enable_all()
        .build()
        .reraise("error initializing tokio runtime for webserver")?;
    rt.spawn(async move {
        if let Err(err) = run_webserver(pipeline_json, oracle, port).await {
            tracing::error!("Job API server stopped: {err}");
        }
    });
    Ok(rt)
}

/// Where jobs run.
///
/// A cluster can run any number of jobs, one after another or at the
/// same time; each job run has its own master, coordinator and
/// checkpoint store.
pub struct Cluster {
    config: JobConfig,
}

impl Cluster {
    pub fn new(config: JobConfig) -> HarnessResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Start running a pipeline. Returns as soon as the job master is
    /// up; use the handle to follow the job.
    pub fn submit(&self, pipeline: &Pipeline) -> HarnessResult<JobHandle> {
        initialize_metrics()?;

        let job_id = new_job_id(pipeline.name(), NEXT_JOB.fetch_add(1, Ordering::Relaxed));
        let graph = Arc::new(
            ExecutionGraph::compile(pipeline, &self.config.cluster)
                .reraise_with(|| format!("error compiling pipeline {:?}", pipeline.name()))?,
        );
        let store = open_store(&self.config.store, &job_id)
            .reraise_with(|| format!("error opening checkpoint store for job {job_id}"))?;
        tracing::info!(
            "Submitting job {job_id} with {} stages × {} instances",
            graph.stage_count(),
            graph.parallelism()
        );

        let handle = JobMaster::spawn(job_id, graph, self.config.clone(), store)?;
        if std::env::var("FAULTLINE_API_ENABLED").is_ok() {
            let rt = start_server_runtime(pipeline, handle.oracle().clone())?;
            Ok(handle.with_server(rt))
        } else {
            Ok(handle)
        }
    }

    /// Run a pipeline and block until it finishes or fails.
    pub fn execute(&self, pipeline: &Pipeline) -> HarnessResult<Completion> {
        let handle = self.submit(pipeline)?;
        Ok(handle.wait_for_completion(Duration::MAX))
    }
}

#[test]
fn invalid_config_is_rejected() {
    let mut config = JobConfig::default();
    config.cluster.processes = 0;
    assert!(Cluster::new(config).is_err());
}

#[test]
fn job_ids_are_unique() {
    use crate::testing::CollectOutput;
    use crate::testing::TestingInput;

    let cluster = Cluster::new(JobConfig::default()).unwrap();
    let mut pipeline = Pipeline::new("ids");
    pipeline
        .input("inp", TestingInput::new(Vec::new()))
        .output("out", CollectOutput::new());
    let first = cluster.submit(&pipeline).unwrap();
    let second = cluster.submit(&pipeline).unwrap();
    assert_ne!(first.job_id(), second.job_id());
    assert!(first.job_id().0.starts_with("ids-"));
    assert!(first.wait_for_completion(Duration::from_secs(30)).is_finished());
    assert!(second.wait_for_completion(Duration::from_secs(30)).is_finished());
}

#[test]
fn job_ids_differ_across_processes() {
    // Every process numbers its jobs from zero.
    let a = new_job_id("nightly", 0);
    let b = new_job_id("nightly", 0);
    assert!(a.0.starts_with("nightly-0-"));
    assert_ne!(a, b);
}
