//! Recovering a job run from task failures.
//!
//! Recovery is restart-the-world: when any task of an attempt fails,
//! every task of that attempt is cancelled, and a new attempt is
//! deployed with every task restored from the latest completed
//! checkpoint. Nothing from the failed attempt survives except what
//! that checkpoint holds.
//!
//! Architecture
//! ------------
//!
//! Each attempt is numbered, and everything tasks send to the job
//! master (acks, declines, lifecycle events) and every barrier is
//! tagged with the attempt it belongs to. Once a new attempt starts,
//! anything tagged with an older one is dropped. That is what makes it
//! safe to detach task threads that don't stop in time: they can keep
//! running for a while, but nothing they say is listened to.
//!
//! Checkpoints themselves are produced by the coordinator in
//! [`crate::execution::coordinator`] and persisted in a
//! [`store::CheckpointStore`]. Only completed checkpoints are ever
//! restored from.
//!
//! A job with no stateful tasks has nothing to restore, so it can
//! always be restarted from empty state. A stateful job that fails
//! before its first checkpoint completed can't be recovered
//! consistently and fails with [`FailureReason::RecoveryExhausted`].

pub(crate) mod deployment;
pub mod model;
pub mod store;

use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use tracing::error;
use tracing::info;
use tracing::warn;

use self::deployment::Deployment;
use self::model::*;
use crate::config::JobConfig;
use crate::errors::HarnessResult;
use crate::execution::graph::ExecutionGraph;
use crate::execution::JobEvent;

/// Decides if and from where a failed attempt restarts, and deploys
/// attempts.
pub(crate) struct RecoveryManager {
    graph: Arc<ExecutionGraph>,
    config: JobConfig,
    events: Sender<JobEvent>,
    restarts: u32,
}

impl RecoveryManager {
    pub(crate) fn new(graph: Arc<ExecutionGraph>, config: JobConfig, events: Sender<JobEvent>) -> Self {
        Self {
            graph,
            config,
            events,
            restarts: 0,
        }
    }

    pub(crate) fn restarts(&self) -> u32 {
        self.restarts
    }

    pub(crate) fn deploy(
        &self,
        attempt: Attempt,
        restore: Option<&CompletedCheckpoint>,
    ) -> HarnessResult<Deployment> {
        Deployment::launch(&self.graph, attempt, restore, &self.config, &self.events)
    }

    /// Tear down a failed attempt and start `next_attempt` from
    /// `latest`.
    ///
    /// Returns the new deployment and the checkpoint it was restored
    /// from, or why the job can't go on.
    pub(crate) fn recover(
        &mut self,
        failed: Option<Deployment>,
        next_attempt: Attempt,
        latest: Option<&CompletedCheckpoint>,
    ) -> Result<(Deployment, Option<CheckpointId>), FailureReason> {
        if let Some(failed) = failed {
            let attempt = failed.attempt();
            let detached = failed.cancel(self.config.runtime.cancel_grace_period);
            if detached > 0 {
                warn!("{detached} tasks of attempt {attempt} were detached");
            }
        }

        if let Some(max_restarts) = self.config.runtime.max_restarts {
            if self.restarts >= max_restarts {
                error!("Giving up after {} restarts", self.restarts);
                return Err(FailureReason::RestartsExhausted {
                    restarts: self.restarts,
                });
            }
        }

        let restored_from = match latest {
            Some(checkpoint) => Some(checkpoint.id),
            None if self.graph.is_stateful() => {
                error!("No completed checkpoint to recover stateful tasks from");
                return Err(FailureReason::RecoveryExhausted);
            }
            None => None,
        };

        self.restarts += 1;
        let delay = self.config.runtime.restart_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        match restored_from {
            Some(checkpoint_id) => info!("Restarting as attempt {next_attempt} from {checkpoint_id}"),
            None => info!("Restarting as attempt {next_attempt} from empty state"),
        }
        let deployment = self
            .deploy(next_attempt, latest)
            .map_err(|err| FailureReason::Internal(err.to_string()))?;
        Ok((deployment, restored_from))
    }
}

#[cfg(test)]
fn counting_graph(stateful: bool) -> Arc<ExecutionGraph> {
    use crate::config::ClusterConfig;
    use crate::pipeline::Pipeline;
    use crate::testing::TestingInput;

    let input = if stateful {
        TestingInput::new(Vec::new())
    } else {
        TestingInput::new(Vec::new()).stateless()
    };
    let mut pipeline = Pipeline::new("recover");
    pipeline
        .input("inp", input)
        .output("out", crate::testing::CollectOutput::new());
    Arc::new(ExecutionGraph::compile(&pipeline, &ClusterConfig::new(1, 2)).unwrap())
}

#[test]
fn stateful_jobs_need_a_checkpoint() {
    let (tx, _rx) = crossbeam_channel::unbounded();
    let mut manager = RecoveryManager::new(counting_graph(true), JobConfig::default(), tx);
    let res = manager.recover(None, Attempt(1), None);
    assert!(matches!(res, Err(FailureReason::RecoveryExhausted)));
    assert_eq!(manager.restarts(), 0);
}

#[test]
fn stateless_jobs_restart_empty() {
    let (tx, _rx) = crossbeam_channel::unbounded();
    let mut manager = RecoveryManager::new(counting_graph(false), JobConfig::default(), tx);
    let (deployment, restored_from) = manager.recover(None, Attempt(1), None).unwrap();
    assert_eq!(restored_from, None);
    assert_eq!(deployment.attempt(), Attempt(1));
    assert_eq!(manager.restarts(), 1);
    deployment.cancel(std::time::Duration::from_secs(5));
}

#[test]
fn restarts_are_bounded() {
    let (tx, _rx) = crossbeam_channel::unbounded();
    let mut config = JobConfig::default();
    config.runtime.max_restarts = Some(1);
    let mut manager = RecoveryManager::new(counting_graph(false), config, tx);

    let (deployment, _) = manager.recover(None, Attempt(1), None).unwrap();
    let res = manager.recover(Some(deployment), Attempt(2), None);
    assert!(matches!(
        res,
        Err(FailureReason::RestartsExhausted { restarts: 1 })
    ));
}
