//! Internal code for job run execution.
//!
//! Every job run has a single job master thread, see
//! [`master::JobMaster`]. It alone owns the checkpoint coordinator,
//! the recovery manager and the checkpoint store; tasks and the
//! [`JobHandle`] only ever talk to it by sending [`JobEvent`]s, which
//! it processes one at a time. That way no state about a job run is
//! ever shared between threads, except the read-only view published
//! through the [`CompletionOracle`].

pub(crate) mod coordinator;
pub mod graph;
pub(crate) mod master;

pub use coordinator::CheckpointStats;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;

use self::graph::ExecutionGraph;
use crate::errors::tracked_err;
use crate::errors::HarnessError;
use crate::errors::HarnessResult;
use crate::oracle::Completion;
use crate::oracle::CompletionOracle;
use crate::recovery::model::*;

/// Everything the job master reacts to.
#[derive(Debug)]
pub(crate) enum JobEvent {
    /// A task is built, restored and about to process.
    Running { attempt: Attempt, task: TaskId },
    Acknowledge(Ack),
    Decline(Decline),
    /// A task reached the end of its input and flushed its outputs.
    Finished { attempt: Attempt, task: TaskId },
    Failed {
        attempt: Attempt,
        task: TaskId,
        reason: String,
    },
    InjectFailure(TaskId),
    Cancel,
}

impl JobEvent {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            JobEvent::Running { .. } => "running",
            JobEvent::Acknowledge(_) => "acknowledge",
            JobEvent::Decline(_) => "decline",
            JobEvent::Finished { .. } => "finished",
            JobEvent::Failed { .. } => "failed",
            JobEvent::InjectFailure(_) => "inject_failure",
            JobEvent::Cancel => "cancel",
        }
    }

    /// The attempt this event was sent from, if it came from a task.
    pub(crate) fn attempt(&self) -> Option<Attempt> {
        match self {
            JobEvent::Running { attempt, .. }
            | JobEvent::Finished { attempt, .. }
            | JobEvent::Failed { attempt, .. } => Some(*attempt),
            JobEvent::Acknowledge(ack) => Some(ack.attempt),
            JobEvent::Decline(decline) => Some(decline.attempt),
            JobEvent::InjectFailure(_) | JobEvent::Cancel => None,
        }
    }
}

/// A submitted job run.
///
/// Dropping the handle doesn't stop the job; it runs until it
/// finishes or fails.
pub struct JobHandle {
    job_id: JobId,
    events: Sender<JobEvent>,
    oracle: CompletionOracle,
    graph: Arc<ExecutionGraph>,
    /// Keeps the status webserver alive, when there is one.
    _server_rt: Option<tokio::runtime::Runtime>,
}

impl JobHandle {
    pub(crate) fn new(
        job_id: JobId,
        events: Sender<JobEvent>,
        oracle: CompletionOracle,
        graph: Arc<ExecutionGraph>,
    ) -> Self {
        Self {
            job_id,
            events,
            oracle,
            graph,
            _server_rt: None,
        }
    }

    pub(crate) fn with_server(mut self, rt: tokio::runtime::Runtime) -> Self {
        self._server_rt = Some(rt);
        self
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn oracle(&self) -> &CompletionOracle {
        &self.oracle
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn task_ids(&self) -> BTreeSet<TaskId> {
        self.graph.task_ids()
    }

    /// Make a task of the current attempt fail as if it crashed.
    pub fn inject_failure(&self, task: TaskId) -> HarnessResult<()> {
        if !self.graph.task_ids().contains(&task) {
            return Err(tracked_err(
                HarnessError::Runtime,
                &format!("job {} has no task {task}", self.job_id),
            ));
        }
        self.send(JobEvent::InjectFailure(task))
    }

    /// Stop the job; it ends as failed with
    /// [`FailureReason::Cancelled`].
    pub fn cancel(&self) -> HarnessResult<()> {
        self.send(JobEvent::Cancel)
    }

    pub fn wait_for_completion(&self, timeout: Duration) -> Completion {
        self.oracle.wait_for_completion(timeout)
    }

    fn send(&self, event: JobEvent) -> HarnessResult<()> {
        if self.oracle.status().is_terminal() {
            return Err(tracked_err(
                HarnessError::Runtime,
                &format!("job {} already ended", self.job_id),
            ));
        }
        self.events.send(event).map_err(|_| {
            tracked_err(
                HarnessError::Runtime,
                &format!("job master of {} is gone", self.job_id),
            )
        })
    }
}

#[test]
fn events_know_their_attempt() {
    let task = TaskId::new(0, 1);
    let ev = JobEvent::Running {
        attempt: Attempt(3),
        task,
    };
    assert_eq!(ev.kind(), "running");
    assert_eq!(ev.attempt(), Some(Attempt(3)));
    assert_eq!(JobEvent::InjectFailure(task).attempt(), None);
    assert_eq!(JobEvent::Cancel.kind(), "cancel");
}
