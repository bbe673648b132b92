//! The job master: the single writer of a job run's state.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use super::coordinator::until;
use super::coordinator::AckOutcome;
use super::coordinator::CheckpointCoordinator;
use super::coordinator::CheckpointStats;
use super::graph::ExecutionGraph;
use super::JobEvent;
use super::JobHandle;
use crate::config::JobConfig;
use crate::errors::HarnessError;
use crate::errors::HarnessResult;
use crate::errors::Reraise;
use crate::metrics::CheckpointMetrics;
use crate::metrics::JobMetrics;
use crate::oracle::CompletionOracle;
use crate::recovery::deployment::Deployment;
use crate::recovery::model::*;
use crate::recovery::store::CheckpointStore;
use crate::recovery::store::JobRecord;
use crate::recovery::RecoveryManager;

/// Longest the master sleeps without looking at the clock.
const MAX_IDLE: Duration = Duration::from_millis(50);

pub(crate) struct JobMaster {
    job_id: JobId,
    config: JobConfig,
    tasks: BTreeSet<TaskId>,
    coordinator: CheckpointCoordinator,
    recovery: RecoveryManager,
    store: Box<dyn CheckpointStore>,
    oracle: CompletionOracle,
    metrics: JobMetrics,
    events: Receiver<JobEvent>,
    deployment: Option<Deployment>,
    attempt: Attempt,
    status: JobStatus,
    running: BTreeSet<TaskId>,
    finished: BTreeSet<TaskId>,
    published_stats: CheckpointStats,
}

impl JobMaster {
    /// Start the master thread for a job run and deploy its first
    /// attempt from there.
    pub(crate) fn spawn(
        job_id: JobId,
        graph: Arc<ExecutionGraph>,
        config: JobConfig,
        store: Box<dyn CheckpointStore>,
    ) -> HarnessResult<JobHandle> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let oracle = CompletionOracle::new(job_id.clone());
        let tasks = graph.task_ids();

        let master = JobMaster {
            job_id: job_id.clone(),
            coordinator: CheckpointCoordinator::new(
                config.checkpoint.clone(),
                tasks.clone(),
                CheckpointMetrics::new(&job_id),
            ),
            recovery: RecoveryManager::new(graph.clone(), config.clone(), events_tx.clone()),
            config,
            tasks,
            store,
            oracle: oracle.clone(),
            metrics: JobMetrics::new(&job_id),
            events: events_rx,
            deployment: None,
            attempt: Attempt::INITIAL,
            status: JobStatus::Running,
            running: BTreeSet::new(),
            finished: BTreeSet::new(),
            published_stats: CheckpointStats::default(),
        };
        thread::Builder::new()
            .name(format!("faultline-master-{job_id}"))
            .spawn(move || master.run())
            .reraise("error spawning job master thread")?;

        Ok(JobHandle::new(job_id, events_tx, oracle, graph))
    }

    #[instrument(name = "job_master", skip_all, fields(job_id = %self.job_id))]
    fn run(mut self) {
        info!("Job start with {} tasks", self.tasks.len());
        let outcome = self.run_until_done();

        if let Some(deployment) = self.deployment.take() {
            let detached = deployment.cancel(self.config.runtime.cancel_grace_period);
            if detached > 0 {
                warn!("{detached} tasks were detached at job end");
            }
        }
        self.publish_stats();
        match outcome {
            Ok(()) => {
                info!("Job finished after {} restarts", self.recovery.restarts());
                self.publish(JobStatus::Finished, None);
            }
            Err(reason) => {
                error!("Job failed: {reason}");
                self.publish(JobStatus::Failed, Some(reason));
            }
        }
    }

    fn run_until_done(&mut self) -> Result<(), FailureReason> {
        self.publish(JobStatus::Running, None);
        let deployment = self
            .recovery
            .deploy(self.attempt, None)
            .map_err(|err| FailureReason::Internal(err.to_string()))?;
        self.deployment = Some(deployment);

        loop {
            let now = Instant::now();
            let timeout = self
                .coordinator
                .next_deadline()
                .map_or(MAX_IDLE, |deadline| until(deadline, now).min(MAX_IDLE));
            match self.events.recv_timeout(timeout) {
                Ok(event) => {
                    if self.handle(event)? {
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(FailureReason::Internal("job event channel closed".to_string()));
                }
            }
            self.tick(Instant::now());
        }
    }

    /// Returns if the job is done.
    fn handle(&mut self, event: JobEvent) -> Result<bool, FailureReason> {
        if let Some(attempt) = event.attempt() {
            if attempt != self.attempt {
                debug!(
                    "Dropping stale {} event from attempt {attempt}; current attempt is {}",
                    event.kind(),
                    self.attempt
                );
                self.metrics.stale_messages.add(1, &self.metrics.labels);
                return Ok(false);
            }
        }

        match event {
            JobEvent::Running { task, .. } => {
                trace!("Task {task} running");
                self.running.insert(task);
                if self.running.len() == self.tasks.len() && self.finished.is_empty() {
                    if self.status == JobStatus::Recovering {
                        self.publish(JobStatus::Running, None);
                    }
                    self.coordinator.start(Instant::now());
                }
            }
            JobEvent::Acknowledge(ack) => {
                let checkpoint_id = ack.checkpoint_id;
                let task = ack.task;
                match self.coordinator.acknowledge(ack, Instant::now()) {
                    AckOutcome::Recorded => {}
                    AckOutcome::Completed(checkpoint) => self.persist(&checkpoint),
                    AckOutcome::Rejected(rejection) => {
                        debug!("Ack from {task} for {checkpoint_id} rejected: {rejection:?}");
                    }
                }
            }
            JobEvent::Decline(decline) => {
                self.coordinator.decline(&decline);
            }
            JobEvent::Finished { task, .. } => {
                debug!("Task {task} finished");
                self.finished.insert(task);
                self.coordinator.task_finished(task);
                if self.finished.len() == self.tasks.len() {
                    return Ok(true);
                }
            }
            JobEvent::Failed { task, reason, .. } => {
                let err = HarnessError::Task { task, reason };
                warn!("Attempt {} broke: {err}", self.attempt);
                self.recover(task, err.to_string())?;
            }
            JobEvent::InjectFailure(task) => match &self.deployment {
                Some(deployment) if deployment.kill(task) => {
                    info!("Injected failure into task {task}");
                }
                _ => warn!("Can't inject failure; task {task} is not deployed"),
            },
            JobEvent::Cancel => {
                info!("Job cancelled");
                return Err(FailureReason::Cancelled);
            }
        }
        Ok(false)
    }

    fn tick(&mut self, now: Instant) {
        self.coordinator.expire_overdue(now);
        if self.status == JobStatus::Running {
            if let Some(barrier) = self.coordinator.trigger_checkpoint(now) {
                if let Some(deployment) = &self.deployment {
                    deployment.trigger(barrier);
                }
            }
        }
        self.publish_stats();
    }

    fn recover(&mut self, failed_task: TaskId, cause: String) -> Result<(), FailureReason> {
        let next_attempt = self.attempt.next();
        let abandoned = self.coordinator.suspend(next_attempt);
        if !abandoned.is_empty() {
            debug!("Abandoned pending checkpoints {abandoned:?}");
        }
        self.status = JobStatus::Recovering;
        self.oracle.set_status(JobStatus::Recovering, self.attempt);
        self.record(None);

        let latest = self.latest_checkpoint();
        let (deployment, restored_from) =
            self.recovery
                .recover(self.deployment.take(), next_attempt, latest.as_ref())?;
        self.attempt = next_attempt;
        self.deployment = Some(deployment);
        self.running.clear();
        self.finished.clear();

        self.metrics.recoveries.add(1, &self.metrics.labels);
        self.oracle.recovered(RecoveryRecord {
            attempt: next_attempt,
            restored_from,
            failed_task,
            cause,
            at: Utc::now(),
        });
        self.record(None);
        Ok(())
    }

    /// The newest completed checkpoint of this job run, preferring the
    /// durably stored copy.
    ///
    /// If the store can't be read, fall back to the coordinator's
    /// copy.
    fn latest_checkpoint(&self) -> Option<CompletedCheckpoint> {
        let stored = match self.store.load_latest() {
            Ok(stored) => stored,
            Err(err) => {
                error!("Error loading latest checkpoint; using in-memory copy: {err}");
                None
            }
        };
        choose_restore(
            stored,
            self.coordinator.last_completed().map(Arc::as_ref),
            self.attempt,
        )
    }

    fn persist(&mut self, checkpoint: &CompletedCheckpoint) {
        let res = self.store.save_completed(checkpoint).and_then(|_| {
            self.store
                .retain_latest(self.config.checkpoint.retained_checkpoints)
        });
        match res {
            Ok(discarded) if discarded > 0 => {
                debug!("Discarded {discarded} old checkpoints");
            }
            Ok(_) => {}
            Err(err) => error!("Error saving checkpoint {}: {err}", checkpoint.id),
        }
        self.record(None);
        self.oracle.checkpoint_completed(checkpoint.id);
        self.publish_stats();
    }

    /// Write a status change to the store, then make it visible.
    fn publish(&mut self, status: JobStatus, failure: Option<FailureReason>) {
        self.status = status;
        self.record(failure.as_ref());
        match failure {
            Some(reason) => self.oracle.fail(reason, self.attempt),
            None => self.oracle.set_status(status, self.attempt),
        }
    }

    fn record(&mut self, failure: Option<&FailureReason>) {
        let record = JobRecord {
            job_id: self.job_id.clone(),
            status: self.status,
            attempt: self.attempt,
            last_completed: self
                .coordinator
                .last_completed()
                .map(|checkpoint| checkpoint.id),
            failure: failure.map(ToString::to_string),
            updated_at: Utc::now(),
        };
        if let Err(err) = self.store.record_job(&record) {
            error!("Error recording job status {}: {err}", record.status);
        }
    }

    fn publish_stats(&mut self) {
        let stats = self.coordinator.stats();
        if stats != self.published_stats {
            self.published_stats = stats;
            self.oracle.set_checkpoint_stats(stats);
        }
    }
}

/// Pick the checkpoint a failed `attempt` restarts from.
///
/// A stored checkpoint is only trusted if it is the one this run's
/// coordinator last completed, or an older one from an attempt that
/// already ran. Anything else was written by another job run sharing
/// the store.
fn choose_restore(
    stored: Option<CompletedCheckpoint>,
    in_memory: Option<&CompletedCheckpoint>,
    attempt: Attempt,
) -> Option<CompletedCheckpoint> {
    let stored = stored.filter(|checkpoint| {
        let own = checkpoint.attempt <= attempt
            && in_memory.is_some_and(|last| {
                checkpoint.id < last.id
                    || (checkpoint.id == last.id && checkpoint.attempt == last.attempt)
            });
        if !own {
            warn!(
                "Ignoring stored {} of attempt {}; this job run never completed it",
                checkpoint.id, checkpoint.attempt
            );
        }
        own
    });
    match (stored, in_memory) {
        (Some(stored), Some(last)) if stored.id < last.id => Some(last.clone()),
        (Some(stored), _) => Some(stored),
        (None, last) => last.cloned(),
    }
}

#[cfg(test)]
fn completed(id: u64, attempt: u64, state: &str) -> CompletedCheckpoint {
    CompletedCheckpoint {
        id: CheckpointId(id),
        attempt: Attempt(attempt),
        triggered_at: Utc::now(),
        completed_at: Utc::now(),
        snapshots: [(TaskId::new(0, 0), StateBytes(state.as_bytes().to_vec()))].into(),
    }
}

#[cfg(test)]
fn state_of(checkpoint: Option<CompletedCheckpoint>) -> Option<(CheckpointId, Vec<u8>)> {
    checkpoint.map(|checkpoint| {
        let state = checkpoint
            .snapshots
            .values()
            .next()
            .map(|state| state.0.clone())
            .unwrap_or_default();
        (checkpoint.id, state)
    })
}

#[test]
fn restore_prefers_stored_copy_of_own_checkpoint() {
    let chosen = choose_restore(
        Some(completed(3, 1, "stored")),
        Some(&completed(3, 1, "memory")),
        Attempt(1),
    );
    assert_eq!(state_of(chosen), Some((CheckpointId(3), b"stored".to_vec())));
}

#[test]
fn restore_uses_memory_when_store_is_behind() {
    let chosen = choose_restore(
        Some(completed(2, 0, "stored")),
        Some(&completed(3, 0, "memory")),
        Attempt(0),
    );
    assert_eq!(state_of(chosen), Some((CheckpointId(3), b"memory".to_vec())));
}

#[test]
fn restore_ignores_checkpoints_of_other_runs() {
    // Newer than anything this run completed.
    let chosen = choose_restore(
        Some(completed(999, 0, "other run")),
        Some(&completed(1, 0, "memory")),
        Attempt(0),
    );
    assert_eq!(state_of(chosen), Some((CheckpointId(1), b"memory".to_vec())));

    // This run hasn't completed any checkpoint yet.
    let chosen = choose_restore(Some(completed(1, 0, "other run")), None, Attempt(0));
    assert_eq!(state_of(chosen), None);

    // Same ID, but from an attempt this run hasn't reached.
    let chosen = choose_restore(
        Some(completed(2, 5, "other run")),
        Some(&completed(2, 0, "memory")),
        Attempt(1),
    );
    assert_eq!(state_of(chosen), Some((CheckpointId(2), b"memory".to_vec())));
}
