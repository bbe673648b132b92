//! The checkpoint coordinator.
//!
//! Decides when to trigger checkpoints, collects acknowledgements and
//! declares checkpoints completed or expired. It is a plain state
//! machine owned by the job master thread; every input arrives as a
//! method call with the current time, and it never blocks or spawns.
//!
//! Ordering guarantees:
//!
//! - Checkpoint IDs only ever increase, across attempts too.
//!
//! - Completed checkpoints complete in ID order. Completing `M`
//!   expires every pending checkpoint older than `M`, and any ack for
//!   a checkpoint at or before the last completed one is rejected.
//!
//! - A checkpoint completes only once every task of its attempt has
//!   acknowledged it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::CheckpointConfig;
use crate::metrics::CheckpointMetrics;
use crate::recovery::model::*;

/// How many terminal checkpoint statuses to remember for diagnostics.
const TERMINAL_HISTORY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    /// The ack was recorded; more are needed.
    Recorded,
    /// This ack was the last one needed.
    Completed(Arc<CompletedCheckpoint>),
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// From an attempt that has since been superseded.
    StaleAttempt,
    /// The checkpoint is no longer pending.
    Terminal(CheckpointStatus),
    /// The checkpoint was never triggered, or so long ago it's
    /// forgotten.
    Unknown,
    /// The task isn't part of the checkpoint.
    UnexpectedTask,
    Duplicate,
}

/// Running totals, also mirrored into metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointStats {
    pub triggered: u64,
    pub completed: u64,
    pub expired: u64,
    pub declined: u64,
}

pub(crate) struct CheckpointCoordinator {
    config: CheckpointConfig,
    attempt: Attempt,
    tasks: BTreeSet<TaskId>,
    next_id: CheckpointId,
    pending: BTreeMap<CheckpointId, Checkpoint>,
    terminal: BTreeMap<CheckpointId, CheckpointStatus>,
    last_completed: Option<Arc<CompletedCheckpoint>>,
    /// Triggering only happens while this is set. It's cleared once
    /// any task finishes and during recovery.
    next_trigger: Option<Instant>,
    any_finished: bool,
    stats: CheckpointStats,
    metrics: CheckpointMetrics,
}

impl CheckpointCoordinator {
    pub(crate) fn new(
        config: CheckpointConfig,
        tasks: BTreeSet<TaskId>,
        metrics: CheckpointMetrics,
    ) -> Self {
        Self {
            config,
            attempt: Attempt::INITIAL,
            tasks,
            next_id: CheckpointId::FIRST,
            pending: BTreeMap::new(),
            terminal: BTreeMap::new(),
            last_completed: None,
            next_trigger: None,
            any_finished: false,
            stats: CheckpointStats::default(),
            metrics,
        }
    }

    pub(crate) fn attempt(&self) -> Attempt {
        self.attempt
    }

    pub(crate) fn stats(&self) -> CheckpointStats {
        self.stats
    }

    pub(crate) fn last_completed(&self) -> Option<&Arc<CompletedCheckpoint>> {
        self.last_completed.as_ref()
    }

    pub(crate) fn status_of(&self, checkpoint_id: CheckpointId) -> Option<CheckpointStatus> {
        if let Some(checkpoint) = self.pending.get(&checkpoint_id) {
            Some(checkpoint.status)
        } else {
            self.terminal.get(&checkpoint_id).copied()
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Every task of the current attempt is running; start the
    /// trigger clock.
    pub(crate) fn start(&mut self, now: Instant) {
        debug!(
            "Checkpoint triggering starts for attempt {} every {:?}",
            self.attempt, self.config.interval
        );
        self.any_finished = false;
        self.next_trigger = Some(now + self.config.interval);
    }

    /// Stop triggering and abandon everything pending because the
    /// current attempt is being torn down. Acks for those are stale
    /// from now on.
    pub(crate) fn suspend(&mut self, next_attempt: Attempt) -> Vec<CheckpointId> {
        self.next_trigger = None;
        self.attempt = next_attempt;
        let abandoned: Vec<_> = self.pending.keys().copied().collect();
        for checkpoint_id in &abandoned {
            self.expire(*checkpoint_id, "attempt superseded");
        }
        abandoned
    }

    /// Once any task finished, no new checkpoint could ever complete,
    /// so stop triggering.
    pub(crate) fn task_finished(&mut self, task: TaskId) {
        if !self.any_finished {
            debug!("Task {task} finished; no more checkpoints will be triggered");
        }
        self.any_finished = true;
        self.next_trigger = None;
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        self.next_trigger.is_some_and(|at| at <= now)
    }

    /// The next time something could happen without any new input: a
    /// trigger or an expiry.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let expiry = self.config.expiry_timeout.and_then(|timeout| {
            self.pending
                .values()
                .map(|checkpoint| checkpoint.started + timeout)
                .min()
        });
        match (self.next_trigger, expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Start a new checkpoint if one is due. Returns the barrier to
    /// inject at every source.
    pub(crate) fn trigger_checkpoint(&mut self, now: Instant) -> Option<Barrier> {
        if !self.is_due(now) || self.any_finished {
            return None;
        }
        self.next_trigger = Some(now + self.config.interval);
        if self.pending.len() >= self.config.max_concurrent_checkpoints {
            debug!(
                "Skipping checkpoint trigger; {} already pending",
                self.pending.len()
            );
            return None;
        }

        let checkpoint_id = self.next_id;
        self.next_id = checkpoint_id.next();
        let checkpoint = Checkpoint::new(checkpoint_id, self.attempt, self.tasks.clone(), now);
        let barrier = checkpoint.barrier();
        self.pending.insert(checkpoint_id, checkpoint);

        self.stats.triggered += 1;
        self.metrics.triggered.add(1, &self.metrics.labels);
        debug!(
            "Triggered checkpoint {checkpoint_id} for attempt {}",
            self.attempt
        );
        Some(barrier)
    }

    pub(crate) fn acknowledge(&mut self, ack: Ack, now: Instant) -> AckOutcome {
        if ack.attempt != self.attempt {
            return AckOutcome::Rejected(Rejection::StaleAttempt);
        }
        if self.is_overdue(ack.checkpoint_id, now) {
            self.expire(ack.checkpoint_id, "expiry timeout elapsed");
        }
        let Some(checkpoint) = self.pending.get_mut(&ack.checkpoint_id) else {
            let rejection = match self.terminal.get(&ack.checkpoint_id) {
                Some(status) => Rejection::Terminal(*status),
                None if self
                    .last_completed
                    .as_ref()
                    .is_some_and(|last| ack.checkpoint_id <= last.id) =>
                {
                    Rejection::Terminal(CheckpointStatus::Expired)
                }
                None => Rejection::Unknown,
            };
            return AckOutcome::Rejected(rejection);
        };
        if !checkpoint.expected.contains(&ack.task) {
            return AckOutcome::Rejected(Rejection::UnexpectedTask);
        }
        if checkpoint.acks.contains_key(&ack.task) {
            return AckOutcome::Rejected(Rejection::Duplicate);
        }
        checkpoint.acks.insert(ack.task, ack.state);
        if !checkpoint.is_fully_acked() {
            return AckOutcome::Recorded;
        }
        match self.pending.remove(&ack.checkpoint_id) {
            Some(checkpoint) => AckOutcome::Completed(self.complete(checkpoint, now)),
            None => AckOutcome::Recorded,
        }
    }

    /// A task can't take part in a checkpoint; it can never complete.
    /// Returns if a pending checkpoint was expired.
    pub(crate) fn decline(&mut self, decline: &Decline) -> bool {
        if decline.attempt != self.attempt || !self.pending.contains_key(&decline.checkpoint_id) {
            return false;
        }
        self.stats.declined += 1;
        self.metrics.declined.add(1, &self.metrics.labels);
        self.expire(
            decline.checkpoint_id,
            &format!("declined by task {}: {}", decline.task, decline.reason),
        )
    }

    /// Expire every pending checkpoint older than the expiry timeout.
    pub(crate) fn expire_overdue(&mut self, now: Instant) -> Vec<CheckpointId> {
        let overdue: Vec<_> = self
            .pending
            .keys()
            .copied()
            .filter(|checkpoint_id| self.is_overdue(*checkpoint_id, now))
            .collect();
        for checkpoint_id in &overdue {
            self.expire(*checkpoint_id, "expiry timeout elapsed");
        }
        overdue
    }

    fn is_overdue(&self, checkpoint_id: CheckpointId, now: Instant) -> bool {
        match (self.config.expiry_timeout, self.pending.get(&checkpoint_id)) {
            (Some(timeout), Some(checkpoint)) => now.duration_since(checkpoint.started) >= timeout,
            _ => false,
        }
    }

    /// Discard a pending checkpoint and every partial snapshot it
    /// collected.
    pub(crate) fn expire(&mut self, checkpoint_id: CheckpointId, why: &str) -> bool {
        let Some(mut checkpoint) = self.pending.remove(&checkpoint_id) else {
            return false;
        };
        checkpoint.status = CheckpointStatus::Expired;
        warn!(
            "Checkpoint {checkpoint_id} expired with {}/{} acks: {why}",
            checkpoint.acks.len(),
            checkpoint.expected.len()
        );
        self.remember(checkpoint_id, CheckpointStatus::Expired);
        self.stats.expired += 1;
        self.metrics.expired.add(1, &self.metrics.labels);
        true
    }

    fn complete(&mut self, mut checkpoint: Checkpoint, now: Instant) -> Arc<CompletedCheckpoint> {
        let checkpoint_id = checkpoint.id;
        checkpoint.status = CheckpointStatus::Completed;
        let took = now.duration_since(checkpoint.started);
        let completed = Arc::new(CompletedCheckpoint::from_pending(checkpoint));

        let subsumed: Vec<_> = self
            .pending
            .range(..checkpoint_id)
            .map(|(id, _)| *id)
            .collect();
        for older in subsumed {
            self.expire(older, &format!("subsumed by {checkpoint_id}"));
        }

        self.remember(checkpoint_id, CheckpointStatus::Completed);
        self.last_completed = Some(completed.clone());
        self.stats.completed += 1;
        self.metrics.completed.add(1, &self.metrics.labels);
        self.metrics
            .duration
            .record(took.as_secs_f64(), &self.metrics.labels);
        info!(
            "Checkpoint {checkpoint_id} completed in {took:?} with {} task snapshots",
            completed.snapshots.len()
        );
        completed
    }

    fn remember(&mut self, checkpoint_id: CheckpointId, status: CheckpointStatus) {
        self.terminal.insert(checkpoint_id, status);
        while self.terminal.len() > TERMINAL_HISTORY {
            self.terminal.pop_first();
        }
    }
}

/// Time from now until `deadline`, or zero if it already passed.
pub(crate) fn until(deadline: Instant, now: Instant) -> Duration {
    deadline.saturating_duration_since(now)
}

#[cfg(test)]
fn coordinator(config: CheckpointConfig, num_tasks: usize) -> CheckpointCoordinator {
    let tasks = (0..num_tasks).map(|i| TaskId::new(0, i)).collect();
    CheckpointCoordinator::new(
        config,
        tasks,
        CheckpointMetrics::new(&JobId("test".to_string())),
    )
}

#[cfg(test)]
fn ack(attempt: u64, task: usize, checkpoint_id: u64) -> Ack {
    Ack {
        attempt: Attempt(attempt),
        task: TaskId::new(0, task),
        checkpoint_id: CheckpointId(checkpoint_id),
        state: StateBytes(format!("{task}").into_bytes()),
    }
}

#[test]
fn triggers_only_after_start_and_on_interval() {
    let config = CheckpointConfig::default().with_interval(Duration::from_millis(100));
    let mut coord = coordinator(config, 2);
    let t0 = Instant::now();

    assert_eq!(coord.trigger_checkpoint(t0), None);
    coord.start(t0);
    assert_eq!(coord.trigger_checkpoint(t0), None);

    let barrier = coord
        .trigger_checkpoint(t0 + Duration::from_millis(100))
        .unwrap();
    assert_eq!(barrier.checkpoint_id, CheckpointId(1));
    assert_eq!(barrier.attempt, Attempt(0));
    assert_eq!(coord.status_of(CheckpointId(1)), Some(CheckpointStatus::Pending));
}

#[test]
fn completes_after_every_ack() {
    let config = CheckpointConfig::default().with_interval(Duration::from_millis(10));
    let mut coord = coordinator(config, 2);
    let t0 = Instant::now();
    coord.start(t0);
    coord.trigger_checkpoint(t0 + Duration::from_millis(10)).unwrap();

    let now = t0 + Duration::from_millis(11);
    assert_eq!(coord.acknowledge(ack(0, 0, 1), now), AckOutcome::Recorded);
    assert_eq!(
        coord.acknowledge(ack(0, 0, 1), now),
        AckOutcome::Rejected(Rejection::Duplicate)
    );
    match coord.acknowledge(ack(0, 1, 1), now) {
        AckOutcome::Completed(completed) => {
            assert_eq!(completed.id, CheckpointId(1));
            assert_eq!(
                completed.snapshots.get(&TaskId::new(0, 1)),
                Some(&StateBytes(b"1".to_vec()))
            );
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(
        coord.status_of(CheckpointId(1)),
        Some(CheckpointStatus::Completed)
    );
    assert_eq!(
        coord.acknowledge(ack(0, 1, 1), now),
        AckOutcome::Rejected(Rejection::Terminal(CheckpointStatus::Completed))
    );
    assert_eq!(coord.last_completed().unwrap().id, CheckpointId(1));
    assert_eq!(coord.stats().completed, 1);
}

#[test]
fn respects_max_concurrent() {
    let config = CheckpointConfig::default()
        .with_interval(Duration::from_millis(10))
        .with_expiry_timeout(None);
    let mut coord = coordinator(config, 1);
    let t0 = Instant::now();
    coord.start(t0);

    assert!(coord.trigger_checkpoint(t0 + Duration::from_millis(10)).is_some());
    assert!(coord.trigger_checkpoint(t0 + Duration::from_millis(20)).is_none());
    assert_eq!(coord.pending_count(), 1);
    assert_eq!(coord.stats().triggered, 1);
}

#[test]
fn completing_newer_subsumes_older() {
    let mut config = CheckpointConfig::default()
        .with_interval(Duration::from_millis(10))
        .with_expiry_timeout(None);
    config.max_concurrent_checkpoints = 2;
    let mut coord = coordinator(config, 1);
    let t0 = Instant::now();
    coord.start(t0);
    coord.trigger_checkpoint(t0 + Duration::from_millis(10)).unwrap();
    coord.trigger_checkpoint(t0 + Duration::from_millis(20)).unwrap();

    let now = t0 + Duration::from_millis(21);
    assert!(matches!(
        coord.acknowledge(ack(0, 0, 2), now),
        AckOutcome::Completed(_)
    ));
    assert_eq!(
        coord.status_of(CheckpointId(1)),
        Some(CheckpointStatus::Expired)
    );
    assert_eq!(
        coord.acknowledge(ack(0, 0, 1), now),
        AckOutcome::Rejected(Rejection::Terminal(CheckpointStatus::Expired))
    );
    assert_eq!(coord.last_completed().unwrap().id, CheckpointId(2));
}

#[test]
fn zero_timeout_always_expires() {
    let config = CheckpointConfig::default()
        .with_interval(Duration::from_millis(10))
        .with_expiry_timeout(Some(Duration::ZERO));
    let mut coord = coordinator(config, 1);
    let t0 = Instant::now();
    coord.start(t0);
    let now = t0 + Duration::from_millis(10);
    coord.trigger_checkpoint(now).unwrap();

    // Even an ack arriving at the exact trigger instant is too late.
    assert_eq!(
        coord.acknowledge(ack(0, 0, 1), now),
        AckOutcome::Rejected(Rejection::Terminal(CheckpointStatus::Expired))
    );
    assert!(coord.last_completed().is_none());
    assert_eq!(coord.stats().expired, 1);
}

#[test]
fn expire_overdue_by_timer() {
    let config = CheckpointConfig::default()
        .with_interval(Duration::from_millis(10))
        .with_expiry_timeout(Some(Duration::from_millis(50)));
    let mut coord = coordinator(config, 2);
    let t0 = Instant::now();
    coord.start(t0);
    let triggered = t0 + Duration::from_millis(10);
    coord.trigger_checkpoint(triggered).unwrap();

    assert_eq!(
        coord.next_deadline(),
        Some(triggered + Duration::from_millis(10))
    );
    assert!(coord
        .expire_overdue(triggered + Duration::from_millis(49))
        .is_empty());
    assert_eq!(
        coord.expire_overdue(triggered + Duration::from_millis(50)),
        vec![CheckpointId(1)]
    );
    assert_eq!(coord.pending_count(), 0);
}

#[test]
fn stale_attempt_acks_rejected_after_suspend() {
    let config = CheckpointConfig::default().with_interval(Duration::from_millis(10));
    let mut coord = coordinator(config, 2);
    let t0 = Instant::now();
    coord.start(t0);
    coord.trigger_checkpoint(t0 + Duration::from_millis(10)).unwrap();

    assert_eq!(coord.suspend(Attempt(1)), vec![CheckpointId(1)]);
    assert!(!coord.is_due(t0 + Duration::from_secs(60)));
    assert_eq!(
        coord.acknowledge(ack(0, 0, 1), t0),
        AckOutcome::Rejected(Rejection::StaleAttempt)
    );

    // IDs keep increasing in the next attempt.
    let t1 = t0 + Duration::from_millis(100);
    coord.start(t1);
    let barrier = coord.trigger_checkpoint(t1 + Duration::from_millis(10)).unwrap();
    assert_eq!(barrier.checkpoint_id, CheckpointId(2));
    assert_eq!(barrier.attempt, Attempt(1));
}

#[test]
fn decline_expires() {
    let config = CheckpointConfig::default().with_interval(Duration::from_millis(10));
    let mut coord = coordinator(config, 2);
    let t0 = Instant::now();
    coord.start(t0);
    coord.trigger_checkpoint(t0 + Duration::from_millis(10)).unwrap();

    let decline = Decline {
        attempt: Attempt(0),
        task: TaskId::new(0, 1),
        checkpoint_id: CheckpointId(1),
        reason: "alignment buffer full".to_string(),
    };
    assert!(coord.decline(&decline));
    assert!(!coord.decline(&decline));
    assert_eq!(coord.stats().declined, 1);
    assert_eq!(
        coord.status_of(CheckpointId(1)),
        Some(CheckpointStatus::Expired)
    );
}

#[test]
fn no_triggers_after_task_finished() {
    let config = CheckpointConfig::default().with_interval(Duration::from_millis(10));
    let mut coord = coordinator(config, 2);
    let t0 = Instant::now();
    coord.start(t0);
    coord.task_finished(TaskId::new(0, 0));
    assert!(coord
        .trigger_checkpoint(t0 + Duration::from_millis(10))
        .is_none());
    assert_eq!(coord.next_deadline(), None);
}

#[test]
fn unexpected_task_rejected() {
    let config = CheckpointConfig::default().with_interval(Duration::from_millis(10));
    let mut coord = coordinator(config, 1);
    let t0 = Instant::now();
    coord.start(t0);
    coord.trigger_checkpoint(t0 + Duration::from_millis(10)).unwrap();
    assert_eq!(
        coord.acknowledge(ack(0, 5, 1), t0 + Duration::from_millis(10)),
        AckOutcome::Rejected(Rejection::UnexpectedTask)
    );
    assert_eq!(
        coord.acknowledge(ack(0, 0, 9), t0 + Duration::from_millis(10)),
        AckOutcome::Rejected(Rejection::Unknown)
    );
}
