//! Spawning and tearing down every task of one attempt.
//!
//! A [`Deployment`] owns the threads, channels and interrupt flags of
//! a single attempt. Everything is built and restored before the first
//! thread starts, so a deployment either starts completely or not at
//! all.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::barrier::BarrierAligner;
use crate::config::JobConfig;
use crate::errors::tracked_err;
use crate::errors::HarnessError;
use crate::errors::HarnessResult;
use crate::errors::Reraise;
use crate::execution::graph::ExecutionGraph;
use crate::execution::JobEvent;
use crate::operators::OperatorChain;
use crate::pipeline::Step;
use crate::recovery::model::*;
use crate::worker::spawn_task;
use crate::worker::Control;
use crate::worker::Envelope;
use crate::worker::Interrupts;
use crate::worker::OutputGate;
use crate::worker::TaskInput;
use crate::worker::TaskLaunch;

struct DeployedTask {
    thread: JoinHandle<()>,
    kill: Arc<AtomicBool>,
    /// Only source tasks take control messages.
    control: Option<Sender<Control>>,
}

/// The running tasks of one attempt.
pub(crate) struct Deployment {
    attempt: Attempt,
    cancel: Arc<AtomicBool>,
    tasks: BTreeMap<TaskId, DeployedTask>,
}

impl Deployment {
    /// Build, restore and spawn every task of `graph` for `attempt`.
    ///
    /// With `restore`, every task resumes from its snapshot in that
    /// checkpoint; tasks missing from it start empty.
    pub(crate) fn launch(
        graph: &ExecutionGraph,
        attempt: Attempt,
        restore: Option<&CompletedCheckpoint>,
        config: &JobConfig,
        events: &Sender<JobEvent>,
    ) -> HarnessResult<Self> {
        let parallelism = graph.parallelism();
        let cancel = Arc::new(AtomicBool::new(false));
        let cooldown = config.runtime.idle_cooldown;

        // One inbound channel per instance of every stage but the
        // first; senders go to all instances of the stage before.
        let mut inbound: Vec<Vec<(Sender<Envelope>, Receiver<Envelope>)>> = graph
            .stages()
            .iter()
            .map(|stage| {
                if stage.index.0 == 0 {
                    Vec::new()
                } else {
                    (0..parallelism)
                        .map(|_| crossbeam_channel::bounded(config.runtime.channel_capacity))
                        .collect()
                }
            })
            .collect();

        let mut launches = Vec::with_capacity(graph.task_ids().len());
        let mut handles = BTreeMap::new();
        for stage in graph.stages() {
            let next = graph.stages().get(stage.index.0 + 1);
            let targets: Vec<Sender<Envelope>> = inbound
                .get(stage.index.0 + 1)
                .map(|channels| channels.iter().map(|(tx, _rx)| tx.clone()).collect())
                .unwrap_or_default();
            let route = next.and_then(|next| next.route.clone());

            for instance in 0..parallelism {
                let task = TaskId::new(stage.index.0, instance);
                let mut snapshot = match restore {
                    Some(checkpoint) => checkpoint.task_snapshot(&task)?,
                    None => TaskSnapshot::default(),
                };
                let kill = Arc::new(AtomicBool::new(false));
                let interrupts = Interrupts {
                    cancel: cancel.clone(),
                    kill: kill.clone(),
                };

                let (input, control) = match stage.steps.first() {
                    Some(Step::Input { step_id, builder }) => {
                        let resume = snapshot.remove(step_id);
                        let reader = builder
                            .build(InstanceIndex(instance), parallelism, resume)
                            .reraise_with(|| {
                                format!("error building input {step_id} for task {task}")
                            })?;
                        let (control_tx, control_rx) = crossbeam_channel::unbounded();
                        let input = TaskInput::Source {
                            step_id: step_id.clone(),
                            reader,
                            control: control_rx,
                        };
                        (input, Some(control_tx))
                    }
                    _ => {
                        let receiver = inbound[stage.index.0]
                            .get(instance)
                            .map(|(_tx, rx)| rx.clone())
                            .ok_or_else(|| {
                                tracked_err(
                                    HarnessError::Runtime,
                                    &format!("no inbound channel for task {task}"),
                                )
                            })?;
                        let input = TaskInput::Channels {
                            receiver,
                            aligner: BarrierAligner::new(
                                parallelism,
                                attempt,
                                config.checkpoint.alignment_buffer_capacity,
                            ),
                        };
                        (input, None)
                    }
                };

                let chain = OperatorChain::build(&stage.steps, task, parallelism, &mut snapshot)
                    .reraise_with(|| format!("error building operators for task {task}"))?;
                if !snapshot.is_empty() {
                    warn!("Task {task} snapshot has state for steps it doesn't run; ignoring it");
                }
                let output = OutputGate::new(
                    instance,
                    targets.clone(),
                    route.clone(),
                    interrupts.clone(),
                    cooldown,
                );

                launches.push(TaskLaunch {
                    task,
                    attempt,
                    process: graph.process_of(task),
                    input,
                    chain,
                    output,
                    events: events.clone(),
                    interrupts,
                    cooldown,
                });
                handles.insert(task, (kill, control));
            }
        }
        // Tasks hold the only senders now, so a receiver disconnects
        // once all of its upstream tasks are gone.
        inbound.clear();

        let mut deployment = Self {
            attempt,
            cancel,
            tasks: BTreeMap::new(),
        };
        for launch in launches {
            let task = launch.task;
            match spawn_task(launch) {
                Ok(thread) => {
                    if let Some((kill, control)) = handles.remove(&task) {
                        deployment.tasks.insert(
                            task,
                            DeployedTask {
                                thread,
                                kill,
                                control,
                            },
                        );
                    }
                }
                Err(err) => {
                    deployment.cancel.store(true, Ordering::Relaxed);
                    return Err(err);
                }
            }
        }
        info!(
            "Deployed {} tasks for attempt {attempt}",
            deployment.tasks.len()
        );
        Ok(deployment)
    }

    pub(crate) fn attempt(&self) -> Attempt {
        self.attempt
    }

    /// Tell every source task to inject `barrier`.
    pub(crate) fn trigger(&self, barrier: Barrier) {
        for (task, deployed) in &self.tasks {
            if let Some(control) = &deployed.control {
                if control.send(Control::TriggerCheckpoint(barrier)).is_err() {
                    debug!(
                        "Source task {task} is gone; not injecting barrier for {}",
                        barrier.checkpoint_id
                    );
                }
            }
        }
    }

    /// Make one task fail as if it crashed. Returns if the task
    /// exists in this deployment.
    pub(crate) fn kill(&self, task: TaskId) -> bool {
        match self.tasks.get(&task) {
            Some(deployed) => {
                deployed.kill.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Stop every task, waiting up to `grace` for them to notice.
    ///
    /// Threads still running after that are detached; they can't do
    /// any harm since everything they send is tagged with this
    /// attempt. Returns how many were detached.
    pub(crate) fn cancel(self, grace: Duration) -> usize {
        self.cancel.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline
            && !self.tasks.values().all(|deployed| deployed.thread.is_finished())
        {
            thread::sleep(Duration::from_millis(1));
        }

        let mut detached = 0;
        for (task, deployed) in self.tasks {
            if deployed.thread.is_finished() {
                if deployed.thread.join().is_err() {
                    // Panics are caught in the task itself; this is
                    // only reachable if reporting the panic panicked.
                    warn!("Task {task} thread panicked while stopping");
                }
            } else {
                detached += 1;
                warn!(
                    "Task {task} of attempt {} did not stop within {grace:?}; detaching it",
                    self.attempt
                );
            }
        }
        debug!("Cancelled attempt {}", self.attempt);
        detached
    }
}
