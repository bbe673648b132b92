//! The task runtime.
//!
//! Each task is one thread running one instance of one stage. Source
//! tasks poll an [`InputReader`] and inject barriers when the master
//! tells them to; every other task reads its single input channel,
//! aligns barriers across upstream instances, and snapshots its
//! operators whenever a barrier is aligned.
//!
//! Tasks never talk back to the job master except through
//! [`JobEvent`]s, all labeled with the attempt the task belongs to.

use std::collections::VecDeque;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Poll;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::SendTimeoutError;
use crossbeam_channel::Sender;
use crossbeam_channel::TryRecvError;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use crate::barrier::AlignResult;
use crate::barrier::BarrierAligner;
use crate::barrier::ChannelIndex;
use crate::barrier::StreamElement;
use crate::errors::panic_message;
use crate::errors::prepend_tname;
use crate::errors::tracked_err;
use crate::errors::HarnessError;
use crate::errors::HarnessResult;
use crate::errors::Reraise;
use crate::execution::graph::route;
use crate::execution::JobEvent;
use crate::inputs::InputReader;
use crate::operators::OperatorChain;
use crate::pipeline::KeyFn;
use crate::recovery::model::*;
use crate::Item;

/// An element on its way to a task, tagged with which upstream
/// instance sent it.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) channel: ChannelIndex,
    pub(crate) element: StreamElement,
}

/// Messages from the master to a source task.
#[derive(Debug)]
pub(crate) enum Control {
    TriggerCheckpoint(Barrier),
}

/// Flags a task checks between elements.
#[derive(Clone)]
pub(crate) struct Interrupts {
    /// Shared by every task of a deployment.
    pub(crate) cancel: Arc<AtomicBool>,
    /// Only this task; set to inject a failure.
    pub(crate) kill: Arc<AtomicBool>,
}

impl Interrupts {
    fn check(&self) -> HarnessResult<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(HarnessError::Cancelled)
        } else if self.kill.load(Ordering::Relaxed) {
            Err(tracked_err(HarnessError::Runtime, "failure injected"))
        } else {
            Ok(())
        }
    }
}

/// Sends a task's output to every instance of the next stage.
pub(crate) struct OutputGate {
    /// Index of the sending task at the receiving tasks.
    channel: ChannelIndex,
    targets: Vec<Sender<Envelope>>,
    route: Option<KeyFn>,
    interrupts: Interrupts,
    cooldown: Duration,
}

impl OutputGate {
    pub(crate) fn new(
        channel: ChannelIndex,
        targets: Vec<Sender<Envelope>>,
        route: Option<KeyFn>,
        interrupts: Interrupts,
        cooldown: Duration,
    ) -> Self {
        Self {
            channel,
            targets,
            route,
            interrupts,
            cooldown,
        }
    }

    fn emit(&self, item: Item) -> HarnessResult<()> {
        if self.targets.is_empty() {
            return Ok(());
        }
        let target = match &self.route {
            Some(key_fn) => route(&key_fn(&item), self.targets.len()),
            None => self.channel % self.targets.len(),
        };
        self.send(target, StreamElement::Record(item))
    }

    fn broadcast(&self, element: StreamElement) -> HarnessResult<()> {
        for target in 0..self.targets.len() {
            self.send(target, element.clone())?;
        }
        Ok(())
    }

    /// Block until there's room downstream, but keep checking if this
    /// task should stop.
    fn send(&self, target: usize, element: StreamElement) -> HarnessResult<()> {
        let mut envelope = Envelope {
            channel: self.channel,
            element,
        };
        loop {
            match self.targets[target].send_timeout(envelope, self.cooldown) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    self.interrupts.check()?;
                    envelope = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(tracked_err(
                        HarnessError::Runtime,
                        &format!("downstream instance {target} is gone"),
                    ))
                }
            }
        }
    }
}

pub(crate) enum TaskInput {
    Source {
        step_id: StepId,
        reader: Box<dyn InputReader>,
        control: Receiver<Control>,
    },
    Channels {
        receiver: Receiver<Envelope>,
        aligner: BarrierAligner,
    },
}

/// Everything a task thread needs, already built and restored.
pub(crate) struct TaskLaunch {
    pub(crate) task: TaskId,
    pub(crate) attempt: Attempt,
    pub(crate) process: usize,
    pub(crate) input: TaskInput,
    pub(crate) chain: OperatorChain,
    pub(crate) output: OutputGate,
    pub(crate) events: Sender<JobEvent>,
    pub(crate) interrupts: Interrupts,
    pub(crate) cooldown: Duration,
}

pub(crate) fn spawn_task(launch: TaskLaunch) -> HarnessResult<JoinHandle<()>> {
    let name = format!(
        "faultline-p{}-s{}-i{}",
        launch.process, launch.task.stage.0, launch.task.instance.0
    );
    thread::Builder::new()
        .name(name)
        .spawn(move || task_main(launch))
        .reraise("error spawning task thread")
}

#[instrument(name = "task_main", skip_all, fields(task = %launch.task, attempt = %launch.attempt))]
fn task_main(launch: TaskLaunch) {
    let task = launch.task;
    let attempt = launch.attempt;
    let events = launch.events.clone();
    info!("Task start");

    let res = panic::catch_unwind(AssertUnwindSafe(move || run_task(launch)));
    let event = match res {
        Ok(Ok(())) => {
            info!("Task stop");
            Some(JobEvent::Finished { attempt, task })
        }
        Ok(Err(HarnessError::Cancelled)) => {
            debug!("Task cancelled");
            None
        }
        Ok(Err(err)) => {
            warn!("Task failed: {err}");
            Some(JobEvent::Failed {
                attempt,
                task,
                reason: err.to_string(),
            })
        }
        Err(payload) => {
            let reason = prepend_tname(panic_message(payload.as_ref()));
            warn!("Task panicked: {reason}");
            Some(JobEvent::Failed {
                attempt,
                task,
                reason,
            })
        }
    };
    if let Some(event) = event {
        if events.send(event).is_err() {
            debug!("Job master is gone; dropping final task event");
        }
    }
}

fn run_task(launch: TaskLaunch) -> HarnessResult<()> {
    let TaskLaunch {
        task,
        attempt,
        input,
        chain,
        output,
        events,
        interrupts,
        cooldown,
        ..
    } = launch;
    let mut runner = TaskRunner {
        task,
        attempt,
        chain,
        output,
        events,
        interrupts,
        cooldown,
    };
    runner.report(JobEvent::Running { attempt, task })?;
    match input {
        TaskInput::Source {
            step_id,
            reader,
            control,
        } => runner.run_source(step_id, reader, control),
        TaskInput::Channels { receiver, aligner } => runner.run_channels(receiver, aligner),
    }
}

struct TaskRunner {
    task: TaskId,
    attempt: Attempt,
    chain: OperatorChain,
    output: OutputGate,
    events: Sender<JobEvent>,
    interrupts: Interrupts,
    cooldown: Duration,
}

impl TaskRunner {
    fn report(&self, event: JobEvent) -> HarnessResult<()> {
        self.events
            .send(event)
            .map_err(|_| tracked_err(HarnessError::Runtime, "job master is gone"))
    }

    fn process(&mut self, item: Item) -> HarnessResult<()> {
        for out in self.chain.process(item)? {
            self.output.emit(out)?;
        }
        Ok(())
    }

    /// Snapshot, forward the barrier, then acknowledge. In that order,
    /// so that downstream never sees the barrier before this task's
    /// state for it exists.
    fn checkpoint(&mut self, barrier: Barrier, mut snapshot: TaskSnapshot) -> HarnessResult<()> {
        self.chain.snapshot_into(&mut snapshot)?;
        let state = snapshot.encode()?;
        self.output.broadcast(StreamElement::Barrier(barrier))?;
        trace!(
            "Task {} acknowledging checkpoint {} with {} bytes",
            self.task,
            barrier.checkpoint_id,
            state.len()
        );
        self.report(JobEvent::Acknowledge(Ack {
            attempt: self.attempt,
            task: self.task,
            checkpoint_id: barrier.checkpoint_id,
            state,
        }))
    }

    fn finish(&mut self) -> HarnessResult<()> {
        self.chain.end()?;
        self.output.broadcast(StreamElement::End)
    }

    fn run_source(
        &mut self,
        step_id: StepId,
        mut reader: Box<dyn InputReader>,
        control: Receiver<Control>,
    ) -> HarnessResult<()> {
        loop {
            self.interrupts.check()?;
            loop {
                match control.try_recv() {
                    Ok(Control::TriggerCheckpoint(barrier)) if barrier.attempt == self.attempt => {
                        let mut snapshot = TaskSnapshot::default();
                        let state = reader
                            .snapshot()
                            .reraise_with(|| format!("error snapshotting input {step_id}"))?;
                        snapshot.insert(step_id.clone(), state);
                        self.checkpoint(barrier, snapshot)?;
                    }
                    Ok(Control::TriggerCheckpoint(barrier)) => {
                        debug!(
                            "Ignoring trigger for {} from attempt {}",
                            barrier.checkpoint_id, barrier.attempt
                        );
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
            match reader.next() {
                Poll::Pending => thread::sleep(self.cooldown),
                Poll::Ready(Some(item)) => self.process(item)?,
                Poll::Ready(None) => return self.finish(),
            }
        }
    }

    fn run_channels(
        &mut self,
        receiver: Receiver<Envelope>,
        mut aligner: BarrierAligner,
    ) -> HarnessResult<()> {
        // Elements released by the aligner, which come before anything
        // still in the channel.
        let mut pending: VecDeque<(ChannelIndex, StreamElement)> = VecDeque::new();
        loop {
            self.interrupts.check()?;
            if pending.is_empty() && aligner.all_ended() {
                return self.finish();
            }

            let (channel, element) = match pending.pop_front() {
                Some(next) => next,
                None => match receiver.recv_timeout(self.cooldown) {
                    Ok(Envelope { channel, element }) => (channel, element),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        self.interrupts.check()?;
                        return Err(tracked_err(
                            HarnessError::Runtime,
                            "upstream disconnected before the end of the stream",
                        ));
                    }
                },
            };

            match aligner.process(channel, element)? {
                AlignResult::Forward(StreamElement::Record(item)) => self.process(item)?,
                // End is tracked by the aligner and barriers are never
                // forwarded as-is.
                AlignResult::Forward(_) | AlignResult::Held | AlignResult::Dropped => {}
                AlignResult::Aligned { barrier, released } => {
                    self.checkpoint(barrier, TaskSnapshot::default())?;
                    requeue(&mut pending, released);
                }
                AlignResult::Aborted {
                    checkpoint_id,
                    released,
                } => {
                    self.report(JobEvent::Decline(Decline {
                        attempt: self.attempt,
                        task: self.task,
                        checkpoint_id,
                        reason: "barrier alignment abandoned".to_string(),
                    }))?;
                    requeue(&mut pending, released);
                }
            }
        }
    }
}

fn requeue(
    pending: &mut VecDeque<(ChannelIndex, StreamElement)>,
    released: Vec<(ChannelIndex, StreamElement)>,
) {
    let mut next: VecDeque<_> = released.into();
    next.append(pending);
    *pending = next;
}

#[cfg(test)]
fn test_interrupts() -> Interrupts {
    Interrupts {
        cancel: Arc::new(AtomicBool::new(false)),
        kill: Arc::new(AtomicBool::new(false)),
    }
}

#[test]
fn requeue_puts_released_first() {
    let mut pending = VecDeque::from([(1, StreamElement::End)]);
    requeue(
        &mut pending,
        vec![(0, StreamElement::Record(serde_json::json!(1)))],
    );
    assert_eq!(
        pending,
        VecDeque::from([
            (0, StreamElement::Record(serde_json::json!(1))),
            (1, StreamElement::End)
        ])
    );
}

#[test]
fn interrupts_prefer_cancel() {
    let interrupts = test_interrupts();
    assert!(interrupts.check().is_ok());
    interrupts.kill.store(true, Ordering::Relaxed);
    assert!(matches!(interrupts.check(), Err(HarnessError::Runtime(_))));
    interrupts.cancel.store(true, Ordering::Relaxed);
    assert!(matches!(interrupts.check(), Err(HarnessError::Cancelled)));
}

#[test]
fn gate_send_gives_up_when_cancelled() {
    let (tx, _rx) = crossbeam_channel::bounded(1);
    let interrupts = test_interrupts();
    let gate = OutputGate::new(
        0,
        vec![tx],
        None,
        interrupts.clone(),
        Duration::from_millis(1),
    );
    gate.emit(serde_json::json!(1)).unwrap();
    // The channel is full now.
    interrupts.cancel.store(true, Ordering::Relaxed);
    assert!(matches!(
        gate.emit(serde_json::json!(2)),
        Err(HarnessError::Cancelled)
    ));
}

#[test]
fn channel_task_aligns_and_acks() {
    use std::collections::BTreeSet;

    use crate::pipeline::Step;

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let (in_tx, in_rx) = crossbeam_channel::bounded(16);
    let (out_tx, out_rx) = crossbeam_channel::bounded(16);
    let interrupts = test_interrupts();
    let task = TaskId::new(1, 0);
    let steps = vec![Step::Map {
        step_id: StepId::from("inc"),
        mapper: Arc::new(|item: Item| serde_json::json!(item.as_u64().unwrap_or(0) + 1)),
    }];
    let launch = TaskLaunch {
        task,
        attempt: Attempt(0),
        process: 0,
        input: TaskInput::Channels {
            receiver: in_rx,
            aligner: BarrierAligner::new(2, Attempt(0), 8),
        },
        chain: OperatorChain::build(&steps, task, 1, &mut TaskSnapshot::default()).unwrap(),
        output: OutputGate::new(
            0,
            vec![out_tx],
            None,
            interrupts.clone(),
            Duration::from_millis(1),
        ),
        events: events_tx,
        interrupts,
        cooldown: Duration::from_millis(1),
    };
    let barrier = Barrier {
        checkpoint_id: CheckpointId(1),
        attempt: Attempt(0),
        triggered_at: chrono::Utc::now(),
    };
    let send = |channel, element| in_tx.send(Envelope { channel, element }).unwrap();
    send(0, StreamElement::Record(serde_json::json!(1)));
    send(0, StreamElement::Barrier(barrier));
    send(0, StreamElement::Record(serde_json::json!(10)));
    send(1, StreamElement::Record(serde_json::json!(2)));
    send(1, StreamElement::Barrier(barrier));
    send(0, StreamElement::End);
    send(1, StreamElement::End);

    let handle = spawn_task(launch).unwrap();
    handle.join().unwrap();

    let out: Vec<StreamElement> = out_rx.try_iter().map(|env| env.element).collect();
    assert_eq!(
        out,
        vec![
            StreamElement::Record(serde_json::json!(2)),
            StreamElement::Record(serde_json::json!(3)),
            StreamElement::Barrier(barrier),
            StreamElement::Record(serde_json::json!(11)),
            StreamElement::End,
        ]
    );

    let events: Vec<JobEvent> = events_rx.try_iter().collect();
    let kinds: BTreeSet<&str> = events.iter().map(JobEvent::kind).collect();
    assert_eq!(kinds, BTreeSet::from(["running", "acknowledge", "finished"]));
}
