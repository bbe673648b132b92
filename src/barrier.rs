//! Aligning checkpoint barriers across a task's input channels.
//!
//! A task with several upstream channels must not snapshot for
//! checkpoint `K` until it has seen barrier `K` on every one of them.
//! While it waits, channels that already delivered `K` are blocked:
//! whatever they send next belongs after the checkpoint, so it is held
//! back in arrival order and released once alignment finishes.
//!
//! Alignment gives up (and the task declines the checkpoint) if the
//! held-back elements would exceed a fixed capacity, or if a barrier
//! for a newer checkpoint shows up on a channel that hasn't delivered
//! `K` yet.

use std::collections::VecDeque;

use tracing::debug;

use crate::errors::tracked_err;
use crate::errors::HarnessError;
use crate::errors::HarnessResult;
use crate::recovery::model::Attempt;
use crate::recovery::model::Barrier;
use crate::recovery::model::CheckpointId;
use crate::Item;

/// Index of an input channel at the receiving task.
///
/// This is the upstream task's instance index.
pub(crate) type ChannelIndex = usize;

/// Everything that flows between tasks.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StreamElement {
    Record(Item),
    Barrier(Barrier),
    /// The upstream task will send nothing more on this channel.
    End,
}

#[derive(Debug, PartialEq)]
pub(crate) enum AlignResult {
    /// Process this element now.
    Forward(StreamElement),
    /// Nothing to do; the element was held back or only advanced
    /// alignment.
    Held,
    /// The element was a barrier that doesn't apply anymore.
    Dropped,
    /// Every channel delivered the barrier. Snapshot, forward the
    /// barrier, then process `released` before anything else.
    Aligned {
        barrier: Barrier,
        released: Vec<(ChannelIndex, StreamElement)>,
    },
    /// Alignment for this checkpoint was abandoned. Decline it, then
    /// process `released` before anything else.
    Aborted {
        checkpoint_id: CheckpointId,
        released: Vec<(ChannelIndex, StreamElement)>,
    },
}

pub(crate) struct BarrierAligner {
    attempt: Attempt,
    capacity: usize,
    current: Option<Barrier>,
    received: Vec<bool>,
    ended: Vec<bool>,
    buffered: VecDeque<(ChannelIndex, StreamElement)>,
    /// Barriers for this or older checkpoints are late.
    last_cleared: Option<CheckpointId>,
}

impl BarrierAligner {
    pub(crate) fn new(num_inputs: usize, attempt: Attempt, capacity: usize) -> Self {
        Self {
            attempt,
            capacity,
            current: None,
            received: vec![false; num_inputs],
            ended: vec![false; num_inputs],
            buffered: VecDeque::new(),
            last_cleared: None,
        }
    }

    pub(crate) fn is_aligning(&self) -> bool {
        self.current.is_some()
    }

    /// Every input channel has delivered its end marker.
    pub(crate) fn all_ended(&self) -> bool {
        self.ended.iter().all(|ended| *ended)
    }

    pub(crate) fn process(
        &mut self,
        channel: ChannelIndex,
        element: StreamElement,
    ) -> HarnessResult<AlignResult> {
        if channel >= self.received.len() {
            return Err(tracked_err(
                HarnessError::Runtime,
                &format!(
                    "channel index {channel} out of bounds for {} inputs",
                    self.received.len()
                ),
            ));
        }
        match element {
            StreamElement::Barrier(barrier) => self.process_barrier(channel, barrier),
            other => self.process_non_barrier(channel, other),
        }
    }

    fn process_barrier(
        &mut self,
        channel: ChannelIndex,
        barrier: Barrier,
    ) -> HarnessResult<AlignResult> {
        if barrier.attempt != self.attempt {
            debug!(
                "Dropping barrier {} from attempt {}; running attempt {}",
                barrier.checkpoint_id, barrier.attempt, self.attempt
            );
            return Ok(AlignResult::Dropped);
        }
        if self
            .last_cleared
            .is_some_and(|cleared| barrier.checkpoint_id <= cleared)
        {
            debug!(
                "Dropping late barrier {} on channel {channel}",
                barrier.checkpoint_id
            );
            return Ok(AlignResult::Dropped);
        }

        match self.current {
            None => {
                self.current = Some(barrier);
                self.received[channel] = true;
            }
            Some(current) if self.received[channel] => {
                if barrier.checkpoint_id == current.checkpoint_id {
                    return Err(tracked_err(
                        HarnessError::Runtime,
                        &format!(
                            "duplicate barrier {} on channel {channel}",
                            barrier.checkpoint_id
                        ),
                    ));
                }
                // A later barrier on a blocked channel is just more
                // post-checkpoint input.
                return self.hold(channel, StreamElement::Barrier(barrier));
            }
            Some(current) if barrier.checkpoint_id > current.checkpoint_id => {
                debug!(
                    "Barrier {} overtook {} on channel {channel}; abandoning alignment",
                    barrier.checkpoint_id, current.checkpoint_id
                );
                let mut released = self.clear(current.checkpoint_id);
                released.push((channel, StreamElement::Barrier(barrier)));
                return Ok(AlignResult::Aborted {
                    checkpoint_id: current.checkpoint_id,
                    released,
                });
            }
            Some(current) if barrier.checkpoint_id < current.checkpoint_id => {
                return Ok(AlignResult::Dropped);
            }
            Some(_) => {
                self.received[channel] = true;
            }
        }
        Ok(self.try_complete())
    }

    fn process_non_barrier(
        &mut self,
        channel: ChannelIndex,
        element: StreamElement,
    ) -> HarnessResult<AlignResult> {
        if self.current.is_some() && self.received[channel] {
            return self.hold(channel, element);
        }
        if element == StreamElement::End {
            self.ended[channel] = true;
            if self.current.is_some() {
                // An ended channel will never deliver the barrier, so
                // it counts as aligned.
                return Ok(self.try_complete());
            }
        }
        Ok(AlignResult::Forward(element))
    }

    fn hold(
        &mut self,
        channel: ChannelIndex,
        element: StreamElement,
    ) -> HarnessResult<AlignResult> {
        let Some(current) = self.current else {
            return Err(tracked_err(
                HarnessError::Runtime,
                "tried to hold an element while not aligning",
            ));
        };
        if self.buffered.len() >= self.capacity {
            debug!(
                "Alignment buffer full at {} elements; abandoning checkpoint {}",
                self.capacity, current.checkpoint_id
            );
            let mut released = self.clear(current.checkpoint_id);
            released.push((channel, element));
            return Ok(AlignResult::Aborted {
                checkpoint_id: current.checkpoint_id,
                released,
            });
        }
        self.buffered.push_back((channel, element));
        Ok(AlignResult::Held)
    }

    fn try_complete(&mut self) -> AlignResult {
        let aligned = self
            .received
            .iter()
            .zip(&self.ended)
            .all(|(received, ended)| *received || *ended);
        match self.current {
            Some(barrier) if aligned => {
                let released = self.clear(barrier.checkpoint_id);
                AlignResult::Aligned { barrier, released }
            }
            _ => AlignResult::Held,
        }
    }

    fn clear(&mut self, checkpoint_id: CheckpointId) -> Vec<(ChannelIndex, StreamElement)> {
        self.current = None;
        self.last_cleared = Some(checkpoint_id);
        self.received.iter_mut().for_each(|received| *received = false);
        self.buffered.drain(..).collect()
    }
}

#[cfg(test)]
fn barrier(id: u64) -> Barrier {
    Barrier {
        checkpoint_id: CheckpointId(id),
        attempt: Attempt(0),
        triggered_at: chrono::Utc::now(),
    }
}

#[cfg(test)]
fn record(n: u64) -> StreamElement {
    StreamElement::Record(serde_json::json!(n))
}

#[test]
fn single_input_aligns_immediately() {
    let mut aligner = BarrierAligner::new(1, Attempt(0), 10);
    let b = barrier(1);
    assert_eq!(
        aligner.process(0, StreamElement::Barrier(b)).unwrap(),
        AlignResult::Aligned {
            barrier: b,
            released: vec![]
        }
    );
    assert!(!aligner.is_aligning());
}

#[test]
fn channel_out_of_bounds_is_error() {
    let mut aligner = BarrierAligner::new(2, Attempt(0), 10);
    assert!(aligner.process(2, record(1)).is_err());
}

#[test]
fn duplicate_barrier_is_error() {
    let mut aligner = BarrierAligner::new(2, Attempt(0), 10);
    let b = barrier(1);
    assert_eq!(
        aligner.process(0, StreamElement::Barrier(b)).unwrap(),
        AlignResult::Held
    );
    assert!(aligner.process(0, StreamElement::Barrier(b)).is_err());
}

#[test]
fn multi_input_blocks_and_releases_in_order() {
    let mut aligner = BarrierAligner::new(2, Attempt(0), 10);
    let b = barrier(1);

    assert_eq!(
        aligner.process(0, StreamElement::Barrier(b)).unwrap(),
        AlignResult::Held
    );
    assert!(aligner.is_aligning());
    // Channel 0 is blocked.
    assert_eq!(aligner.process(0, record(1)).unwrap(), AlignResult::Held);
    assert_eq!(aligner.process(0, record(2)).unwrap(), AlignResult::Held);
    // Channel 1 still flows.
    assert_eq!(
        aligner.process(1, record(10)).unwrap(),
        AlignResult::Forward(record(10))
    );

    assert_eq!(
        aligner.process(1, StreamElement::Barrier(b)).unwrap(),
        AlignResult::Aligned {
            barrier: b,
            released: vec![(0, record(1)), (0, record(2))]
        }
    );
    assert_eq!(
        aligner.process(0, record(3)).unwrap(),
        AlignResult::Forward(record(3))
    );
}

#[test]
fn ended_channel_counts_as_aligned() {
    let mut aligner = BarrierAligner::new(3, Attempt(0), 10);
    let b = barrier(1);

    assert_eq!(
        aligner.process(2, StreamElement::End).unwrap(),
        AlignResult::Forward(StreamElement::End)
    );
    assert_eq!(
        aligner.process(0, StreamElement::Barrier(b)).unwrap(),
        AlignResult::Held
    );
    // Ending while aligning completes the alignment too.
    assert_eq!(
        aligner.process(1, StreamElement::End).unwrap(),
        AlignResult::Aligned {
            barrier: b,
            released: vec![]
        }
    );
    assert!(!aligner.all_ended());
    assert_eq!(
        aligner.process(0, StreamElement::End).unwrap(),
        AlignResult::Forward(StreamElement::End)
    );
    assert!(aligner.all_ended());
}

#[test]
fn buffer_overflow_aborts() {
    let mut aligner = BarrierAligner::new(2, Attempt(0), 2);
    let b = barrier(1);

    aligner.process(0, StreamElement::Barrier(b)).unwrap();
    assert_eq!(aligner.process(0, record(1)).unwrap(), AlignResult::Held);
    assert_eq!(aligner.process(0, record(2)).unwrap(), AlignResult::Held);
    assert_eq!(
        aligner.process(0, record(3)).unwrap(),
        AlignResult::Aborted {
            checkpoint_id: CheckpointId(1),
            released: vec![(0, record(1)), (0, record(2)), (0, record(3))]
        }
    );
    assert!(!aligner.is_aligning());

    // The rest of checkpoint 1 is late now.
    assert_eq!(
        aligner.process(1, StreamElement::Barrier(b)).unwrap(),
        AlignResult::Dropped
    );
}

#[test]
fn newer_barrier_aborts_current() {
    let mut aligner = BarrierAligner::new(2, Attempt(0), 10);
    let b1 = barrier(1);
    let b2 = barrier(2);

    aligner.process(0, StreamElement::Barrier(b1)).unwrap();
    aligner.process(0, record(1)).unwrap();
    assert_eq!(
        aligner.process(1, StreamElement::Barrier(b2)).unwrap(),
        AlignResult::Aborted {
            checkpoint_id: CheckpointId(1),
            released: vec![(0, record(1)), (1, StreamElement::Barrier(b2))]
        }
    );

    // Re-feeding the released elements starts aligning checkpoint 2.
    assert_eq!(
        aligner.process(0, record(1)).unwrap(),
        AlignResult::Forward(record(1))
    );
    assert_eq!(
        aligner.process(1, StreamElement::Barrier(b2)).unwrap(),
        AlignResult::Held
    );
    assert_eq!(
        aligner.process(0, StreamElement::Barrier(b2)).unwrap(),
        AlignResult::Aligned {
            barrier: b2,
            released: vec![]
        }
    );
}

#[test]
fn next_barrier_on_blocked_channel_is_held() {
    let mut aligner = BarrierAligner::new(2, Attempt(0), 10);
    let b1 = barrier(1);
    let b2 = barrier(2);

    aligner.process(0, StreamElement::Barrier(b1)).unwrap();
    assert_eq!(
        aligner.process(0, StreamElement::Barrier(b2)).unwrap(),
        AlignResult::Held
    );
    assert_eq!(
        aligner.process(1, StreamElement::Barrier(b1)).unwrap(),
        AlignResult::Aligned {
            barrier: b1,
            released: vec![(0, StreamElement::Barrier(b2))]
        }
    );
}

#[test]
fn stale_attempt_barrier_dropped() {
    let mut aligner = BarrierAligner::new(2, Attempt(1), 10);
    assert_eq!(
        aligner.process(0, StreamElement::Barrier(barrier(7))).unwrap(),
        AlignResult::Dropped
    );
    assert!(!aligner.is_aligning());
}

#[test]
fn late_barrier_after_aligned_dropped() {
    let mut aligner = BarrierAligner::new(1, Attempt(0), 10);
    aligner
        .process(0, StreamElement::Barrier(barrier(2)))
        .unwrap();
    assert_eq!(
        aligner.process(0, StreamElement::Barrier(barrier(1))).unwrap(),
        AlignResult::Dropped
    );
    assert_eq!(
        aligner.process(0, StreamElement::Barrier(barrier(2))).unwrap(),
        AlignResult::Dropped
    );
}
