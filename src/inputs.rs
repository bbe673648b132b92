//! Sources of items for a pipeline.
//!
//! An input is described by an [`InputBuilder`]. When a job is
//! deployed (and again on every recovery) the builder is called once
//! per source task and produces an [`InputReader`] for that task's
//! partition, resumed from the state the reader snapshotted in the
//! checkpoint being restored.

use std::task::Poll;

use crate::errors::HarnessResult;
use crate::recovery::model::InstanceIndex;
use crate::recovery::model::StateBytes;
use crate::Item;

/// Reads one partition of an input.
///
/// A reader must be replayable: restoring from a snapshot and reading
/// on has to yield exactly what the reader yielded after that snapshot
/// was taken. That is what makes restored runs produce the same
/// results as failure-free ones.
pub trait InputReader: Send {
    /// Return the next item, if any is available.
    ///
    /// This must never block; return [`Poll::Pending`] if there is no
    /// item yet and the task will call again after a short cooldown.
    /// [`Poll::Ready`] of `None` means this partition is exhausted and
    /// `next` will not be called again.
    fn next(&mut self) -> Poll<Option<Item>>;

    /// Snapshot the position of this reader.
    ///
    /// Called when a checkpoint barrier reaches the source, after
    /// every item returned so far and before any later one.
    fn snapshot(&self) -> HarnessResult<StateBytes>;
}

/// Builds one [`InputReader`] per source task.
pub trait InputBuilder: Send + Sync + 'static {
    /// `index` is which of `count` partitions to read. `resume` is
    /// the state the previous reader for this partition snapshotted,
    /// or `None` when starting fresh.
    fn build(
        &self,
        index: InstanceIndex,
        count: usize,
        resume: Option<StateBytes>,
    ) -> HarnessResult<Box<dyn InputReader>>;

    /// If reader positions matter on recovery.
    ///
    /// An input that always starts over from the beginning, or that
    /// only reads whatever is live right now, has no state worth
    /// restoring. A job made only of stateless parts can be restarted
    /// without any completed checkpoint.
    fn is_stateful(&self) -> bool {
        true
    }
}

impl<F> InputBuilder for F
where
    F: Fn(InstanceIndex, usize, Option<StateBytes>) -> HarnessResult<Box<dyn InputReader>>
        + Send
        + Sync
        + 'static,
{
    fn build(
        &self,
        index: InstanceIndex,
        count: usize,
        resume: Option<StateBytes>,
    ) -> HarnessResult<Box<dyn InputReader>> {
        self(index, count, resume)
    }
}

#[cfg(test)]
struct CountdownReader(u64);

#[cfg(test)]
impl InputReader for CountdownReader {
    fn next(&mut self) -> Poll<Option<Item>> {
        if self.0 == 0 {
            Poll::Ready(None)
        } else {
            self.0 -= 1;
            Poll::Ready(Some(serde_json::json!(self.0)))
        }
    }

    fn snapshot(&self) -> HarnessResult<StateBytes> {
        StateBytes::ser(&self.0)
    }
}

#[test]
fn closure_builder_resumes() {
    let builder = |index: InstanceIndex,
                   _count: usize,
                   resume: Option<StateBytes>|
     -> HarnessResult<Box<dyn InputReader>> {
        let start = match resume {
            Some(state) => state.de()?,
            None => 3 + index.0 as u64,
        };
        Ok(Box::new(CountdownReader(start)))
    };

    let mut reader = builder.build(InstanceIndex(0), 1, None).unwrap();
    assert_eq!(reader.next(), Poll::Ready(Some(serde_json::json!(2))));
    let snapshot = reader.snapshot().unwrap();

    let mut resumed = builder.build(InstanceIndex(0), 1, Some(snapshot)).unwrap();
    assert_eq!(resumed.next(), Poll::Ready(Some(serde_json::json!(1))));
    assert_eq!(resumed.next(), Poll::Ready(Some(serde_json::json!(0))));
    assert_eq!(resumed.next(), Poll::Ready(None));
}
