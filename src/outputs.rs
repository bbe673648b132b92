//! Sinks for the items of a pipeline.
//!
//! Outputs are written from every task of the stage they are in, so
//! an [`OutputBuilder`] is called once per task. Writers are not
//! snapshotted: after a recovery they see replayed items again, and a
//! sink that must not double count has to be idempotent on its own.

use crate::errors::HarnessResult;
use crate::recovery::model::InstanceIndex;
use crate::Item;

pub trait OutputWriter: Send {
    fn write(&mut self, item: Item) -> HarnessResult<()>;

    /// Called once the upstream stream ended.
    fn close(&mut self) -> HarnessResult<()> {
        Ok(())
    }
}

/// Builds one [`OutputWriter`] per task of the stage.
pub trait OutputBuilder: Send + Sync + 'static {
    fn build(&self, index: InstanceIndex, count: usize) -> HarnessResult<Box<dyn OutputWriter>>;
}

impl<F> OutputBuilder for F
where
    F: Fn(InstanceIndex, usize) -> HarnessResult<Box<dyn OutputWriter>> + Send + Sync + 'static,
{
    fn build(&self, index: InstanceIndex, count: usize) -> HarnessResult<Box<dyn OutputWriter>> {
        self(index, count)
    }
}

/// Writes each item as a line of JSON to stdout.
pub struct StdOutput;

struct StdOutputWriter {
    index: InstanceIndex,
}

impl OutputWriter for StdOutputWriter {
    fn write(&mut self, item: Item) -> HarnessResult<()> {
        println!("{} {item}", self.index.0);
        Ok(())
    }
}

impl OutputBuilder for StdOutput {
    fn build(&self, index: InstanceIndex, _count: usize) -> HarnessResult<Box<dyn OutputWriter>> {
        Ok(Box::new(StdOutputWriter { index }))
    }
}

#[test]
fn closure_builder_builds_writer() {
    use std::sync::Arc;

    use parking_lot::Mutex;

    struct Recorder(Arc<Mutex<Vec<(usize, Item)>>>, usize);

    impl OutputWriter for Recorder {
        fn write(&mut self, item: Item) -> HarnessResult<()> {
            self.0.lock().push((self.1, item));
            Ok(())
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let builder = {
        let seen = seen.clone();
        move |index: InstanceIndex, _count: usize| -> HarnessResult<Box<dyn OutputWriter>> {
            Ok(Box::new(Recorder(seen.clone(), index.0)))
        }
    };

    let mut writer = builder.build(InstanceIndex(2), 3).unwrap();
    writer.write(serde_json::json!("x")).unwrap();
    writer.close().unwrap();
    assert_eq!(*seen.lock(), vec![(2, serde_json::json!("x"))]);
}
