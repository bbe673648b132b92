//! Helpers for testing pipelines under failures.
//!
//! [`StreamFaultToleranceTest`] is a test that builds a pipeline, runs
//! it on the standard test cluster with checkpointing every
//! [`CHECKPOINT_INTERVAL`], and then checks how the job ended. The
//! inputs and outputs here are built for that: [`TestingInput`] is
//! replayable so that a restored job reads exactly what it would have
//! read, and [`MaxCountOutput`] is idempotent so that replays after a
//! recovery don't change what it reports.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;

use crate::config::ClusterConfig;
use crate::config::JobConfig;
use crate::errors::tracked_err;
use crate::errors::HarnessError;
use crate::errors::HarnessResult;
use crate::errors::Reraise;
use crate::execution::JobHandle;
use crate::inputs::InputBuilder;
use crate::inputs::InputReader;
use crate::oracle::Completion;
use crate::outputs::OutputBuilder;
use crate::outputs::OutputWriter;
use crate::pipeline::Pipeline;
use crate::recovery::model::InstanceIndex;
use crate::recovery::model::StateBytes;
use crate::run::Cluster;
use crate::Item;

pub const NUM_TASK_MANAGERS: usize = 2;
pub const NUM_TASK_SLOTS: usize = 3;
pub const PARALLELISM: usize = NUM_TASK_MANAGERS * NUM_TASK_SLOTS;
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_millis(500);

/// A pipeline test run on the standard test cluster.
pub trait StreamFaultToleranceTest {
    /// Assemble the pipeline under test.
    fn test_program(&self, pipeline: &mut Pipeline);

    /// Called after submitting, while the job runs. This is where to
    /// inject failures.
    fn during_run(&self, _handle: &JobHandle) -> HarnessResult<()> {
        Ok(())
    }

    /// Check how the job ended. Only called if the job ended within
    /// [`Self::timeout`].
    fn post_submit(&self, completion: &Completion);

    /// Adjust the standard config before the cluster is built.
    fn configure(&self, _config: &mut JobConfig) {}

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn name(&self) -> String {
        "fault-tolerance-test".to_string()
    }
}

/// The config every [`StreamFaultToleranceTest`] starts from.
pub fn standard_config() -> JobConfig {
    let mut config = JobConfig {
        cluster: ClusterConfig::new(NUM_TASK_MANAGERS, NUM_TASK_SLOTS),
        ..JobConfig::default()
    };
    config.checkpoint.interval = CHECKPOINT_INTERVAL;
    config.runtime.restart_delay = Duration::ZERO;
    config
}

/// Run a test's pipeline and then its checks.
///
/// Errors if the job can't be submitted or doesn't end in time.
pub fn run_checkpointed_program(test: &impl StreamFaultToleranceTest) -> HarnessResult<Completion> {
    let mut config = standard_config();
    test.configure(&mut config);
    let cluster = Cluster::new(config)?;

    let mut pipeline = Pipeline::new(test.name());
    test.test_program(&mut pipeline);

    let handle = cluster.submit(&pipeline)?;
    test.during_run(&handle)
        .reraise_with(|| format!("error while job {} was running", handle.job_id()))?;

    let completion = handle.wait_for_completion(test.timeout());
    if let Completion::TimedOut(state) = &completion {
        // Don't leave the job running past the test.
        if let Err(err) = handle.cancel() {
            tracing::debug!("Job {} ended before it could be cancelled: {err}", state.job_id);
        }
        return Err(tracked_err(
            HarnessError::Runtime,
            &format!(
                "job {} still {} after {:?}",
                state.job_id,
                state.status,
                test.timeout()
            ),
        ));
    }
    test.post_submit(&completion);
    Ok(completion)
}

/// How many times a value was seen under a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixCount {
    pub prefix: String,
    pub value: String,
    pub count: u64,
}

impl PrefixCount {
    pub fn new(prefix: impl Into<String>, value: impl Into<String>, count: u64) -> Self {
        Self {
            prefix: prefix.into(),
            value: value.into(),
            count,
        }
    }

    pub fn to_item(&self) -> HarnessResult<Item> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_item(item: &Item) -> HarnessResult<Self> {
        Self::deserialize(item).reraise_with(|| format!("{item} is not a prefix count"))
    }
}

impl fmt::Display for PrefixCount {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} / {}", self.prefix, self.value)
    }
}

/// Replays a fixed list of items.
///
/// Partition `i` of `n` reads every item whose position is `i` modulo
/// `n`. The reader's state is the position of its next item, so a
/// resumed reader picks up exactly where the snapshot was taken.
#[derive(Clone)]
pub struct TestingInput {
    items: Arc<Vec<Item>>,
    pace: Option<Duration>,
    stateful: bool,
}

impl TestingInput {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items: Arc::new(items),
            pace: None,
            stateful: true,
        }
    }

    /// Emit at most one item per `pace` from each partition, so a job
    /// runs long enough to checkpoint.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Ignore snapshots and always start from the beginning.
    pub fn stateless(mut self) -> Self {
        self.stateful = false;
        self
    }
}

struct TestingReader {
    items: Arc<Vec<Item>>,
    next_pos: usize,
    step: usize,
    pace: Option<Duration>,
    last_emit: Option<Instant>,
}

impl InputReader for TestingReader {
    fn next(&mut self) -> Poll<Option<Item>> {
        if let (Some(pace), Some(last_emit)) = (self.pace, self.last_emit) {
            if last_emit.elapsed() < pace {
                return Poll::Pending;
            }
        }
        match self.items.get(self.next_pos) {
            Some(item) => {
                self.next_pos += self.step;
                self.last_emit = Some(Instant::now());
                Poll::Ready(Some(item.clone()))
            }
            None => Poll::Ready(None),
        }
    }

    fn snapshot(&self) -> HarnessResult<StateBytes> {
        StateBytes::ser(&self.next_pos)
    }
}

impl InputBuilder for TestingInput {
    fn build(
        &self,
        index: InstanceIndex,
        count: usize,
        resume: Option<StateBytes>,
    ) -> HarnessResult<Box<dyn InputReader>> {
        let next_pos = match resume {
            Some(state) if self.stateful => state.de::<usize>()?,
            _ => index.0,
        };
        Ok(Box::new(TestingReader {
            items: self.items.clone(),
            next_pos,
            step: count.max(1),
            pace: self.pace,
            last_emit: None,
        }))
    }

    fn is_stateful(&self) -> bool {
        self.stateful
    }
}

/// Collects every item written, from every task, in arrival order.
///
/// Replays after a recovery show up as duplicates.
#[derive(Clone, Default)]
pub struct CollectOutput {
    items: Arc<Mutex<Vec<Item>>>,
}

impl CollectOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<Item> {
        self.items.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

struct CollectWriter {
    items: Arc<Mutex<Vec<Item>>>,
}

impl OutputWriter for CollectWriter {
    fn write(&mut self, item: Item) -> HarnessResult<()> {
        self.items.lock().push(item);
        Ok(())
    }
}

impl OutputBuilder for CollectOutput {
    fn build(&self, _index: InstanceIndex, _count: usize) -> HarnessResult<Box<dyn OutputWriter>> {
        Ok(Box::new(CollectWriter {
            items: self.items.clone(),
        }))
    }
}

/// Keeps the highest count seen per prefix.
///
/// Items must be [`PrefixCount`]s. Counts only ever go up, so writing
/// the same counts again after a replay changes nothing.
#[derive(Clone, Default)]
pub struct MaxCountOutput {
    counts: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl MaxCountOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.counts.lock().clone()
    }
}

struct MaxCountWriter {
    counts: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl OutputWriter for MaxCountWriter {
    fn write(&mut self, item: Item) -> HarnessResult<()> {
        let PrefixCount { prefix, count, .. } = PrefixCount::from_item(&item)?;
        let mut counts = self.counts.lock();
        let max = counts.entry(prefix).or_insert(0);
        *max = (*max).max(count);
        Ok(())
    }
}

impl OutputBuilder for MaxCountOutput {
    fn build(&self, _index: InstanceIndex, _count: usize) -> HarnessResult<Box<dyn OutputWriter>> {
        Ok(Box::new(MaxCountWriter {
            counts: self.counts.clone(),
        }))
    }
}

/// Panics the first time it has been ticked `after` times, across
/// every clone and every task.
///
/// Put a tick in a step to make the task running it crash once.
#[derive(Clone)]
pub struct FailOnce {
    after: usize,
    seen: Arc<AtomicUsize>,
    fired: Arc<AtomicBool>,
}

impl FailOnce {
    pub fn after(after: usize) -> Self {
        Self {
            after,
            seen: Arc::new(AtomicUsize::new(0)),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tick(&self) {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen >= self.after && !self.fired.swap(true, Ordering::SeqCst) {
            panic!("FailOnce: failing after {seen} items");
        }
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

#[test]
fn testing_input_partitions_and_resumes() {
    use serde_json::json;

    let input = TestingInput::new((0..7).map(|i| json!(i)).collect());
    let mut reader = input.build(InstanceIndex(1), 3, None).unwrap();
    assert_eq!(reader.next(), Poll::Ready(Some(json!(1))));
    let snapshot = reader.snapshot().unwrap();
    assert_eq!(reader.next(), Poll::Ready(Some(json!(4))));

    let mut resumed = input.build(InstanceIndex(1), 3, Some(snapshot.clone())).unwrap();
    assert_eq!(resumed.next(), Poll::Ready(Some(json!(4))));
    assert_eq!(resumed.next(), Poll::Ready(None));

    let mut restarted = input
        .clone()
        .stateless()
        .build(InstanceIndex(1), 3, Some(snapshot))
        .unwrap();
    assert_eq!(restarted.next(), Poll::Ready(Some(json!(1))));
}

#[test]
fn paced_input_is_pending_between_items() {
    let input = TestingInput::new(vec![serde_json::json!(0), serde_json::json!(1)])
        .with_pace(Duration::from_secs(60));
    let mut reader = input.build(InstanceIndex(0), 1, None).unwrap();
    assert!(matches!(reader.next(), Poll::Ready(Some(_))));
    assert_eq!(reader.next(), Poll::Pending);
}

#[test]
fn max_count_ignores_replays() {
    let out = MaxCountOutput::new();
    let mut writer = out.build(InstanceIndex(0), 1).unwrap();
    for count in [1, 2, 3, 2, 3] {
        writer
            .write(PrefixCount::new("a", "x", count).to_item().unwrap())
            .unwrap();
    }
    writer
        .write(PrefixCount::new("b", "y", 1).to_item().unwrap())
        .unwrap();
    assert_eq!(
        out.counts(),
        BTreeMap::from([("a".to_string(), 3), ("b".to_string(), 1)])
    );
    assert!(writer.write(serde_json::json!("nope")).is_err());
}

#[test]
fn prefix_count_display() {
    assert_eq!(PrefixCount::new("ab", "abc", 2).to_string(), "ab / abc");
}

#[test]
fn fail_once_fires_once() {
    let fail = FailOnce::after(2);
    fail.tick();
    assert!(!fail.fired());
    let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| fail.tick()));
    assert!(res.is_err());
    fail.tick();
    assert!(fail.fired());
}

#[test]
fn timed_out_program_is_cancelled() {
    use crate::oracle::CompletionOracle;
    use crate::recovery::model::FailureReason;

    struct Slow {
        oracle: Mutex<Option<CompletionOracle>>,
    }

    impl StreamFaultToleranceTest for Slow {
        fn test_program(&self, pipeline: &mut Pipeline) {
            let items = (0..10_000).map(|i| serde_json::json!(i)).collect();
            pipeline
                .input(
                    "inp",
                    TestingInput::new(items).with_pace(Duration::from_millis(10)),
                )
                .output("out", CollectOutput::new());
        }

        fn during_run(&self, handle: &JobHandle) -> HarnessResult<()> {
            *self.oracle.lock() = Some(handle.oracle().clone());
            Ok(())
        }

        fn post_submit(&self, completion: &Completion) {
            panic!("job should not have ended: {completion:?}");
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(200)
        }
    }

    let test = Slow {
        oracle: Mutex::new(None),
    };
    assert!(matches!(
        run_checkpointed_program(&test),
        Err(HarnessError::Runtime(_))
    ));
    let oracle = test.oracle.lock().take().unwrap();
    match oracle.wait_for_completion(Duration::from_secs(30)) {
        Completion::Failed { reason, .. } => assert_eq!(reason, FailureReason::Cancelled),
        other => panic!("expected the job to be cancelled, got {other:?}"),
    }
}
