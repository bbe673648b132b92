use std::collections::BTreeMap;
use std::time::Duration;

use faultline::config::JobConfig;
use faultline::config::StoreConfig;
use faultline::oracle::Completion;
use faultline::pipeline::Pipeline;
use faultline::recovery::model::*;
use faultline::recovery::store::CheckpointStore;
use faultline::recovery::store::SqliteStore;
use faultline::run::Cluster;
use faultline::testing::*;
use faultline::HarnessResult;
use faultline::JobHandle;
use serde_json::json;

const PREFIXES: u64 = 7;

fn numbers(count: u64) -> Vec<serde_json::Value> {
    (0..count).map(|i| json!(i)).collect()
}

fn expected_counts(count: u64) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for i in 0..count {
        *counts.entry(format!("p{}", i % PREFIXES)).or_insert(0) += 1;
    }
    counts
}

/// Count how many numbers were seen per prefix.
fn prefix_count_program(pipeline: &mut Pipeline, input: TestingInput, out: &MaxCountOutput) {
    pipeline
        .input("inp", input)
        .map("prefix", |item| {
            let i = item.as_u64().unwrap_or(0);
            json!({"prefix": format!("p{}", i % PREFIXES), "value": i.to_string()})
        })
        .stateful_map(
            "count",
            |item| item["prefix"].as_str().unwrap_or_default().to_string(),
            || json!(0),
            |count, item| {
                let next = count.as_u64().unwrap_or(0) + 1;
                *count = json!(next);
                PrefixCount::new(
                    item["prefix"].as_str().unwrap_or_default(),
                    item["value"].as_str().unwrap_or_default(),
                    next,
                )
                .to_item()
                .ok()
            },
        )
        .output("out", out.clone());
}

fn random_task(handle: &JobHandle) -> TaskId {
    let tasks: Vec<TaskId> = handle.task_ids().into_iter().collect();
    tasks[fastrand::usize(..tasks.len())]
}

struct KillAfterThirdCheckpoint {
    items: u64,
    out: MaxCountOutput,
}

impl StreamFaultToleranceTest for KillAfterThirdCheckpoint {
    fn test_program(&self, pipeline: &mut Pipeline) {
        let input = TestingInput::new(numbers(self.items)).with_pace(Duration::from_millis(5));
        prefix_count_program(pipeline, input, &self.out);
    }

    fn during_run(&self, handle: &JobHandle) -> HarnessResult<()> {
        let reached = handle
            .oracle()
            .wait_for_checkpoint(CheckpointId(3), Duration::from_secs(30));
        assert_eq!(reached, Some(CheckpointId(3)));
        // Somewhere before checkpoint 4 could complete.
        std::thread::sleep(Duration::from_millis(fastrand::u64(0..100)));
        assert_eq!(
            handle.oracle().last_completed_checkpoint(),
            Some(CheckpointId(3))
        );
        handle.inject_failure(random_task(handle))
    }

    fn post_submit(&self, completion: &Completion) {
        assert!(completion.is_finished(), "{completion:?}");
        let state = completion.state();
        assert_eq!(state.recoveries.len(), 1, "{state:?}");
        assert_eq!(state.recoveries[0].restored_from, Some(CheckpointId(3)));
        assert_eq!(state.attempt, Attempt(1));
        assert_eq!(self.out.counts(), expected_counts(self.items));
    }

    fn name(&self) -> String {
        "prefix-count".to_string()
    }
}

#[test]
fn prefix_count_recovers_from_checkpoint() {
    let test = KillAfterThirdCheckpoint {
        items: 6 * 600,
        out: MaxCountOutput::new(),
    };
    run_checkpointed_program(&test).unwrap();
}

struct NoFailures {
    out: MaxCountOutput,
}

impl StreamFaultToleranceTest for NoFailures {
    fn test_program(&self, pipeline: &mut Pipeline) {
        prefix_count_program(pipeline, TestingInput::new(numbers(1_000)), &self.out);
    }

    fn post_submit(&self, completion: &Completion) {
        assert!(completion.is_finished(), "{completion:?}");
        assert!(completion.state().recoveries.is_empty());
        assert_eq!(self.out.counts(), expected_counts(1_000));
    }
}

#[test]
fn failure_free_run_finishes() {
    run_checkpointed_program(&NoFailures {
        out: MaxCountOutput::new(),
    })
    .unwrap();
}

struct ExpireEverything {
    out: MaxCountOutput,
    inject: bool,
}

impl StreamFaultToleranceTest for ExpireEverything {
    fn test_program(&self, pipeline: &mut Pipeline) {
        let input = TestingInput::new(numbers(6 * 200)).with_pace(Duration::from_millis(5));
        prefix_count_program(pipeline, input, &self.out);
    }

    fn configure(&self, config: &mut JobConfig) {
        config.checkpoint.interval = Duration::from_millis(50);
        config.checkpoint.expiry_timeout = Some(Duration::ZERO);
    }

    fn during_run(&self, handle: &JobHandle) -> HarnessResult<()> {
        if self.inject {
            std::thread::sleep(Duration::from_millis(300));
            handle.inject_failure(TaskId::new(0, 0))?;
        }
        Ok(())
    }

    fn post_submit(&self, completion: &Completion) {
        let state = completion.state();
        assert_eq!(state.last_completed_checkpoint, None);
        assert_eq!(state.checkpoints.completed, 0);
        if self.inject {
            assert_eq!(
                completion,
                &Completion::Failed {
                    reason: FailureReason::RecoveryExhausted,
                    state: state.clone(),
                }
            );
        } else {
            assert!(completion.is_finished(), "{completion:?}");
            assert!(state.checkpoints.triggered > 0);
            assert!(state.checkpoints.expired > 0);
            assert_eq!(self.out.counts(), expected_counts(6 * 200));
        }
    }
}

#[test]
fn zero_expiry_timeout_still_finishes() {
    run_checkpointed_program(&ExpireEverything {
        out: MaxCountOutput::new(),
        inject: false,
    })
    .unwrap();
}

#[test]
fn failure_without_checkpoint_exhausts_recovery() {
    let completion = run_checkpointed_program(&ExpireEverything {
        out: MaxCountOutput::new(),
        inject: true,
    })
    .unwrap();
    assert!(!completion.is_finished());
}

struct PanicInMapper {
    items: u64,
    fail: FailOnce,
    out: MaxCountOutput,
}

impl StreamFaultToleranceTest for PanicInMapper {
    fn test_program(&self, pipeline: &mut Pipeline) {
        let fail = self.fail.clone();
        pipeline
            .input(
                "inp",
                TestingInput::new(numbers(self.items)).with_pace(Duration::from_millis(5)),
            )
            .inspect("boom", move |_item| fail.tick())
            .map("prefix", |item| {
                let i = item.as_u64().unwrap_or(0);
                json!({"prefix": format!("p{}", i % PREFIXES), "value": i.to_string()})
            })
            .stateful_map(
                "count",
                |item| item["prefix"].as_str().unwrap_or_default().to_string(),
                || json!(0),
                |count, item| {
                    let next = count.as_u64().unwrap_or(0) + 1;
                    *count = json!(next);
                    PrefixCount::new(
                        item["prefix"].as_str().unwrap_or_default(),
                        item["value"].as_str().unwrap_or_default(),
                        next,
                    )
                    .to_item()
                    .ok()
                },
            )
            .output("out", self.out.clone());
    }

    fn post_submit(&self, completion: &Completion) {
        assert!(self.fail.fired());
        assert!(completion.is_finished(), "{completion:?}");
        let state = completion.state();
        assert_eq!(state.recoveries.len(), 1);
        assert!(state.recoveries[0].restored_from.is_some());
        assert!(
            state.recoveries[0].cause.contains("FailOnce"),
            "{:?}",
            state.recoveries[0].cause
        );
        assert_eq!(self.out.counts(), expected_counts(self.items));
    }
}

#[test]
fn operator_panic_is_recovered() {
    let items = 6 * 600;
    run_checkpointed_program(&PanicInMapper {
        items,
        fail: FailOnce::after(items as usize * 2 / 3),
        out: MaxCountOutput::new(),
    })
    .unwrap();
}

#[test]
fn cancel_after_wait_times_out() {
    let cluster = Cluster::new(standard_config()).unwrap();
    let out = MaxCountOutput::new();
    let mut pipeline = Pipeline::new("forever");
    prefix_count_program(
        &mut pipeline,
        TestingInput::new(numbers(6 * 10_000)).with_pace(Duration::from_millis(10)),
        &out,
    );
    let handle = cluster.submit(&pipeline).unwrap();

    let waited = handle.wait_for_completion(Duration::from_millis(100));
    assert!(matches!(waited, Completion::TimedOut(_)), "{waited:?}");
    assert!(!handle.oracle().status().is_terminal());

    handle.cancel().unwrap();
    match handle.wait_for_completion(Duration::from_secs(30)) {
        Completion::Failed { reason, .. } => assert_eq!(reason, FailureReason::Cancelled),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(!handle.oracle().is_safe_to_inspect());
    assert!(handle.cancel().is_err());
}

#[test]
fn stateless_job_restarts_from_scratch() {
    let mut config = standard_config();
    config.checkpoint.expiry_timeout = Some(Duration::ZERO);
    let cluster = Cluster::new(config).unwrap();

    let out = CollectOutput::new();
    let mut pipeline = Pipeline::new("stateless");
    pipeline
        .input(
            "inp",
            TestingInput::new(numbers(6 * 100))
                .with_pace(Duration::from_millis(5))
                .stateless(),
        )
        .map("double", |item| json!(item.as_u64().unwrap_or(0) * 2))
        .output("out", out.clone());
    let handle = cluster.submit(&pipeline).unwrap();

    std::thread::sleep(Duration::from_millis(200));
    handle.inject_failure(TaskId::new(0, 3)).unwrap();

    let completion = handle.wait_for_completion(Duration::from_secs(60));
    assert!(completion.is_finished(), "{completion:?}");
    let state = completion.state();
    assert_eq!(state.recoveries.len(), 1);
    assert_eq!(state.recoveries[0].restored_from, None);
    // Everything read before the failure is read again.
    assert!(out.len() > 6 * 100, "{}", out.len());
}

#[test]
fn sqlite_store_records_progress() {
    let dir = tempfile::tempdir().unwrap();
    let db_file = dir.path().join("checkpoints.sqlite3");
    let mut config = standard_config();
    config.checkpoint.interval = Duration::from_millis(100);
    config.store = StoreConfig::Sqlite {
        db_file: db_file.clone(),
    };
    let cluster = Cluster::new(config).unwrap();

    let out = MaxCountOutput::new();
    let mut pipeline = Pipeline::new("durable");
    prefix_count_program(
        &mut pipeline,
        TestingInput::new(numbers(6 * 200)).with_pace(Duration::from_millis(3)),
        &out,
    );
    let handle = cluster.submit(&pipeline).unwrap();
    let completion = handle.wait_for_completion(Duration::from_secs(60));
    assert!(completion.is_finished(), "{completion:?}");
    let last = completion.state().last_completed_checkpoint;
    assert!(last.is_some());

    let store = SqliteStore::open(&db_file, handle.job_id().clone()).unwrap();
    let record = store.load_job(handle.job_id()).unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Finished);
    assert_eq!(record.last_completed, last);
    // Only the newest checkpoint is retained.
    assert_eq!(store.checkpoint_ids().unwrap(), vec![last.unwrap()]);
    let latest = store.load_latest().unwrap().unwrap();
    assert_eq!(latest.snapshots.len(), handle.task_ids().len());
}

#[test]
fn shared_sqlite_file_keeps_runs_apart() {
    let dir = tempfile::tempdir().unwrap();
    let db_file = dir.path().join("shared.sqlite3");

    // Leftovers of earlier runs of a pipeline with the same name.
    let now = chrono::Utc::now();
    let foreign = CompletedCheckpoint {
        id: CheckpointId(999),
        attempt: Attempt(0),
        triggered_at: now,
        completed_at: now,
        snapshots: BTreeMap::new(),
    };
    for n in 0..50 {
        let mut store = SqliteStore::open(&db_file, JobId(format!("nightly-{n}"))).unwrap();
        store.save_completed(&foreign).unwrap();
    }

    let mut config = standard_config();
    config.checkpoint.interval = Duration::from_millis(100);
    config.store = StoreConfig::Sqlite {
        db_file: db_file.clone(),
    };
    let cluster = Cluster::new(config).unwrap();

    let items = 6 * 100;
    let out = MaxCountOutput::new();
    let mut pipeline = Pipeline::new("nightly");
    prefix_count_program(
        &mut pipeline,
        TestingInput::new(numbers(items)).with_pace(Duration::from_millis(5)),
        &out,
    );
    let handle = cluster.submit(&pipeline).unwrap();
    let reached = handle
        .oracle()
        .wait_for_checkpoint(CheckpointId(1), Duration::from_secs(30));
    assert!(reached.is_some());
    handle.inject_failure(TaskId::new(0, 0)).unwrap();

    let completion = handle.wait_for_completion(Duration::from_secs(60));
    assert!(completion.is_finished(), "{completion:?}");
    let state = completion.state();
    assert_eq!(state.recoveries.len(), 1);
    let restored_from = state.recoveries[0].restored_from;
    assert!(
        restored_from.is_some_and(|id| id < CheckpointId(999)),
        "{restored_from:?}"
    );
    assert_eq!(out.counts(), expected_counts(items));

    // The run's own checkpoint is the one retained for it.
    let store = SqliteStore::open(&db_file, handle.job_id().clone()).unwrap();
    let last = state.last_completed_checkpoint.unwrap();
    assert_eq!(store.checkpoint_ids().unwrap(), vec![last]);
    // Other runs' rows are left alone.
    let other = SqliteStore::open(&db_file, JobId("nightly-0".to_string())).unwrap();
    assert_eq!(other.checkpoint_ids().unwrap(), vec![CheckpointId(999)]);
}

#[test]
fn concurrent_jobs_are_independent() {
    let cluster = Cluster::new(standard_config()).unwrap();
    let items = 6 * 400;

    let outs = [MaxCountOutput::new(), MaxCountOutput::new()];
    let handles: Vec<JobHandle> = outs
        .iter()
        .map(|out| {
            let mut pipeline = Pipeline::new("concurrent");
            prefix_count_program(
                &mut pipeline,
                TestingInput::new(numbers(items)).with_pace(Duration::from_millis(5)),
                out,
            );
            cluster.submit(&pipeline).unwrap()
        })
        .collect();
    assert_ne!(handles[0].job_id(), handles[1].job_id());

    let reached = handles[0]
        .oracle()
        .wait_for_checkpoint(CheckpointId(2), Duration::from_secs(30));
    assert!(reached.is_some());
    handles[0].inject_failure(TaskId::new(1, 2)).unwrap();

    for (handle, out) in handles.iter().zip(&outs) {
        let completion = handle.wait_for_completion(Duration::from_secs(60));
        assert!(completion.is_finished(), "{completion:?}");
        assert_eq!(out.counts(), expected_counts(items));
    }
    assert_eq!(
        handles[0]
            .wait_for_completion(Duration::ZERO)
            .state()
            .recoveries
            .len(),
        1
    );
    assert!(handles[1]
        .wait_for_completion(Duration::ZERO)
        .state()
        .recoveries
        .is_empty());
}
