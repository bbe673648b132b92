//! Metrics for checkpointing and recovery.
//!
//! Instruments are registered on the global meter provider and
//! exported through the default Prometheus registry, which the status
//! webserver serves on `/metrics`.

use std::sync::Once;

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::sdk::metrics::Aggregation;
use opentelemetry::sdk::metrics::Instrument;
use opentelemetry::sdk::metrics::MeterProvider;
use opentelemetry::sdk::metrics::Stream;
use opentelemetry::KeyValue;
use prometheus::default_registry;

use crate::errors::tracked_err;
use crate::errors::HarnessError;
use crate::errors::HarnessResult;
use crate::recovery::model::JobId;
use crate::recovery::model::StepId;
use crate::recovery::model::TaskId;

#[macro_export]
/// Evaluate `$body`, recording how long it took in seconds.
macro_rules! with_timer {
    ($histogram:expr, $labels:expr, $body:expr) => {{
        let started = std::time::Instant::now();
        let out = $body;
        $histogram.record(started.elapsed().as_secs_f64(), &$labels);
        out
    }};
}

static INIT: Once = Once::new();

/// Bucket boundaries, in seconds, for every `*duration*` histogram.
/// Steps take microseconds; checkpoints take up to seconds.
const DURATION_BUCKETS: [f64; 14] = [
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Install a global meter provider exporting into the default
/// Prometheus registry, which `/metrics` serves.
///
/// Every job in the process shares it; only the first call does
/// anything.
pub(crate) fn initialize_metrics() -> HarnessResult<()> {
    let mut res = Ok(());
    INIT.call_once(|| res = install_provider());
    res
}

fn install_provider() -> HarnessResult<()> {
    let to_err = |err: &dyn std::fmt::Display| {
        tracked_err(
            HarnessError::Runtime,
            &format!("error setting up metrics: {err}"),
        )
    };
    let prometheus = opentelemetry_prometheus::exporter()
        .with_registry(default_registry().clone())
        .with_namespace("faultline")
        .build()
        .map_err(|err| to_err(&err))?;
    let durations = opentelemetry_sdk::metrics::new_view(
        Instrument::new().name("*duration*"),
        Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
            boundaries: DURATION_BUCKETS.to_vec(),
            record_min_max: true,
        }),
    )
    .map_err(|err| to_err(&err))?;

    global::set_meter_provider(
        MeterProvider::builder()
            .with_reader(prometheus)
            .with_view(durations)
            .build(),
    );
    Ok(())
}

/// Instruments the checkpoint coordinator records into.
pub(crate) struct CheckpointMetrics {
    pub(crate) triggered: Counter<u64>,
    pub(crate) completed: Counter<u64>,
    pub(crate) expired: Counter<u64>,
    pub(crate) declined: Counter<u64>,
    /// Seconds from trigger to completion.
    pub(crate) duration: Histogram<f64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl CheckpointMetrics {
    pub(crate) fn new(job_id: &JobId) -> Self {
        let meter = global::meter("checkpoint");
        Self {
            triggered: meter
                .u64_counter("checkpoint_triggered")
                .with_description("number of checkpoints triggered")
                .init(),
            completed: meter
                .u64_counter("checkpoint_completed")
                .with_description("number of checkpoints acknowledged by every task")
                .init(),
            expired: meter
                .u64_counter("checkpoint_expired")
                .with_description("number of checkpoints abandoned before completing")
                .init(),
            declined: meter
                .u64_counter("checkpoint_declined")
                .with_description("number of checkpoints a task declined to take part in")
                .init(),
            duration: meter
                .f64_histogram("checkpoint.duration")
                .with_description("seconds between triggering and completing a checkpoint")
                .init(),
            labels: vec![KeyValue::new("job_id", job_id.to_string())],
        }
    }
}

/// Instruments the job master records into.
pub(crate) struct JobMetrics {
    pub(crate) recoveries: Counter<u64>,
    pub(crate) stale_messages: Counter<u64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl JobMetrics {
    pub(crate) fn new(job_id: &JobId) -> Self {
        let meter = global::meter("job");
        Self {
            recoveries: meter
                .u64_counter("recoveries")
                .with_description("number of times the job was redeployed after a failure")
                .init(),
            stale_messages: meter
                .u64_counter("stale_messages")
                .with_description("messages dropped because they belong to an older attempt")
                .init(),
            labels: vec![KeyValue::new("job_id", job_id.to_string())],
        }
    }
}

/// Time spent in each step of a task.
pub(crate) struct StepMetrics {
    pub(crate) duration: Histogram<f64>,
}

impl StepMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("task");
        Self {
            duration: meter
                .f64_histogram("step.duration")
                .with_description("seconds spent processing one item in a step")
                .init(),
        }
    }

    pub(crate) fn labels(step_id: &StepId, task: &TaskId) -> Vec<KeyValue> {
        vec![
            KeyValue::new("step_id", step_id.to_string()),
            KeyValue::new("task_id", task.to_string()),
        ]
    }
}
