//! Logging, and optionally exporting spans.
//!
//! Job masters and tasks log through `tracing`. Nothing is printed
//! until [`FaultlineTracer::setup`] installs a subscriber; after that,
//! errors are always logged to stdout and everything else depends on
//! the requested level or `FAULTLINE_LOG`. Spans are only exported
//! when a [`TracingConfig`] with an exporter is given.

use opentelemetry::sdk::trace::Tracer;
use serde::Deserialize;
use serde::Serialize;
use tokio::runtime::EnterGuard;
use tokio::runtime::Runtime;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::tracked_err;
use crate::errors::HarnessError;
use crate::errors::HarnessResult;
use crate::errors::Reraise;

pub(crate) mod otlp_tracing;

pub use otlp_tracing::OtlpTracingConfig;

/// Where spans go, besides the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TracingConfig {
    LogOnly,
    Otlp(OtlpTracingConfig),
}

/// A span exporter backend.
trait TracerBuilder {
    fn build(&self) -> HarnessResult<Tracer>;
}

/// Owns the runtime span exporters run on; drop it only once nothing
/// is traced anymore.
pub struct FaultlineTracer {
    rt: Runtime,
}

fn get_log_level(level: Option<&str>) -> HarnessResult<LevelFilter> {
    let Some(level) = level else {
        return Ok(LevelFilter::ERROR);
    };
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        _ => Err(tracked_err(
            HarnessError::Config,
            &format!("wrong log level: {level}"),
        )),
    }
}

/// `FAULTLINE_LOG` takes precedence over `log_level` so a test run can
/// be made chattier without changing code.
fn log_filter(log_level: LevelFilter) -> HarnessResult<EnvFilter> {
    match std::env::var("FAULTLINE_LOG") {
        Ok(directives) => EnvFilter::try_new(&directives)
            .map_err(|err| tracked_err(HarnessError::Config, &format!("bad FAULTLINE_LOG: {err}"))),
        Err(_) => EnvFilter::try_new(format!("faultline={log_level}"))
            .map_err(|err| tracked_err(HarnessError::Config, &err.to_string())),
    }
}

/// One line per event, tagged with the source location and the thread
/// it came from. Task threads are named after their process, stage and
/// instance, so this is how a log line is traced back to a task.
fn log_layer<S>(filter: EnvFilter) -> impl Layer<S>
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_filter(filter)
}

fn install_subscriber(filter: EnvFilter, tracer: Option<Tracer>) {
    let subscriber = Registry::default().with(log_layer(filter));
    match tracer {
        Some(tracer) => {
            let spans = tracing_opentelemetry::layer()
                .with_tracer(tracer)
                .with_filter(Targets::new().with_target("faultline", LevelFilter::TRACE));
            set_global_subscriber(subscriber.with(spans));
        }
        None => set_global_subscriber(subscriber),
    }
}

impl FaultlineTracer {
    pub fn new() -> HarnessResult<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .thread_name("faultline-tracing")
            .enable_all()
            .build()
            .reraise("error initializing tokio runtime for tracing")?;
        Ok(Self { rt })
    }

    /// Install the global subscriber.
    ///
    /// Spans are only exported while the returned guard is alive.
    pub fn setup(
        &self,
        config: TracingConfig,
        log_level: Option<&str>,
    ) -> HarnessResult<EnterGuard<'_>> {
        let guard = self.rt.enter();
        let filter = log_filter(get_log_level(log_level)?)?;
        let tracer = match &config {
            TracingConfig::LogOnly => None,
            TracingConfig::Otlp(otlp) => Some(otlp.build()?),
        };

        self.rt
            .block_on(self.rt.spawn(async move { install_subscriber(filter, tracer) }))
            .map_err(|err| {
                tracked_err(
                    HarnessError::Runtime,
                    &format!("error setting up tracing: {err}"),
                )
            })?;
        Ok(guard)
    }
}

/// Only the first subscriber in a process wins; later ones (several
/// tests in one binary) are reported and dropped.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("Not replacing the global subscriber: {err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(HarnessError::Config(_))
    ));
}

#[test]
fn log_only_setup_twice_is_fine() {
    let tracer = FaultlineTracer::new().unwrap();
    {
        let _guard = tracer.setup(TracingConfig::LogOnly, Some("warn")).unwrap();
    }
    let _guard = tracer.setup(TracingConfig::LogOnly, None).unwrap();
}
