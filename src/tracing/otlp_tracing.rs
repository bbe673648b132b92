use opentelemetry::runtime::Tokio;
use opentelemetry::sdk::trace;
use opentelemetry::sdk::trace::Sampler;
use opentelemetry::sdk::trace::Tracer;
use opentelemetry::sdk::Resource;
use opentelemetry::KeyValue;
use opentelemetry_otlp::TonicExporterBuilder;
use opentelemetry_otlp::WithExportConfig;
use serde::Deserialize;
use serde::Serialize;

use super::TracerBuilder;
use crate::errors::tracked_err;
use crate::errors::HarnessError;
use crate::errors::HarnessResult;

/// Export spans of every job run to an OpenTelemetry collector over
/// gRPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtlpTracingConfig {
    /// Reported as `service.name` on every span.
    pub service_name: String,
    /// Collector endpoint. The exporter's default is used if unset.
    pub url: Option<String>,
    /// Fraction of traces kept; 1.0 or more keeps all of them.
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl OtlpTracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            url: None,
            sampling_ratio: default_sampling_ratio(),
        }
    }

    fn exporter(&self) -> TonicExporterBuilder {
        let exporter = opentelemetry_otlp::new_exporter().tonic();
        match &self.url {
            Some(url) => exporter.with_endpoint(url.clone()),
            None => exporter,
        }
    }

    fn trace_config(&self) -> trace::Config {
        let resource = Resource::new([KeyValue::new("service.name", self.service_name.clone())]);
        trace::config()
            .with_sampler(Sampler::TraceIdRatioBased(self.sampling_ratio))
            .with_resource(resource)
    }
}

impl TracerBuilder for OtlpTracingConfig {
    fn build(&self) -> HarnessResult<Tracer> {
        // The batch span processor spawns onto the ambient tokio
        // runtime, so this has to run inside one.
        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(self.exporter())
            .with_trace_config(self.trace_config())
            .install_batch(Tokio)
            .map_err(|err| {
                tracked_err(
                    HarnessError::Config,
                    &format!(
                        "unable to export traces of {:?} over OTLP: {err}",
                        self.service_name
                    ),
                )
            })
    }
}

#[test]
fn sampling_ratio_defaults_to_all() {
    let config: OtlpTracingConfig =
        serde_json::from_str(r#"{"service_name": "harness", "url": null}"#).unwrap();
    assert_eq!(config, OtlpTracingConfig::new("harness"));
}
