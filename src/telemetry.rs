//! Optional OpenTelemetry trace export.
//!
//! When an OTLP endpoint is configured, spans are batched and shipped in the
//! background; otherwise the pipeline runs with console-only logging.
//!
//! ## Blocking HTTP client requirement
//!
//! The [`BatchSpanProcessor`] runs its export loop on threads it spawns
//! itself, outside the tokio runtime. Those threads have no reactor, so the
//! exporter must use a blocking HTTP client; an async client fails there at
//! runtime with "no reactor running". The blocking client is constructed on
//! a dedicated thread so its connection-pool setup never stalls the async
//! runtime during startup.

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::ExporterBuildError;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider};
use reqwest::Url;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::Registry;
use tracing_subscriber::layer::{Layer, SubscriberExt};

/// Instrumentation library name attached to exported spans, distinct from
/// the configurable service name.
const TRACER_NAME: &str = "ledgerbus-tracer";

#[derive(Debug, Clone)]
pub struct OtlpConfig {
    pub(crate) endpoint: Url,
    pub(crate) api_key: Option<String>,
    pub(crate) service_name: String,
    pub(crate) log_level: tracing::Level,
}

impl OtlpConfig {
    pub fn setup_telemetry(&self) -> Result<TelemetryGuard, TelemetryError> {
        let mut headers = HashMap::new();
        if let Some(api_key) = &self.api_key {
            headers.insert("authorization".to_string(), api_key.clone());
        }

        let http_client = std::thread::spawn(|| {
            reqwest::blocking::Client::builder()
                .gzip(true)
                .build()
                .map_err(|e| format!("failed to build HTTP client: {e}"))
        })
        .join()
        .map_err(|_| TelemetryError::ThreadSpawn)?
        .map_err(TelemetryError::HttpClient)?;

        let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_http_client(http_client)
            .with_endpoint(self.endpoint.as_str())
            .with_headers(headers)
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()?;

        let batch_exporter = BatchSpanProcessor::builder(otlp_exporter)
            .with_batch_config(
                BatchConfigBuilder::default()
                    .with_max_export_batch_size(256)
                    .with_max_queue_size(2048)
                    .with_scheduled_delay(Duration::from_secs(5))
                    .build(),
            )
            .build();

        let tracer_provider = SdkTracerProvider::builder()
            .with_span_processor(batch_exporter)
            .with_resource(
                Resource::builder()
                    .with_service_name(self.service_name.clone())
                    .with_attributes(vec![KeyValue::new("component", "event-pipeline")])
                    .build(),
            )
            .build();

        let tracer = tracer_provider.tracer(TRACER_NAME);
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        let default_filter = format!("ledgerbus={}", self.log_level);

        let fmt_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| default_filter.clone().into());
        let telemetry_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| default_filter.into());

        let fmt_layer = tracing_subscriber::fmt::layer().with_filter(fmt_filter);
        let telemetry_layer = telemetry_layer.with_filter(telemetry_filter);

        let subscriber = Registry::default().with(fmt_layer).with(telemetry_layer);
        tracing::subscriber::set_global_default(subscriber)?;

        Ok(TelemetryGuard { tracer_provider })
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to build OTLP exporter")]
    OtlpExporter(#[from] ExporterBuildError),

    #[error("Failed to build HTTP client")]
    HttpClient(String),

    #[error("Failed to spawn HTTP client thread")]
    ThreadSpawn,

    #[error("Failed to set global subscriber")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Flush pending spans before shutdown; blocks until exports finish
        // or the processor's internal timeout fires.
        if let Err(e) = self.tracer_provider.force_flush() {
            eprintln!("Failed to flush telemetry spans: {e:?}");
        }

        if let Err(e) = self.tracer_provider.shutdown() {
            eprintln!("Failed to shutdown telemetry provider: {e:?}");
        }
    }
}
