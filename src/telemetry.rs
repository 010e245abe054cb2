//! Tracing setup: console logging plus optional OTLP span export.
//!
//! Spans are exported through OpenTelemetry's [`BatchSpanProcessor`]. The
//! processor runs its exports on background threads outside the tokio
//! runtime, which is why the HTTP client handed to the exporter must be a
//! blocking one; an async client would panic there with "no reactor
//! running". The blocking client is built on a throwaway thread so its
//! construction cannot block the runtime either.
//!
//! When no OTLP endpoint is configured (or the exporter cannot be built),
//! the process falls back to console-only logging via [`setup_tracing`].

use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{ExporterBuildError, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::Registry;

use crate::config::TelemetryConfig;

/// Instrumentation library name attached to exported spans, as opposed to
/// the service name, which identifies the deployment.
const TRACER_NAME: &str = "dkpbot-tracer";

const DEFAULT_FILTER: &str = "dkp_bot=info,dkpbot=info";

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

/// Installs the layered subscriber: console logging plus OTLP span export
/// to the configured collector endpoint.
pub fn setup(cfg: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let http_client = std::thread::spawn(|| {
        reqwest::blocking::Client::builder()
            .gzip(true)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {e}"))
    })
    .join()
    .map_err(|_| TelemetryError::ThreadSpawn)?
    .map_err(TelemetryError::HttpClient)?;

    let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_http_client(http_client)
        .with_endpoint(endpoint_url(cfg))
        .build()?;

    let batch_processor = BatchSpanProcessor::builder(otlp_exporter)
        .with_batch_config(
            BatchConfigBuilder::default()
                .with_max_export_batch_size(512)
                .with_max_queue_size(2048)
                .with_scheduled_delay(Duration::from_secs(3))
                .build(),
        )
        .build();

    let tracer_provider = SdkTracerProvider::builder()
        .with_span_processor(batch_processor)
        .with_resource(
            Resource::builder()
                .with_service_name(cfg.service_name.clone())
                .with_attributes(vec![KeyValue::new(
                    "service.version",
                    cfg.service_version.clone(),
                )])
                .build(),
        )
        .build();

    let tracer = tracer_provider.tracer(TRACER_NAME);
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    let fmt_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());
    let telemetry_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());

    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(fmt_filter);
    let telemetry_layer = telemetry_layer.with_filter(telemetry_filter);

    let subscriber = Registry::default().with(fmt_layer).with(telemetry_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(TelemetryGuard { tracer_provider })
}

/// Console-only logging, used when span export is disabled or failed to
/// initialize.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .init();
}

fn endpoint_url(cfg: &TelemetryConfig) -> String {
    if cfg.otlp_endpoint.contains("://") {
        return cfg.otlp_endpoint.clone();
    }
    if cfg.insecure {
        format!("http://{}", cfg.otlp_endpoint)
    } else {
        format!("https://{}", cfg.otlp_endpoint)
    }
}

pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Flush pending spans before shutdown; force_flush blocks until
        // pending exports complete or time out.
        if let Err(e) = self.tracer_provider.force_flush() {
            eprintln!("Failed to flush telemetry spans: {e:?}");
        }

        // Shut down the provider so the batch processor's background
        // thread terminates cleanly.
        if let Err(e) = self.tracer_provider.shutdown() {
            eprintln!("Failed to shutdown telemetry provider: {e:?}");
        }
    }
}
