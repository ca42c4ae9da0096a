//! Tracer and propagator handle.
//!
//! The provider and the W3C TraceContext + Baggage propagator are owned by a
//! `Telemetry` value that is passed explicitly to every component that starts
//! spans. Nothing is registered as process-global OpenTelemetry state; the
//! only global is the `tracing` subscriber installed by [`init_tracing`].

use std::borrow::Cow;

use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::trace::{Status, TraceContextExt, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{Config as TraceConfig, Tracer, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bus::HeaderCarrier;
use crate::config::{AppConfig, LOG_ENV_VAR};

/// Result type for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Errors raised while installing or tearing down telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed to build span exporter: {0}")]
    Exporter(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(String),

    #[error("Failed to shut down tracer provider: {0}")]
    Shutdown(String),
}

/// Telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Bridge `tracing` spans into OpenTelemetry.
    pub enabled: bool,
    /// OTLP gRPC collector endpoint. No exporter is installed when absent.
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            otlp_endpoint: None,
        }
    }
}

/// Tracer provider plus propagator.
pub struct Telemetry {
    provider: TracerProvider,
    propagator: TextMapCompositePropagator,
    exporter_endpoint: Option<String>,
}

impl Telemetry {
    /// Build the tracer provider, exporting over OTLP when an endpoint is set.
    ///
    /// Must run inside a Tokio runtime when an exporter is configured.
    pub fn new(config: &TelemetryConfig, app: &AppConfig) -> Result<Self> {
        let mut builder = TracerProvider::builder()
            .with_config(TraceConfig::default().with_resource(resource(app)));
        let mut exporter_endpoint = None;

        if let Some(endpoint) = config.otlp_endpoint.as_deref().filter(|_| config.enabled) {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()
                .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
            builder = builder.with_batch_exporter(exporter, runtime::Tokio);
            exporter_endpoint = Some(endpoint.to_string());
        }

        Ok(Self {
            provider: builder.build(),
            propagator: propagator(),
            exporter_endpoint,
        })
    }

    /// Provider without an exporter. Spans are created and propagated but
    /// never leave the process.
    pub fn local(service_name: &str) -> Self {
        let app = AppConfig {
            name: service_name.to_string(),
            ..Default::default()
        };
        let provider = TracerProvider::builder()
            .with_config(TraceConfig::default().with_resource(resource(&app)))
            .build();

        Self {
            provider,
            propagator: propagator(),
            exporter_endpoint: None,
        }
    }

    /// OTLP endpoint spans are exported to, if an exporter is installed.
    pub fn exporter_endpoint(&self) -> Option<&str> {
        self.exporter_endpoint.as_deref()
    }

    pub fn provider(&self) -> &TracerProvider {
        &self.provider
    }

    pub fn tracer(&self, name: impl Into<Cow<'static, str>>) -> Tracer {
        self.provider.tracer(name)
    }

    /// Write the trace context of `cx` into `carrier`.
    pub fn inject(&self, cx: &Context, carrier: &mut HeaderCarrier) {
        self.propagator.inject_context(cx, carrier);
    }

    /// Rebuild a parent context from `carrier`. Missing or malformed headers
    /// yield an empty context, so the next span starts a new trace.
    pub fn extract(&self, carrier: &HeaderCarrier) -> Context {
        self.propagator.extract(carrier)
    }

    /// Mark the active span of `cx` as failed and record `err` on it.
    pub fn log_error(&self, cx: &Context, err: &dyn std::error::Error) {
        let span = cx.span();
        span.set_attribute(KeyValue::new("error", true));
        span.record_error(err);
        span.set_status(Status::error(err.to_string()));
    }

    /// Flush and stop the provider.
    pub fn shutdown(&self) -> Result<()> {
        self.provider
            .shutdown()
            .map_err(|e| TelemetryError::Shutdown(e.to_string()))
    }
}

fn resource(app: &AppConfig) -> Resource {
    Resource::new(vec![
        KeyValue::new("service.name", app.name.clone()),
        KeyValue::new("environment", app.environment.clone()),
        KeyValue::new("ID", app.id),
    ])
}

fn propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// Install the `tracing` subscriber.
///
/// Filter comes from `COURIER_LOG` (default "info"). When `telemetry` is
/// given, `tracing` spans are also exported as OpenTelemetry spans.
pub fn init_tracing(telemetry: Option<&Telemetry>) -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry.map(|t| tracing_opentelemetry::layer().with_tracer(t.tracer("http"))))
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}
