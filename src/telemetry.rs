//! Observability
//!
//! Installs the global `tracing` subscriber: env-filtered fmt output, plus an
//! OpenTelemetry OTLP span exporter when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use opentelemetry::trace::TracerProvider;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{propagation::TraceContextPropagator, runtime, trace as sdktrace, Resource};
use std::env;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const DEFAULT_FILTER: &str = "failure_injector=info,injector=info";

/// Flushes pending spans on drop
pub struct TelemetryGuard {
    otel: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.otel {
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init_telemetry(service_name: &str) -> anyhow::Result<TelemetryGuard> {
    let tracer = match env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(endpoint) if !endpoint.trim().is_empty() => Some(otlp_tracer(service_name)?),
        _ => None,
    };
    let otel = tracer.is_some();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    Registry::default()
        .with(filter)
        .with(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    Ok(TelemetryGuard { otel })
}

fn otlp_tracer(service_name: &str) -> anyhow::Result<sdktrace::Tracer> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    // Endpoint and headers come from the standard OTEL_* variables
    let exporter = opentelemetry_otlp::new_exporter().tonic().build_span_exporter()?;

    let trace_config = sdktrace::Config::default().with_resource(Resource::new(vec![KeyValue::new(
        "service.name",
        service_name.to_string(),
    )]));

    let provider = sdktrace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(trace_config)
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider.tracer(service_name.to_string()))
}
