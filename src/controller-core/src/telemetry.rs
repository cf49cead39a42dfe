#![allow(unused_imports)] // some used only for telemetry feature
use crate::{Error, Result};

use opentelemetry::trace::TraceId;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

///  Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _; // opentelemetry::Context -> opentelemetry::trace::Span
    use tracing_opentelemetry::OpenTelemetrySpanExt as _; // tracing::Span to opentelemetry::Context

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

#[cfg(feature = "telemetry")]
async fn init_tracer() -> Result<opentelemetry::sdk::trace::Tracer> {
    let otlp_endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL")
        .map_err(|_| Error::TelemetryError("OPENTELEMETRY_ENDPOINT_URL is not set".into()))?;

    let channel = tonic::transport::Channel::from_shared(otlp_endpoint)
        .map_err(|e| Error::TelemetryError(e.to_string()))?
        .connect()
        .await
        .map_err(|e| Error::TelemetryError(e.to_string()))?;

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_channel(channel))
        .with_trace_config(opentelemetry::sdk::trace::config().with_resource(
            opentelemetry::sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                "service.name",
                "rescheduler",
            )]),
        ))
        .install_batch(opentelemetry::runtime::Tokio)
        .map_err(|e| Error::TelemetryError(e.to_string()))
}

/// Initialize tracing
///
/// `RUST_LOG` drives the filter (default `info`), `LOG_FORMAT=json` switches to json lines.
pub async fn init() -> Result<()> {
    let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);
    let (compact, json) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer().compact()), None)
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| Error::TelemetryError(e.to_string()))?;

    let collector = Registry::default().with(env_filter).with(compact).with(json);

    #[cfg(feature = "telemetry")]
    let collector = collector.with(tracing_opentelemetry::layer().with_tracer(init_tracer().await?));

    tracing::subscriber::set_global_default(collector).map_err(|e| Error::TelemetryError(e.to_string()))
}
