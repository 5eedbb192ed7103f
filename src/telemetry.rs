//! Span export over OTLP.
//!
//! Built with the `otlp` feature, spans are exported when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set. Without the feature only endpoint
//! lookup is compiled.

/// Collector endpoint variable, as read by OpenTelemetry SDKs.
pub const ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Service name attached to exported spans.
pub const SERVICE_NAME: &str = "tiny-backspace";

/// The configured collector endpoint. Blank values count as unset.
pub fn endpoint_from_env() -> Option<String> {
    endpoint(std::env::var(ENDPOINT_ENV).ok())
}

fn endpoint(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(feature = "otlp")]
pub use exporter::{layer, Telemetry};

#[cfg(feature = "otlp")]
mod exporter {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::{SpanExporter, WithExportConfig};
    use opentelemetry_sdk::trace::{Tracer, TracerProvider};
    use opentelemetry_sdk::{runtime, Resource};
    use tracing::Subscriber;
    use tracing_opentelemetry::OpenTelemetryLayer;
    use tracing_subscriber::registry::LookupSpan;

    use super::SERVICE_NAME;
    use crate::error::{Error, Result};

    /// Flushes and stops the exporter when dropped.
    pub struct Telemetry {
        provider: TracerProvider,
    }

    impl Drop for Telemetry {
        fn drop(&mut self) {
            if let Err(e) = self.provider.shutdown() {
                eprintln!("failed to flush spans: {}", e);
            }
        }
    }

    /// A tracing layer exporting spans to `endpoint` over gRPC.
    ///
    /// Must be called inside the Tokio runtime; batches are sent from a
    /// background task.
    pub fn layer<S>(endpoint: &str) -> Result<(OpenTelemetryLayer<S, Tracer>, Telemetry)>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        let exporter = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| Error::Config(format!("OTLP exporter: {}", e)))?;

        let provider = TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_resource(Resource::new(vec![
                KeyValue::new("service.name", SERVICE_NAME),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]))
            .build();
        let tracer = provider.tracer(SERVICE_NAME);
        opentelemetry::global::set_tracer_provider(provider.clone());

        Ok((
            tracing_opentelemetry::layer().with_tracer(tracer),
            Telemetry { provider },
        ))
    }
}
