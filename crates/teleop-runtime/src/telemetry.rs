//! Tracing setup for `teleopd`.
//!
//! [`init_tracing`] installs one global subscriber made of three layers:
//!
//! - an [`EnvFilter`] from `RUST_LOG` (default `info`);
//! - a console formatter, compact or newline-delimited JSON
//!   (`TELEOP_LOG_FORMAT=json`);
//! - an OTLP/HTTP span exporter, only when `OTEL_EXPORTER_OTLP_ENDPOINT`
//!   names a collector.
//!
//! ```rust,no_run
//! let _guard = teleop_runtime::telemetry::init_tracing("teleopd");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

const LOG_FORMAT_VAR: &str = "TELEOP_LOG_FORMAT";
const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Console output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    /// `json` (any case) selects JSON; anything else is compact.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }

    fn from_env() -> Self {
        Self::parse(std::env::var(LOG_FORMAT_VAR).ok().as_deref())
    }

    fn layer(self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let fmt = tracing_subscriber::fmt::layer().with_target(true);
        match self {
            LogFormat::Compact => fmt.compact().boxed(),
            LogFormat::Json => fmt.json().boxed(),
        }
    }
}

/// Install the global subscriber.
///
/// Hold the returned guard until exit; dropping it flushes spans still
/// waiting for the collector.  A second call leaves the first subscriber in
/// place.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let format = LogFormat::from_env();
    let provider = std::env::var(OTLP_ENDPOINT_VAR)
        .ok()
        .and_then(|endpoint| span_exporter(service_name, endpoint));
    let otel = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(service_name.to_string())));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(format.layer())
        .with(filter)
        .with(otel)
        .try_init();
    if let Err(e) = installed {
        eprintln!("[teleopd] tracing already initialised: {e}");
    }

    TracerProviderGuard { provider }
}

/// Flushes and shuts down the span exporter when dropped.
pub struct TracerProviderGuard {
    provider: Option<SdkTracerProvider>,
}

impl TracerProviderGuard {
    /// Whether spans leave the process.
    pub fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        if let Err(e) = provider.shutdown() {
            eprintln!("[teleopd] span exporter shutdown failed: {e}");
        }
    }
}

/// OTLP/HTTP provider for `endpoint`; `None` if the exporter cannot be
/// built, in which case logs stay console-only.
fn span_exporter(service_name: &str, endpoint: String) -> Option<SdkTracerProvider> {
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("[teleopd] OTLP exporter unavailable: {e}");
            return None;
        }
    };
    // Simple exporter: every component runs on plain threads, there is no
    // async runtime for a batch exporter to spawn on.
    Some(
        SdkTracerProvider::builder()
            .with_resource(
                Resource::builder()
                    .with_service_name(service_name.to_string())
                    .build(),
            )
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_defaults_to_compact() {
        assert_eq!(LogFormat::parse(None), LogFormat::Compact);
        assert_eq!(LogFormat::parse(Some("pretty")), LogFormat::Compact);
        assert_eq!(LogFormat::parse(Some(" JSON ")), LogFormat::Json);
    }

    #[test]
    fn guard_without_exporter_drops_quietly() {
        let guard = TracerProviderGuard { provider: None };
        assert!(!guard.is_exporting());
        drop(guard);
    }
}
