use std::io::{self, IsTerminal};
use std::sync::OnceLock;
use std::time::Duration;

use indicatif::ProgressStyle;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{KeyValue, global};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::{Level, Metadata};
use tracing_indicatif::{IndicatifLayer, TickSettings};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::filter::{self, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::error::TelemetryError;

const CRATE_TARGET: &str = "te";

static TRACING_INITIALISED: OnceLock<Result<(), TelemetryError>> = OnceLock::new();

/// Installs the global subscriber: pretty logs and span progress bars on a
/// terminal, JSON lines otherwise, with spans exported to OpenTelemetry.
///
/// Only the first call takes effect; later calls return its outcome.
pub(crate) fn initialise_tracing(
    service_name: &str,
    interactive_terminal: bool,
    level: Option<LevelFilter>,
) -> Result<(), &'static TelemetryError> {
    TRACING_INITIALISED
        .get_or_init(|| install(service_name, interactive_terminal, level))
        .as_ref()
        .copied()
}

fn install(
    service_name: &str,
    interactive_terminal: bool,
    level: Option<LevelFilter>,
) -> Result<(), TelemetryError> {
    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_owned())
                .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
                .build(),
        )
        .build();
    let tracer = tracer_provider.tracer(service_name.to_owned());
    global::set_tracer_provider(tracer_provider);

    if interactive_terminal && io::stderr().is_terminal() {
        let indicatif_layer = IndicatifLayer::new()
            .with_progress_style(spinner_style())
            .with_tick_settings(TickSettings {
                default_tick_interval: Some(Duration::from_millis(90)),
                ..TickSettings::default()
            });
        let log_layer = fmt::layer()
            .pretty()
            .with_target(false)
            .with_writer(indicatif_layer.get_stderr_writer())
            .with_filter(log_filter(level));

        tracing_subscriber::registry()
            .with(log_layer)
            .with(indicatif_layer.with_filter(filter::filter_fn(shows_progress)))
            .with(OpenTelemetryLayer::new(tracer))
            .try_init()?;
    } else {
        let log_layer = fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(true)
            .with_filter(log_filter(level));

        tracing_subscriber::registry()
            .with(log_layer)
            .with(OpenTelemetryLayer::new(tracer))
            .try_init()?;
    }

    Ok(())
}

/// `--log-level` applies to this crate only and wins over `RUST_LOG`.
/// Warnings only when neither is set.
fn log_filter(level: Option<LevelFilter>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::new(format!("{CRATE_TARGET}={level}")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan.bold} {msg}")
        .unwrap_or_else(|_error| ProgressStyle::default_spinner())
}

/// Discovery, command and update spans from this crate get a progress line.
fn shows_progress(metadata: &Metadata<'_>) -> bool {
    metadata.is_span()
        && metadata
            .target()
            .strip_prefix(CRATE_TARGET)
            .is_some_and(|rest| rest.starts_with("::"))
        && *metadata.level() <= Level::INFO
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn explicit_level_scopes_filter_to_crate() {
        assert_eq!("te=debug", log_filter(Some(LevelFilter::DEBUG)).to_string());
    }
}
