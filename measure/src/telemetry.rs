use crate::config::{LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use sentry::types::{Dsn, ParseDsnError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const METRICS_PREFIX: &str = "measure";

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("invalid sentry dsn: {0}")]
    InvalidDsn(#[from] ParseDsnError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
}

/// Installs the global tracing subscriber. Filtering follows `RUST_LOG` and
/// defaults to `info`. When a Sentry DSN is configured, events are also
/// forwarded to Sentry for as long as the returned guard is alive.
///
/// A malformed DSN is reported before anything is installed.
pub fn init_logging(
    config: Option<&LoggingConfig>,
) -> Result<Option<sentry::ClientInitGuard>, TelemetryError> {
    let sentry_guard = sentry_options(config)?.map(sentry::init);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let sentry_layer = sentry_guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    Ok(sentry_guard)
}

fn sentry_options(
    config: Option<&LoggingConfig>,
) -> Result<Option<sentry::ClientOptions>, TelemetryError> {
    let Some(dsn) = config.and_then(|logging| logging.sentry_dsn.as_deref()) else {
        return Ok(None);
    };

    Ok(Some(sentry::ClientOptions {
        dsn: Some(dsn.parse::<Dsn>()?),
        release: sentry::release_name!(),
        ..Default::default()
    }))
}

/// Exports metrics to StatsD. Without this, metrics go to the no-op recorder.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), TelemetryError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(METRICS_PREFIX))
        .map_err(|e| TelemetryError::Metrics(e.to_string()))?;

    metrics::set_global_recorder(recorder).map_err(|e| TelemetryError::Metrics(e.to_string()))?;
    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Exporting metrics to statsd"
    );

    Ok(())
}
