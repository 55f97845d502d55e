// src/observability/mod.rs
//! Logging and metrics setup

use crate::utils::config::{LoggingConfig, MetricsConfig};
use crate::utils::errors::{Result, WorkerError};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| WorkerError::ConfigError(format!("invalid log level '{}': {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| WorkerError::ConfigError(format!("failed to install tracing: {}", e)))
}

/// Install the Prometheus exporter when an address is configured.
///
/// Must be called from within the tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    let Some(addr) = config.listen else {
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::ConfigError(format!("failed to start metrics exporter on {}: {}", addr, e)))?;

    info!("Prometheus metrics on http://{}/metrics", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_by_default() {
        assert!(init_metrics(&MetricsConfig::default()).is_ok());
    }
}
