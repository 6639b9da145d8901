//! Tracing Subscriber Initialization

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::TelemetryError;

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line.
    pub service_name: String,
    pub log_format: LogFormat,
    /// Record per-request Prometheus metrics.
    pub metrics_enabled: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "ecorpc".to_string(),
            log_format: LogFormat::Json,
            metrics_enabled: true,
            default_filter: "ecorpc_api=info,ecorpc_storage=info,warn".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Environment variables:
    /// - `ECORPC_SERVICE_NAME` (default: ecorpc)
    /// - `ECORPC_LOG_FORMAT`: "json" or "pretty" (default: json)
    /// - `ECORPC_METRICS_ENABLED`: "true"/"1" or "false"/"0" (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("ECORPC_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_format: std::env::var("ECORPC_LOG_FORMAT")
                .map(|s| {
                    if s.eq_ignore_ascii_case("pretty") {
                        LogFormat::Pretty
                    } else {
                        LogFormat::Json
                    }
                })
                .unwrap_or(defaults.log_format),
            metrics_enabled: std::env::var("ECORPC_METRICS_ENABLED")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.metrics_enabled),
            default_filter: defaults.default_filter,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. `RUST_LOG` overrides the configured default filter.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).try_init(),
    };
    result.map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    tracing::info!(
        service_name = %config.service_name,
        log_format = ?config.log_format,
        metrics_enabled = config.metrics_enabled,
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.metrics_enabled);
    }

    #[test]
    fn test_second_init_fails() {
        let config = TelemetryConfig::default();
        let _ = init_tracing(&config);
        assert!(matches!(init_tracing(&config), Err(TelemetryError::Subscriber(_))));
    }
}
