//! Structured logging setup
//!
//! Installs a JSON `tracing` subscriber. The filter is taken, in order of
//! precedence, from the `--log-level` flag, the `RUST_LOG` environment
//! variable, or [`DEFAULT_FILTER`].

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when neither a flag nor `RUST_LOG` is set
pub const DEFAULT_FILTER: &str = "info,planegate=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed
    #[error("invalid log filter '{filter}': {message}")]
    InvalidFilter {
        /// The rejected directive string
        filter: String,
        /// Parser message
        message: String,
    },

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Service name attached to every event (e.g., "planegate-agent")
    pub service_name: String,

    /// Filter directive from the command line, e.g. "debug" or "info,planegate=trace"
    pub log_level: Option<String>,
}

/// Pick the filter directive to use.
///
/// An explicit level wins over `RUST_LOG`; blank values are ignored.
pub fn resolve_filter(log_level: Option<&str>, rust_log: Option<&str>) -> String {
    [log_level, rust_log]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(DEFAULT_FILTER)
        .to_string()
}

/// Initialize the global subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = resolve_filter(config.log_level.as_deref(), rust_log.as_deref());

    let env_filter =
        EnvFilter::try_new(&directive).map_err(|e| TelemetryError::InvalidFilter {
            filter: directive.clone(),
            message: e.to_string(),
        })?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    tracing::info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        filter = %directive,
        "telemetry initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_filter_prefers_flag() {
        assert_eq!(resolve_filter(Some("debug"), Some("warn")), "debug");
    }

    #[test]
    fn test_resolve_filter_falls_back_to_env() {
        assert_eq!(resolve_filter(None, Some("warn")), "warn");
        assert_eq!(resolve_filter(Some("  "), Some("warn")), "warn");
    }

    #[test]
    fn test_resolve_filter_default() {
        assert_eq!(resolve_filter(None, None), DEFAULT_FILTER);
        assert_eq!(resolve_filter(Some(""), Some("")), DEFAULT_FILTER);
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn test_invalid_filter_is_reported() {
        let err = init_telemetry(TelemetryConfig {
            service_name: "test".to_string(),
            log_level: Some("planegate=notalevel".to_string()),
        })
        .unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidFilter { .. }));
    }
}
