//! Tracing subscriber setup shared by the mise binaries.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, best-effort side effect failed, record evicted |
//! | INFO  | Lifecycle events (startup, shutdown), note completions |
//! | DEBUG | Partial progress, pipeline selection, per-action timing |
//! | TRACE | Per-line iteration |
//!
//! Library code only emits through the `tracing` macros. Without an installed
//! subscriber those events are discarded, so nothing here is required for the
//! job system to run.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "mise_jobs=debug,mise_worker=debug,mise_core=info";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Optional log file; rotated daily.
    pub file: Option<String>,
    /// Override ANSI colors (auto-detected for stdout, off for files).
    pub ansi: Option<bool>,
}

impl LoggingConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LOG_FORMAT` | `text` | `json` or `text` |
    /// | `LOG_FILE` | unset | Path to a log file (enables file logging) |
    /// | `LOG_ANSI` | auto | `true`/`false` color override |
    pub fn from_env() -> Self {
        let format = match std::env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        let file = std::env::var("LOG_FILE").ok().filter(|v| !v.is_empty());
        let ansi = std::env::var("LOG_ANSI")
            .ok()
            .map(|v| v == "true" || v == "1");

        Self { format, file, ansi }
    }
}

/// Install the global tracing subscriber.
///
/// Returns the appender guard when logging to a file; keep it alive for the
/// lifetime of the process or buffered lines are lost.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(ref path) = config.file {
        let path = Path::new(path);
        let file_dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("mise-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let result = match config.format {
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .try_init(),
            LogFormat::Text => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(config.ansi.unwrap_or(false)),
                )
                .try_init(),
        };
        result.map_err(|e| Error::Config(format!("failed to install subscriber: {e}")))?;
        Ok(Some(guard))
    } else {
        let result = match config.format {
            LogFormat::Json => registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init(),
            LogFormat::Text => {
                let mut layer = tracing_subscriber::fmt::layer();
                if let Some(ansi) = config.ansi {
                    layer = layer.with_ansi(ansi);
                }
                registry.with(layer).try_init()
            }
        };
        result.map_err(|e| Error::Config(format!("failed to install subscriber: {e}")))?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.format, LogFormat::Text);
        assert!(config.file.is_none());
        assert!(config.ansi.is_none());
    }

    #[test]
    fn test_second_init_reports_config_error() {
        let config = LoggingConfig::default();
        // Whichever call loses the race to install the global subscriber must
        // surface an error instead of panicking.
        let first = init_tracing(&config);
        let second = init_tracing(&config);
        assert!(first.is_err() || second.is_err());
        if let Err(e) = second {
            assert!(matches!(e, Error::Config(_)));
        }
    }
}
