//! Logging setup for host processes (requires the `subscriber` feature).

use std::{fs::File, path::PathBuf, sync::Mutex};

use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

/// Logging setup error.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    Filter(String),
    #[error("Failed to open log file {path}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to init logging: {0}")]
    Init(String),
}

/// Install the global subscriber.
///
/// Logs go to stderr, or to `log_file` (truncated, ANSI off) when one is set.
/// Call once from the host's `main`; library code never installs a subscriber.
///
/// # Errors
/// Returns error if the filter is invalid, the file cannot be created, or a
/// subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let filter =
        EnvFilter::try_new(&config.filter).map_err(|e| LoggingError::Filter(e.to_string()))?;

    match &config.log_file {
        None => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string())),
        Some(path) => {
            let file = File::create(path).map_err(|source| LoggingError::File {
                path: path.clone(),
                source,
            })?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()
                .map_err(|e| LoggingError::Init(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LogConfig {
            filter: "kernel_relay=verbose".into(),
            log_file: None,
        };
        assert!(matches!(init_logging(&config), Err(LoggingError::Filter(_))));
    }

    #[test]
    fn test_unwritable_log_file_rejected() {
        let config = LogConfig {
            filter: "info".into(),
            log_file: Some(PathBuf::from("/nonexistent-dir/relay.log")),
        };
        assert!(matches!(init_logging(&config), Err(LoggingError::File { .. })));
    }
}
