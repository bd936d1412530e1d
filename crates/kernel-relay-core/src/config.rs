//! Process-wide relay configuration.
//!
//! Resolved once at startup and passed by reference into the container;
//! nothing in the message path reads the environment.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backlog;

/// Environment variable overriding the backlog's message capacity.
pub const ENV_BACKLOG: &str = "KERNEL_RELAY_BACKLOG";
/// Environment variable overriding the backlog's byte budget.
pub const ENV_BACKLOG_BYTES: &str = "KERNEL_RELAY_BACKLOG_BYTES";
/// Environment variable holding the log filter directive.
pub const ENV_LOG: &str = "KERNEL_RELAY_LOG";
/// Environment variable naming a log file; empty means stderr.
pub const ENV_LOG_FILE: &str = "KERNEL_RELAY_LOG_FILE";

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `kernel_relay_session=trace`.
    pub filter: String,
    /// Log file, truncated on startup. `None` logs to stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            log_file: None,
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Messages held per session until the first output sink registers.
    pub backlog_capacity: usize,
    /// Byte budget for the same backlog.
    pub backlog_bytes: usize,
    pub log: LogConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: backlog::DEFAULT_CAPACITY,
            backlog_bytes: backlog::DEFAULT_BYTES,
            log: LogConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `KERNEL_RELAY_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// Unparseable numbers are logged and ignored.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse_usize(&lookup, ENV_BACKLOG) {
            config.backlog_capacity = n;
        }
        if let Some(n) = parse_usize(&lookup, ENV_BACKLOG_BYTES) {
            config.backlog_bytes = n;
        }
        if let Some(filter) = lookup(ENV_LOG).filter(|f| !f.trim().is_empty()) {
            config.log.filter = filter.trim().to_string();
        }
        config.log.log_file = lookup(ENV_LOG_FILE)
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .map(PathBuf::from);

        config
    }
}

fn parse_usize<F>(lookup: &F, key: &str) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(%key, value = %raw, "Ignoring invalid setting: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        assert_eq!(RelayConfig::from_lookup(lookup(&[])), RelayConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            (ENV_BACKLOG, "16"),
            (ENV_BACKLOG_BYTES, " 4096 "),
            (ENV_LOG, "debug"),
            (ENV_LOG_FILE, " /tmp/relay.log\n"),
        ]));

        assert_eq!(config.backlog_capacity, 16);
        assert_eq!(config.backlog_bytes, 4096);
        assert_eq!(config.log.filter, "debug");
        assert_eq!(config.log.log_file, Some(PathBuf::from("/tmp/relay.log")));
    }

    #[test]
    fn test_invalid_and_blank_values_ignored() {
        let config = RelayConfig::from_lookup(lookup(&[
            (ENV_BACKLOG, "lots"),
            (ENV_LOG_FILE, "   "),
        ]));

        assert_eq!(config.backlog_capacity, backlog::DEFAULT_CAPACITY);
        assert_eq!(config.log.log_file, None);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: RelayConfig = serde_json::from_str(r#"{ "backlog_capacity": 8 }"#).unwrap();
        assert_eq!(config.backlog_capacity, 8);
        assert_eq!(config.log, LogConfig::default());
    }
}
