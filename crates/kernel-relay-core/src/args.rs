//! Arguments a host passes when starting a session.

use serde::{Deserialize, Serialize};

/// Start arguments for a kernel session.
///
/// `argv` is handed to the connector untouched; the relay only interprets
/// the two flags that decide how a kernel is reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionArgs {
    /// Connector arguments, e.g. `["--existing", "kernel-1.json"]`.
    #[serde(default)]
    pub argv: Vec<String>,
}

impl SessionArgs {
    #[must_use]
    pub fn new<I>(argv: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether to attach to an already running kernel instead of launching one.
    #[must_use]
    pub fn attach_existing(&self) -> bool {
        self.argv
            .iter()
            .any(|a| a == "--existing" || a.starts_with("--existing="))
    }

    /// Connection file named by `-f=<path>`, `-f <path>` or `--existing <path>`.
    #[must_use]
    pub fn connection_file(&self) -> Option<&str> {
        let mut args = self.argv.iter();
        while let Some(arg) = args.next() {
            for prefix in ["-f=", "--existing="] {
                if let Some(path) = arg.strip_prefix(prefix) {
                    return Some(path);
                }
            }
            if arg == "-f" || arg == "--existing" {
                if let Some(path) = args.next().filter(|p| !p.starts_with('-')) {
                    return Some(path);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_file_forms() {
        assert_eq!(
            SessionArgs::new(["-f=kernel-4242.json"]).connection_file(),
            Some("kernel-4242.json")
        );
        assert_eq!(
            SessionArgs::new(["-f", "k.json"]).connection_file(),
            Some("k.json")
        );
        assert_eq!(
            SessionArgs::new(["--existing", "k.json"]).connection_file(),
            Some("k.json")
        );
        assert_eq!(SessionArgs::new(["--existing"]).connection_file(), None);
        assert_eq!(SessionArgs::default().connection_file(), None);
    }

    #[test]
    fn test_attach_existing() {
        assert!(SessionArgs::new(["--existing"]).attach_existing());
        assert!(SessionArgs::new(["--existing=k.json"]).attach_existing());
        assert!(!SessionArgs::new(["-f=k.json"]).attach_existing());
    }
}
