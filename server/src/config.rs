//! Server configuration module.
//!
//! Parses configuration from environment variables for the Specline server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SPECLINE_TASK_BOARD` | Yes | - | Path of the task board document |
//! | `SPECLINE_ACTIVITY_LOG` | Yes | - | Path of the activity log document |
//! | `SPECLINE_HEARTBEAT_SECS` | No | 30 | Stream heartbeat interval (at least 1) |
//! | `SPECLINE_DEBOUNCE_MS` | No | 100 | Quiet period before re-parsing a changed file |
//! | `PORT` | No | 8080 | HTTP server port |

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::types::DocumentRole;
use crate::utils::debounce::DEFAULT_DEBOUNCE_MS;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Errors that can occur during configuration parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Locations of the two watched documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPaths {
    pub activity_log: PathBuf,
    pub task_board: PathBuf,
}

impl DocumentPaths {
    #[must_use]
    pub fn new(activity_log: impl Into<PathBuf>, task_board: impl Into<PathBuf>) -> Self {
        Self {
            activity_log: activity_log.into(),
            task_board: task_board.into(),
        }
    }

    #[must_use]
    pub fn path_for(&self, role: DocumentRole) -> &Path {
        match role {
            DocumentRole::ActivityLog => &self.activity_log,
            DocumentRole::TaskBoard => &self.task_board,
        }
    }
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub documents: DocumentPaths,
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub debounce: Duration,
}

impl Config {
    /// Parses configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value cannot
    /// be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let task_board = required_path("SPECLINE_TASK_BOARD")?;
        let activity_log = required_path("SPECLINE_ACTIVITY_LOG")?;

        let heartbeat_secs: u64 = parse_env("SPECLINE_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS)?;
        let debounce_ms: u64 = parse_env("SPECLINE_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)?;
        let port: u16 = parse_env("PORT", DEFAULT_PORT)?;

        if heartbeat_secs == 0 {
            return Err(ConfigError::ValidationError(
                "SPECLINE_HEARTBEAT_SECS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            documents: DocumentPaths {
                activity_log,
                task_board,
            },
            port,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            debounce: Duration::from_millis(debounce_ms),
        })
    }
}

fn required_path(name: &str) -> Result<PathBuf, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(PathBuf::from(value)),
        Ok(_) | Err(env::VarError::NotPresent) => Err(ConfigError::MissingEnvVar(name.to_string())),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("'{value}': {e}"),
        }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: [&str; 5] = [
        "SPECLINE_TASK_BOARD",
        "SPECLINE_ACTIVITY_LOG",
        "SPECLINE_HEARTBEAT_SECS",
        "SPECLINE_DEBOUNCE_MS",
        "PORT",
    ];

    /// Restores the touched environment variables on drop.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.iter().rev() {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    fn with_documents() -> EnvGuard {
        let mut guard = EnvGuard::clean();
        guard.set("SPECLINE_TASK_BOARD", "/work/docs/tasks.md");
        guard.set("SPECLINE_ACTIVITY_LOG", "/work/docs/activity.md");
        guard
    }

    #[test]
    #[serial]
    fn defaults_apply() {
        let _guard = with_documents();

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.documents.task_board, PathBuf::from("/work/docs/tasks.md"));
        assert_eq!(config.documents.activity_log, PathBuf::from("/work/docs/activity.md"));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.debounce, Duration::from_millis(100));
    }

    #[test]
    #[serial]
    fn overrides_apply() {
        let mut guard = with_documents();
        guard.set("SPECLINE_HEARTBEAT_SECS", "5");
        guard.set("SPECLINE_DEBOUNCE_MS", "0");
        guard.set("PORT", "9090");

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.debounce, Duration::ZERO);
        assert_eq!(config.port, 9090);
    }

    #[test]
    #[serial]
    fn missing_task_board_is_an_error() {
        let mut guard = EnvGuard::clean();
        guard.set("SPECLINE_ACTIVITY_LOG", "/work/docs/activity.md");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "SPECLINE_TASK_BOARD"));
    }

    #[test]
    #[serial]
    fn blank_activity_log_is_missing() {
        let mut guard = EnvGuard::clean();
        guard.set("SPECLINE_TASK_BOARD", "/work/docs/tasks.md");
        guard.set("SPECLINE_ACTIVITY_LOG", "  ");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "SPECLINE_ACTIVITY_LOG"));
    }

    #[test]
    #[serial]
    fn invalid_port_is_reported() {
        let mut guard = with_documents();
        guard.set("PORT", "not-a-port");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFormat { ref var, .. } if var == "PORT"));
    }

    #[test]
    #[serial]
    fn zero_heartbeat_rejected() {
        let mut guard = with_documents();
        guard.set("SPECLINE_HEARTBEAT_SECS", "0");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn path_for_role() {
        let paths = DocumentPaths::new("/a/log.md", "/a/tasks.md");
        assert_eq!(paths.path_for(DocumentRole::ActivityLog), Path::new("/a/log.md"));
        assert_eq!(paths.path_for(DocumentRole::TaskBoard), Path::new("/a/tasks.md"));
    }
}
