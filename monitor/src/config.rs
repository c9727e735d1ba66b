//! Configuration module for Specline Monitor.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SPECLINE_SERVER_URL` | Yes | - | Server URL (e.g., `http://localhost:8080`) |
//! | `SPECLINE_RECONNECT_BASE_MS` | No | 1000 | First reconnect delay in milliseconds |
//! | `SPECLINE_RECONNECT_MAX_MS` | No | 30000 | Reconnect delay ceiling in milliseconds |
//!
//! The orchestrator-side subcommands (`set-status`, `backups`) read the
//! server's `SPECLINE_TASK_BOARD`, `SPECLINE_BACKUP_DIR` and
//! `SPECLINE_MAX_BACKUPS` through their command-line flags instead.
//!
//! # Example
//!
//! ```no_run
//! use specline_monitor::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Server URL: {}", config.server_url);
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::sync::BackoffPolicy;

/// Default first reconnect delay, in milliseconds.
const DEFAULT_RECONNECT_BASE_MS: u64 = 1000;

/// Default reconnect delay ceiling, in milliseconds.
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Configuration for the Specline Monitor's stream client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Specline server.
    pub server_url: String,

    /// Reconnect delays after a lost connection.
    pub backoff: BackoffPolicy,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `SPECLINE_SERVER_URL` is not set
    /// - a reconnect delay is not a positive integer
    /// - the reconnect ceiling is below the first delay
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_url(None)
    }

    /// Like [`Config::from_env`], with `server_url` taking precedence over
    /// `SPECLINE_SERVER_URL` when given.
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_env_with_url(server_url: Option<String>) -> Result<Self, ConfigError> {
        let server_url = match server_url {
            Some(url) => url,
            None => env::var("SPECLINE_SERVER_URL")
                .map_err(|_| ConfigError::MissingEnvVar("SPECLINE_SERVER_URL".to_string()))?,
        };

        let base_ms = positive_millis("SPECLINE_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS)?;
        let max_ms = positive_millis("SPECLINE_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)?;
        if max_ms < base_ms {
            return Err(ConfigError::InvalidValue {
                key: "SPECLINE_RECONNECT_MAX_MS".to_string(),
                message: format!("must be at least SPECLINE_RECONNECT_BASE_MS ({base_ms})"),
            });
        }

        Ok(Self {
            server_url,
            backoff: BackoffPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            ),
        })
    }
}

fn positive_millis(key: &str, default: u64) -> Result<u64, ConfigError> {
    let Ok(val) = env::var(key) else {
        return Ok(default);
    };
    match val.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(ms),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected positive integer, got '{val}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Helper to run tests with isolated environment variables.
    /// Clears all SPECLINE_* vars before the test and restores them after.
    fn with_clean_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved_vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("SPECLINE_"))
            .collect();

        for (key, _) in &saved_vars {
            env::remove_var(key);
        }

        let result = f();

        for (key, _) in env::vars().filter(|(k, _)| k.starts_with("SPECLINE_")) {
            env::remove_var(key);
        }
        for (key, value) in saved_vars {
            env::set_var(key, value);
        }

        result
    }

    #[test]
    #[serial]
    fn test_missing_server_url() {
        with_clean_env(|| {
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::MissingEnvVar(ref s) if s == "SPECLINE_SERVER_URL"));
        });
    }

    #[test]
    #[serial]
    fn test_minimal_config() {
        with_clean_env(|| {
            env::set_var("SPECLINE_SERVER_URL", "http://localhost:8080");

            let config = Config::from_env().expect("should parse minimal config");

            assert_eq!(config.server_url, "http://localhost:8080");
            assert_eq!(config.backoff, BackoffPolicy::default());
        });
    }

    #[test]
    #[serial]
    fn test_url_override_wins() {
        with_clean_env(|| {
            env::set_var("SPECLINE_SERVER_URL", "http://from-env:8080");

            let config = Config::from_env_with_url(Some("http://from-flag:9000".to_string()))
                .expect("should accept override");

            assert_eq!(config.server_url, "http://from-flag:9000");
        });
    }

    #[test]
    #[serial]
    fn test_custom_backoff() {
        with_clean_env(|| {
            env::set_var("SPECLINE_SERVER_URL", "http://localhost:8080");
            env::set_var("SPECLINE_RECONNECT_BASE_MS", "250");
            env::set_var("SPECLINE_RECONNECT_MAX_MS", "4000");

            let config = Config::from_env().unwrap();

            assert_eq!(config.backoff.base, Duration::from_millis(250));
            assert_eq!(config.backoff.max, Duration::from_secs(4));
        });
    }

    #[test]
    #[serial]
    fn test_invalid_backoff_values() {
        with_clean_env(|| {
            env::set_var("SPECLINE_SERVER_URL", "http://localhost:8080");

            env::set_var("SPECLINE_RECONNECT_BASE_MS", "0");
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SPECLINE_RECONNECT_BASE_MS"));

            env::set_var("SPECLINE_RECONNECT_BASE_MS", "soon");
            assert!(Config::from_env().is_err());

            env::set_var("SPECLINE_RECONNECT_BASE_MS", "5000");
            env::set_var("SPECLINE_RECONNECT_MAX_MS", "1000");
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SPECLINE_RECONNECT_MAX_MS"));
        });
    }
}
