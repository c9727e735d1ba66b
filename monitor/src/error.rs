//! Error types for the Specline Monitor.
//!
//! Commands of the `specline-monitor` binary return [`MonitorError`]; the
//! binary adds context with `anyhow` before reporting.

use thiserror::Error;

use specline_server::store::StoreError;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Errors that can occur during monitor operations.
///
/// This is the primary error type for the monitor crate, encompassing all
/// possible failure modes.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Change stream connection error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Task board or backup operation error.
    ///
    /// Carries the task ID and reason when a status update is rejected.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Runtime or file system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
