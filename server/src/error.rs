//! Error types for the Specline server.
//!
//! Each module owns a focused error enum. Document and watch failures are
//! reported in-band on the change stream, so [`ServerError`] only covers
//! what stops the server from starting or serving.

use std::io;

use thiserror::Error;

pub use crate::config::ConfigError;

/// Top-level error type for the server.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

/// Result type alias using [`ServerError`].
pub type Result<T> = std::result::Result<T, ServerError>;
