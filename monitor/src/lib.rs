//! Specline Monitor - live task board client and orchestrator CLI.
//!
//! This crate provides the client side of Specline:
//! - [`transport`]: Server-Sent Events connection to the change stream
//! - [`sync`]: reconnecting local mirror of the server state
//! - [`config`]: environment configuration
//!
//! The binary also fronts the server's document store for orchestrators
//! (`set-status`, `backups`).

pub mod config;
pub mod error;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use error::{MonitorError, Result};
pub use sync::{BackoffPolicy, ClientState, ClientSync, ConnectionStatus, SyncHandle};
pub use transport::{Connector, SseConnector, TransportError};
