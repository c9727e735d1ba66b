//! Specline Server - atomic document store and live change stream.
//!
//! This crate provides the server component of Specline, responsible for:
//! - Writing the task board and activity log atomically, with backups
//! - Updating individual task checkboxes without disturbing the document
//! - Parsing both documents into structured snapshots
//! - Watching the documents and streaming every change to dashboards
//!
//! # Architecture
//!
//! The documents on disk are the only source of truth. Writers go through
//! [`store`] and [`tasks`]; the [`watcher`] notices the resulting file system
//! changes, re-parses with [`parser`] and publishes through [`broadcast`];
//! each [`stream`] session forwards those snapshots to one client over the
//! HTTP [`routes`]. Nothing is cached between operations, so a client that
//! misses an event recovers from the next snapshot.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod parser;
pub mod routes;
pub mod store;
pub mod stream;
pub mod tasks;
pub mod types;
pub mod utils;
pub mod watcher;
