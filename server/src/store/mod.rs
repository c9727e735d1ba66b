//! Durable document store.
//!
//! Every write to a managed document goes through [`atomic_write`]: content is
//! staged in a uniquely named sibling temp file, flushed to disk, then renamed
//! over the target. Readers therefore only ever observe the previous or the
//! new complete content.
//!
//! [`BackupManager`] layers timestamped snapshots and retention on top, and
//! [`BackupManager::atomic_write_with_backup`] is the entry point used for
//! every orchestrator-driven mutation.

mod atomic;
mod backup;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use atomic::{atomic_write, is_well_formed, Validator};
pub use backup::{
    backup_file_name, default_backup_dir, Backup, BackupConfig, BackupManager, DEFAULT_MAX_BACKUPS,
};

/// Errors raised by the document store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The validator rejected the candidate content; the target is untouched.
    #[error("validation failed for {}", path.display())]
    ValidationFailed { path: PathBuf },

    /// Staging, flushing or renaming failed.
    #[error("failed to write {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// No task line carries the requested identifier.
    #[error("task '{task_id}' not found in {}", path.display())]
    TaskNotFound { task_id: String, path: PathBuf },

    /// Snapshotting the current content failed, so the write was aborted.
    #[error("backup of {} failed: {source}", path.display())]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: Box<StoreError>,
    },

    /// The source document does not exist.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Reading a document or listing a directory failed.
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Reads a document, mapping a missing file to [`StoreError::FileNotFound`].
pub(crate) fn read_document(path: &std::path::Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::FileNotFound(path.to_path_buf())
        } else {
            StoreError::ReadFailed {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}
