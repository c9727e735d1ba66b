//! Read-only parsers for the watched documents.
//!
//! Parsers are pure functions over document text plus thin file wrappers.
//! A missing or unreadable file is not an error: the wrappers return an
//! empty result carrying a [`Diagnostic`]. Any other I/O failure surfaces as
//! [`ParseError`].

pub mod activity;
pub mod task_board;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::{Diagnostic, DiagnosticKind};

/// Errors raised while reading a document for parsing.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result type for parser file wrappers.
pub type Result<T> = std::result::Result<T, ParseError>;

/// Document text, or the reason it could not be read.
pub(crate) enum Source {
    Text(String),
    Degraded(Diagnostic),
}

pub(crate) fn read_source(path: &Path) -> Result<Source> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Source::Text(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Source::Degraded(Diagnostic {
            kind: DiagnosticKind::FileNotFound,
            path: path.display().to_string(),
            message: format!("{} does not exist", path.display()),
        })),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            Ok(Source::Degraded(Diagnostic {
                kind: DiagnosticKind::PermissionDenied,
                path: path.display().to_string(),
                message: format!("permission denied reading {}", path.display()),
            }))
        }
        Err(source) => Err(ParseError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
