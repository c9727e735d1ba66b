//! Temp-file-then-rename writes and the markdown well-formedness check.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use super::{Result, StoreError};

/// Content predicate consulted after staging and before commit.
pub type Validator<'a> = &'a dyn Fn(&str) -> bool;

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Replaces `path` with `content` so that readers never see a partial write.
///
/// Missing parent directories are created. When `validate` is given and
/// rejects the content, the staged file is removed and the target keeps its
/// previous content.
///
/// # Errors
///
/// Returns [`StoreError::ValidationFailed`] when the validator rejects the
/// content and [`StoreError::WriteFailed`] for any I/O failure while staging
/// or committing. No temp file is left behind in either case.
pub fn atomic_write(path: &Path, content: &str, validate: Option<Validator<'_>>) -> Result<()> {
    let write_failed = |source: io::Error| StoreError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_failed)?;
    }

    let temp = temp_path_for(path);
    if let Err(e) = stage(&temp, content) {
        discard(&temp);
        return Err(write_failed(e));
    }

    if let Some(validate) = validate {
        if !validate(content) {
            discard(&temp);
            warn!(path = %path.display(), "Rejected malformed document content");
            return Err(StoreError::ValidationFailed {
                path: path.to_path_buf(),
            });
        }
    }

    if let Err(e) = fs::rename(&temp, path) {
        discard(&temp);
        return Err(write_failed(e));
    }

    debug!(path = %path.display(), bytes = content.len(), "Committed document");
    Ok(())
}

/// Minimal structural check for markdown documents.
///
/// Content must contain something other than whitespace, must not contain NUL
/// bytes, and must close every fenced code block it opens.
#[must_use]
pub fn is_well_formed(content: &str) -> bool {
    if content.trim().is_empty() || content.contains('\0') {
        return false;
    }

    let fences = content
        .lines()
        .filter(|line| line.trim_start().starts_with("```"))
        .count();
    fences % 2 == 0
}

/// Sibling temp path, unique per process and per call.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "document".to_string(), |n| n.to_string_lossy().into_owned());
    let seq = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!("{name}.{}.{seq}.tmp", std::process::id()))
}

fn stage(temp: &Path, content: &str) -> io::Result<()> {
    let mut file = File::create(temp)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()
}

fn discard(temp: &Path) {
    if let Err(e) = fs::remove_file(temp) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %temp.display(), error = %e, "Failed to remove staged file");
        }
    }
}
