//! Surgical task status updates on the task board.
//!
//! A status change rewrites exactly one checkbox token on the first line
//! whose task identifier matches; every other byte of the document is
//! preserved. The result is validated and committed through
//! [`BackupManager::atomic_write_with_backup`], so a backup of the previous
//! content always exists before the board changes.
//!
//! Identifier matching is exact: `2` does not match `2.1` or `20`, and `2.1`
//! does not match `2.1.3`.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::store::{is_well_formed, read_document, BackupManager, Result, StoreError};
use crate::types::TaskStatus;

/// `<indent><bullet> <token><optional marker> <rest>`
static TASK_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*[-*+]\s+(?P<token>\[[^\]]*\])\*?\s+(?P<rest>.*)$")
        .expect("task line pattern is valid")
});

/// Outcome of a successful status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub task_id: String,
    /// 1-based line number of the rewritten task.
    pub line: usize,
    pub previous_token: String,
    pub new_token: &'static str,
    pub backup: Option<PathBuf>,
}

/// In-memory result of rewriting one checkbox token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEdit {
    pub content: String,
    pub line: usize,
    pub previous_token: String,
}

/// Applies task status changes to task board documents.
#[derive(Debug, Clone)]
pub struct TaskStatusMutator {
    backups: BackupManager,
}

impl TaskStatusMutator {
    #[must_use]
    pub fn new(backups: BackupManager) -> Self {
        Self { backups }
    }

    /// Sets the checkbox of task `task_id` in `path` to `status`.
    ///
    /// Writing the status a task already has still performs a (byte-identical)
    /// write and backup.
    ///
    /// # Errors
    ///
    /// - [`StoreError::FileNotFound`] if the board does not exist
    /// - [`StoreError::TaskNotFound`] if no task line carries `task_id`
    /// - [`StoreError::ValidationFailed`] if the edited board is malformed
    /// - [`StoreError::BackupFailed`] or [`StoreError::WriteFailed`] from the
    ///   guarded write
    pub fn update_task_status(
        &self,
        path: &Path,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<TaskUpdate> {
        let content = read_document(path)?;

        let edit = apply_status(&content, task_id, status).ok_or_else(|| {
            warn!(path = %path.display(), task_id, "Task not found on board");
            StoreError::TaskNotFound {
                task_id: task_id.to_string(),
                path: path.to_path_buf(),
            }
        })?;

        if !is_well_formed(&edit.content) {
            return Err(StoreError::ValidationFailed {
                path: path.to_path_buf(),
            });
        }

        let backup =
            self.backups
                .atomic_write_with_backup(path, &edit.content, Some(&is_well_formed))?;

        info!(
            path = %path.display(),
            task_id,
            line = edit.line,
            from = %edit.previous_token,
            to = status.checkbox(),
            "Updated task status"
        );

        Ok(TaskUpdate {
            task_id: task_id.to_string(),
            line: edit.line,
            previous_token: edit.previous_token,
            new_token: status.checkbox(),
            backup,
        })
    }
}

/// Rewrites the checkbox of the first line carrying `task_id`.
///
/// Returns `None` when no line matches. Line endings, indentation, bullets,
/// the optional marker and trailing text are all kept as they were.
#[must_use]
pub fn apply_status(content: &str, task_id: &str, status: TaskStatus) -> Option<StatusEdit> {
    let task_id = task_id.trim();
    if task_id.is_empty() {
        return None;
    }

    let mut output = String::with_capacity(content.len());
    let mut edit: Option<(usize, String)> = None;

    for (index, raw) in content.split_inclusive('\n').enumerate() {
        if edit.is_none() {
            let (body, ending) = split_line_ending(raw);
            if let Some(token) = TASK_LINE
                .captures(body)
                .filter(|caps| caps.name("rest").is_some_and(|rest| starts_with_id(rest.as_str(), task_id)))
                .and_then(|caps| caps.name("token"))
            {
                output.push_str(&body[..token.start()]);
                output.push_str(status.checkbox());
                output.push_str(&body[token.end()..]);
                output.push_str(ending);
                edit = Some((index + 1, token.as_str().to_string()));
                continue;
            }
        }
        output.push_str(raw);
    }

    edit.map(|(line, previous_token)| StatusEdit {
        content: output,
        line,
        previous_token,
    })
}

/// True when `rest` begins with exactly `task_id`.
///
/// The identifier may be followed by the end of the line, whitespace,
/// punctuation, or a single `.` that does not start another segment.
fn starts_with_id(rest: &str, task_id: &str) -> bool {
    let Some(after) = rest.strip_prefix(task_id) else {
        return false;
    };

    let mut chars = after.chars();
    match chars.next() {
        None => true,
        Some('.') => !chars.next().is_some_and(|c| c.is_alphanumeric() || c == '_'),
        Some(c) => !(c.is_alphanumeric() || c == '_'),
    }
}

fn split_line_ending(raw: &str) -> (&str, &str) {
    if let Some(body) = raw.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = raw.strip_suffix('\n') {
        (body, "\n")
    } else {
        (raw, "")
    }
}
