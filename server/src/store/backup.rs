//! Timestamped backups with bounded retention.
//!
//! Backups live in a dedicated directory and are named
//! `<source file name>.backup.<timestamp>.md`, where the timestamp is UTC
//! with microsecond precision and `:`/`.` replaced by `-`. The fixed-width
//! timestamp makes lexical order equal chronological order, which retention
//! and listing rely on.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::atomic::{atomic_write, Validator};
use super::{read_document, Result, StoreError};

/// Default number of backups kept per source document.
pub const DEFAULT_MAX_BACKUPS: usize = 10;

const BACKUP_MARKER: &str = ".backup.";
const BACKUP_DIR_NAME: &str = ".backups";
const BACKUP_EXTENSION: &str = ".md";

/// Where backups go and how many are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub dir: PathBuf,
    /// Always at least 1.
    pub max_backups: usize,
}

impl BackupConfig {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }

    /// Sets the retention count, clamped to at least one.
    #[must_use]
    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups.max(1);
        self
    }
}

/// A backup file found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// File name of the document this backup was taken from.
    pub source_file_name: String,
    pub path: PathBuf,
    /// The sanitized timestamp segment of the file name.
    pub timestamp: String,
}

/// Creates, lists, prunes and restores backups for managed documents.
#[derive(Debug, Clone)]
pub struct BackupManager {
    config: BackupConfig,
}

impl BackupManager {
    #[must_use]
    pub fn new(config: BackupConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Snapshots the current content of `path` and prunes old backups.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] if `path` does not exist, or a
    /// read/write error if the snapshot cannot be taken. A pruning failure is
    /// logged and does not fail the call.
    pub fn create_backup(&self, path: &Path) -> Result<PathBuf> {
        let content = read_document(path)?;
        let backup_path = self.next_backup_path(&source_name(path));

        atomic_write(&backup_path, &content, None)?;
        info!(
            source = %path.display(),
            backup = %backup_path.display(),
            "Created backup"
        );

        if let Err(e) = self.prune(path) {
            warn!(source = %path.display(), error = %e, "Failed to prune old backups");
        }

        Ok(backup_path)
    }

    /// Lists backups of `path`, newest first.
    ///
    /// A missing backup directory yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ReadFailed`] if the directory cannot be read.
    pub fn list_backups(&self, path: &Path) -> Result<Vec<Backup>> {
        let source_file_name = source_name(path);
        let prefix = format!("{source_file_name}{BACKUP_MARKER}");
        let entries = match fs::read_dir(&self.config.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::ReadFailed {
                    path: self.config.dir.clone(),
                    source,
                })
            }
        };

        let mut backups: Vec<Backup> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let timestamp = name
                    .strip_prefix(&prefix)?
                    .strip_suffix(BACKUP_EXTENSION)?
                    .to_string();
                Some(Backup {
                    source_file_name: source_file_name.clone(),
                    path: entry.path(),
                    timestamp,
                })
            })
            .collect();

        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(backups)
    }

    /// Deletes all but the newest `max_backups` backups of `path`.
    ///
    /// Returns how many files were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backup directory cannot be listed. Individual
    /// deletion failures are logged and skipped.
    pub fn prune(&self, path: &Path) -> Result<usize> {
        let backups = self.list_backups(path)?;
        let mut removed = 0;

        for stale in backups.iter().skip(self.config.max_backups) {
            match fs::remove_file(&stale.path) {
                Ok(()) => {
                    removed += 1;
                    debug!(backup = %stale.path.display(), "Pruned backup");
                }
                Err(e) => warn!(backup = %stale.path.display(), error = %e, "Failed to prune backup"),
            }
        }

        Ok(removed)
    }

    /// Atomically copies a backup's content over `target`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] if the backup does not exist, or a
    /// write error if the copy cannot be committed.
    pub fn restore_from_backup(&self, backup_path: &Path, target: &Path) -> Result<()> {
        let content = read_document(backup_path)?;
        atomic_write(target, &content, None)?;
        info!(
            backup = %backup_path.display(),
            target = %target.display(),
            "Restored document from backup"
        );
        Ok(())
    }

    /// Backs up the current content of `path` (if it exists), then writes.
    ///
    /// Returns the backup path when one was taken.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BackupFailed`] if the target exists but cannot be
    /// backed up; nothing is written in that case. Otherwise behaves like
    /// [`atomic_write`].
    pub fn atomic_write_with_backup(
        &self,
        path: &Path,
        content: &str,
        validate: Option<Validator<'_>>,
    ) -> Result<Option<PathBuf>> {
        let backup = if path.exists() {
            let created = self
                .create_backup(path)
                .map_err(|source| StoreError::BackupFailed {
                    path: path.to_path_buf(),
                    source: Box::new(source),
                })?;
            Some(created)
        } else {
            None
        };

        atomic_write(path, content, validate)?;
        Ok(backup)
    }

    /// First unused backup path for `name`, nudging the timestamp forward by a
    /// microsecond on collision.
    fn next_backup_path(&self, name: &str) -> PathBuf {
        let mut at = Utc::now();
        loop {
            let candidate = self.config.dir.join(backup_file_name(name, at));
            if !candidate.exists() {
                return candidate;
            }
            at += TimeDelta::microseconds(1);
        }
    }
}

/// Builds the backup file name for a source file name at a point in time.
#[must_use]
pub fn backup_file_name(source_name: &str, at: DateTime<Utc>) -> String {
    let stamp = at
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
        .replace([':', '.'], "-");
    format!("{source_name}{BACKUP_MARKER}{stamp}{BACKUP_EXTENSION}")
}

/// `<dir of document>/.backups`
#[must_use]
pub fn default_backup_dir(document: &Path) -> PathBuf {
    document
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join(BACKUP_DIR_NAME)
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "document".to_string(), |n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::is_well_formed;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, max: usize) -> BackupManager {
        BackupManager::new(BackupConfig::new(dir.path().join(".backups")).with_max_backups(max))
    }

    #[test]
    fn backup_name_is_sanitized_and_sortable() {
        let at = DateTime::parse_from_rfc3339("2025-01-15T10:30:45.123456Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(
            backup_file_name("tasks.md", at),
            "tasks.md.backup.2025-01-15T10-30-45-123456Z.md"
        );
    }

    #[test]
    fn max_backups_is_at_least_one() {
        let config = BackupConfig::new("/tmp/backups").with_max_backups(0);
        assert_eq!(config.max_backups, 1);
        assert_eq!(BackupConfig::new("/tmp/backups").max_backups, DEFAULT_MAX_BACKUPS);
    }

    #[test]
    fn create_backup_copies_current_content() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("tasks.md");
        fs::write(&source, "- [ ] 1 First\n").unwrap();

        let backups = manager(&dir, 10);
        let backup = backups.create_backup(&source).unwrap();

        assert_eq!(fs::read_to_string(&backup).unwrap(), "- [ ] 1 First\n");
        assert!(backup.starts_with(dir.path().join(".backups")));
    }

    #[test]
    fn create_backup_of_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let err = manager(&dir, 10)
            .create_backup(&dir.path().join("missing.md"))
            .unwrap_err();

        assert!(matches!(err, StoreError::FileNotFound(_)));
    }

    #[test]
    fn retention_keeps_newest_backups() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("tasks.md");
        let backups = manager(&dir, 3);

        let mut created = Vec::new();
        for i in 0..6 {
            fs::write(&source, format!("version {i}\n")).unwrap();
            created.push(backups.create_backup(&source).unwrap());
        }

        let listed = backups.list_backups(&source).unwrap();
        assert_eq!(listed.len(), 3);

        let newest: Vec<PathBuf> = created.iter().rev().take(3).cloned().collect();
        let listed_paths: Vec<PathBuf> = listed.iter().map(|b| b.path.clone()).collect();
        assert_eq!(listed_paths, newest);
        assert_eq!(fs::read_to_string(&listed[0].path).unwrap(), "version 5\n");
    }

    #[test]
    fn listing_ignores_other_documents() {
        let dir = TempDir::new().unwrap();
        let tasks = dir.path().join("tasks.md");
        let log = dir.path().join("log.md");
        fs::write(&tasks, "tasks\n").unwrap();
        fs::write(&log, "log\n").unwrap();

        let backups = manager(&dir, 10);
        backups.create_backup(&tasks).unwrap();
        backups.create_backup(&log).unwrap();
        backups.create_backup(&log).unwrap();

        assert_eq!(backups.list_backups(&tasks).unwrap().len(), 1);
        assert_eq!(backups.list_backups(&log).unwrap().len(), 2);
    }

    #[test]
    fn listed_backups_name_their_source() {
        let dir = TempDir::new().unwrap();
        let tasks = dir.path().join("tasks.md");
        fs::write(&tasks, "tasks\n").unwrap();

        let backups = manager(&dir, 10);
        backups.create_backup(&tasks).unwrap();

        let listed = backups.list_backups(&tasks).unwrap();
        assert_eq!(listed[0].source_file_name, "tasks.md");

        let json = serde_json::to_value(&listed[0]).unwrap();
        assert_eq!(json["sourceFileName"], "tasks.md");
        assert_eq!(json["timestamp"], listed[0].timestamp.as_str());
    }

    #[test]
    fn default_backup_dir_sits_beside_the_document() {
        assert_eq!(
            default_backup_dir(Path::new("/work/docs/tasks.md")),
            PathBuf::from("/work/docs/.backups")
        );
        assert_eq!(default_backup_dir(Path::new("tasks.md")), PathBuf::from("./.backups"));
    }

    #[test]
    fn listing_without_backup_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let listed = manager(&dir, 10)
            .list_backups(&dir.path().join("tasks.md"))
            .unwrap();
        assert!(listed.is_empty());
    }

    #[test]
    fn restore_replaces_target_content() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("tasks.md");
        fs::write(&source, "good\n").unwrap();
        let backups = manager(&dir, 10);
        let backup = backups.create_backup(&source).unwrap();

        fs::write(&source, "broken\n").unwrap();
        backups.restore_from_backup(&backup, &source).unwrap();

        assert_eq!(fs::read_to_string(&source).unwrap(), "good\n");
    }

    #[test]
    fn guarded_write_without_existing_target_skips_backup() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("new.md");

        let backup = manager(&dir, 10)
            .atomic_write_with_backup(&target, "# New\n", Some(&is_well_formed))
            .unwrap();

        assert!(backup.is_none());
        assert_eq!(fs::read_to_string(&target).unwrap(), "# New\n");
    }

    #[test]
    fn guarded_write_backs_up_previous_content() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("tasks.md");
        fs::write(&target, "old\n").unwrap();

        let backup = manager(&dir, 10)
            .atomic_write_with_backup(&target, "new\n", None)
            .unwrap()
            .expect("backup taken");

        assert_eq!(fs::read_to_string(&backup).unwrap(), "old\n");
        assert_eq!(fs::read_to_string(&target).unwrap(), "new\n");
    }

    #[test]
    fn guarded_write_aborts_when_backup_fails() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("tasks.md");
        fs::write(&target, "old\n").unwrap();

        // A regular file where the backup directory should be.
        let blocked = dir.path().join("not-a-dir");
        fs::write(&blocked, "").unwrap();
        let backups = BackupManager::new(BackupConfig::new(&blocked));

        let err = backups
            .atomic_write_with_backup(&target, "new\n", None)
            .unwrap_err();

        assert!(matches!(err, StoreError::BackupFailed { .. }));
        assert_eq!(fs::read_to_string(&target).unwrap(), "old\n");
    }
}
