//! File watcher bridging document changes to stream sessions.
//!
//! Watches the activity log and the task board, re-parses whichever one
//! changed and broadcasts a full fresh snapshot through the
//! [`EventBroadcaster`].
//!
//! # Architecture
//!
//! Each document is watched through its parent directory and filtered by file
//! name. Atomic writes replace the file by rename, which would silently end a
//! watch placed on the file itself.
//!
//! The notify callback is kept lightweight: it only forwards the document's
//! [`DocumentRole`] to a [`Debouncer`], which collapses the burst of events a
//! single write produces. A dedicated async task receives the debounced roles,
//! runs the matching parser and broadcasts the result.
//!
//! A watch that cannot be registered is reported as a
//! [`WatchEvent::Diagnostic`] and recorded; the other document keeps being
//! watched.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use specline_server::broadcast::EventBroadcaster;
//! use specline_server::config::DocumentPaths;
//! use specline_server::watcher::DocumentWatcher;
//!
//! #[tokio::main]
//! async fn main() {
//!     let broadcaster = EventBroadcaster::new();
//!     let mut rx = broadcaster.subscribe();
//!     let paths = DocumentPaths::new("docs/activity.md", "docs/tasks.md");
//!
//!     let watcher = DocumentWatcher::start(paths, broadcaster, Duration::from_millis(100));
//!     while let Ok(event) = rx.recv().await {
//!         println!("{:?} changed", event.role());
//!     }
//!     watcher.close();
//! }
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::{EventBroadcaster, WatchEvent};
use crate::config::DocumentPaths;
use crate::parser::{activity, task_board};
use crate::types::{ActivityLevel, DocumentRole};
use crate::utils::debounce::Debouncer;

/// Errors that can occur while registering a watch.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("failed to create watcher: {0}")]
    WatcherInit(#[from] notify::Error),

    #[error("watch directory does not exist: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("path has no file name: {}", .0.display())]
    InvalidPath(PathBuf),
}

pub type Result<T> = std::result::Result<T, WatcherError>;

/// Watches both documents and publishes fresh snapshots on change.
///
/// Dropping the watcher closes it.
#[derive(Debug)]
pub struct DocumentWatcher {
    watches: Mutex<Vec<RecommendedWatcher>>,
    processor: Mutex<Option<JoinHandle<()>>>,
    diagnostics: Vec<WatchEvent>,
    closed: AtomicBool,
}

impl DocumentWatcher {
    /// Registers watches for both documents and starts processing.
    ///
    /// Must be called within a Tokio runtime. Registration failures do not
    /// fail the call; see [`DocumentWatcher::diagnostics`].
    #[must_use]
    pub fn start(paths: DocumentPaths, broadcaster: EventBroadcaster, debounce: Duration) -> Self {
        let (changed_tx, changed_rx) = mpsc::channel(16);
        let debouncer = Debouncer::new(debounce, changed_tx);

        let mut watches = Vec::new();
        let mut diagnostics = Vec::new();

        for role in DocumentRole::ALL {
            let path = paths.path_for(role);
            match register(role, path, debouncer.clone()) {
                Ok(watch) => {
                    info!(%role, path = %path.display(), "Watching document");
                    if !path.exists() {
                        diagnostics.push(diagnostic(
                            role,
                            format!("{} does not exist yet; waiting for it to be created", path.display()),
                        ));
                    }
                    watches.push(watch);
                }
                Err(e) => {
                    warn!(%role, path = %path.display(), error = %e, "Failed to watch document");
                    diagnostics.push(diagnostic(role, e.to_string()));
                }
            }
        }

        for event in &diagnostics {
            broadcaster.broadcast(event.clone());
        }

        let processor = tokio::spawn(process_changes(changed_rx, paths, broadcaster));

        Self {
            watches: Mutex::new(watches),
            processor: Mutex::new(Some(processor)),
            diagnostics,
            closed: AtomicBool::new(false),
        }
    }

    /// Degradation notices raised while starting.
    #[must_use]
    pub fn diagnostics(&self) -> &[WatchEvent] {
        &self.diagnostics
    }

    /// Number of documents with a live watch.
    #[must_use]
    pub fn active_watches(&self) -> usize {
        self.watches.lock().map_or(0, |watches| watches.len())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drops every native watch and stops processing.
    ///
    /// Returns `false` if the watcher was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Ok(mut watches) = self.watches.lock() {
            watches.clear();
        }
        if let Some(processor) = self.processor.lock().ok().and_then(|mut p| p.take()) {
            processor.abort();
        }

        info!("Document watcher closed");
        true
    }
}

impl Drop for DocumentWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn diagnostic(role: DocumentRole, message: String) -> WatchEvent {
    WatchEvent::Diagnostic { role, message }
}

fn register(
    role: DocumentRole,
    path: &Path,
    debouncer: Debouncer<DocumentRole>,
) -> Result<RecommendedWatcher> {
    let file_name = path
        .file_name()
        .map(OsString::from)
        .ok_or_else(|| WatcherError::InvalidPath(path.to_path_buf()))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if !dir.is_dir() {
        return Err(WatcherError::DirectoryNotFound(dir.to_path_buf()));
    }

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| handle_notify_event(res, role, &file_name, &debouncer),
        Config::default(),
    )?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    debug!(%role, dir = %dir.display(), "Registered directory watch");
    Ok(watcher)
}

fn handle_notify_event(
    res: notify::Result<Event>,
    role: DocumentRole,
    file_name: &OsString,
    debouncer: &Debouncer<DocumentRole>,
) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            error!(%role, error = %e, "File watcher error");
            return;
        }
    };

    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return;
    }

    if event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name.as_os_str()))
    {
        trace!(%role, kind = ?event.kind, "Document changed");
        debouncer.notify(role);
    }
}

async fn process_changes(
    mut changed: mpsc::Receiver<DocumentRole>,
    paths: DocumentPaths,
    broadcaster: EventBroadcaster,
) {
    while let Some(role) = changed.recv().await {
        let event = snapshot_event(role, &paths);
        debug!(%role, "Publishing fresh snapshot");
        broadcaster.broadcast(event);
    }
    debug!("Change processor shutting down");
}

/// Re-parses the document for `role` into the event to publish.
#[must_use]
pub fn snapshot_event(role: DocumentRole, paths: &DocumentPaths) -> WatchEvent {
    let path = paths.path_for(role);
    let parsed = match role {
        DocumentRole::ActivityLog => activity::parse_file(path).map(|feed| {
            if feed.latest_level() == Some(ActivityLevel::Correction) {
                WatchEvent::Correction(feed)
            } else {
                WatchEvent::Activity(feed)
            }
        }),
        DocumentRole::TaskBoard => task_board::parse_file(path).map(WatchEvent::TaskBoard),
    };

    parsed.unwrap_or_else(|e| {
        warn!(%role, error = %e, "Failed to parse document");
        diagnostic(role, e.to_string())
    })
}
