//! Client-side synchronisation with the Specline change stream.
//!
//! [`ClientSync`] keeps a local mirror of the server state alive across
//! connection failures:
//!
//! - Connection lifecycle `Disconnected → Connecting → Connected`, and on
//!   failure `Disconnected → Reconnecting → Connecting`
//! - Exponential reconnect backoff (1s → 30s max) reset by every successful
//!   connect
//! - Activity buffer capped at 100 entries, keeping the most recent
//! - Task board replaced wholesale by every update
//!
//! State is published on a `tokio::sync::watch` channel so the CLI (or any
//! other observer) can render status, attempt counter, buffer and board.
//!
//! # Example
//!
//! ```no_run
//! use specline_monitor::sync::{BackoffPolicy, ClientSync};
//! use specline_monitor::transport::SseConnector;
//!
//! #[tokio::main]
//! async fn main() {
//!     let connector = SseConnector::new("http://localhost:8080").unwrap();
//!     let sync = ClientSync::spawn(connector, BackoffPolicy::default());
//!
//!     let mut updates = sync.subscribe();
//!     while updates.changed().await.is_ok() {
//!         println!("{:?}", updates.borrow().status);
//!     }
//! }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use specline_server::types::{ActivityEntry, ChangeEvent, TaskBoardSnapshot};

use crate::transport::{Connector, TransportError};

/// Maximum number of activity entries kept on the client.
pub const ACTIVITY_CAPACITY: usize = 100;

/// Initial reconnect delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the reconnect delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

// ============================================================================
// Backoff
// ============================================================================

/// Exponential reconnect delays: `min(base · 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before reconnect attempt `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

// ============================================================================
// Client State
// ============================================================================

/// Connection lifecycle as seen by observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Local mirror of the server state.
#[derive(Debug, Clone, Default)]
pub struct ClientState {
    pub status: ConnectionStatus,
    /// Consecutive failed connections since the last successful one.
    pub reconnect_attempts: u32,
    /// Most recent activity entries, oldest first.
    pub activities: VecDeque<ActivityEntry>,
    pub task_board: Option<TaskBoardSnapshot>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Time of the most recent correction event.
    pub last_correction: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_retry_in: Option<Duration>,
}

impl ClientState {
    /// Applies one change event.
    pub fn apply(&mut self, event: ChangeEvent) {
        match event {
            ChangeEvent::InitialState { data, .. } => {
                self.activities = data.activity.entries.into();
                self.trim_activities();
                self.task_board = Some(data.task_board);
            }
            ChangeEvent::Activity { data, .. } => self.append_activities(data.entries),
            ChangeEvent::Correction { timestamp, data } => {
                self.last_correction = Some(timestamp);
                self.append_activities(data.entries);
            }
            ChangeEvent::PrdUpdate { data, .. } => self.task_board = Some(data),
            ChangeEvent::Heartbeat { timestamp } => self.last_heartbeat = Some(timestamp),
        }
    }

    /// Merges entries by id, keeping the buffer in timestamp order.
    fn append_activities(&mut self, entries: Vec<ActivityEntry>) {
        for entry in entries {
            if self.activities.iter().any(|known| known.id == entry.id) {
                continue;
            }
            let at = self
                .activities
                .partition_point(|known| known.timestamp <= entry.timestamp);
            self.activities.insert(at, entry);
        }
        self.trim_activities();
    }

    fn trim_activities(&mut self) {
        while self.activities.len() > ACTIVITY_CAPACITY {
            self.activities.pop_front();
        }
    }
}

// ============================================================================
// Sync Task
// ============================================================================

/// State publisher that refuses updates once torn down.
#[derive(Clone)]
struct Shared {
    state: Arc<watch::Sender<ClientState>>,
    alive: Arc<AtomicBool>,
}

impl Shared {
    /// Applies `f` unless torn down; returns whether it was applied.
    ///
    /// The liveness check runs under the channel's write lock, so nothing
    /// lands after [`SyncHandle::teardown`] returns.
    fn update(&self, f: impl FnOnce(&mut ClientState)) -> bool {
        self.state.send_if_modified(|state| {
            if !self.alive.load(Ordering::SeqCst) {
                return false;
            }
            f(state);
            true
        })
    }
}

/// Spawns the background synchronisation task.
pub struct ClientSync;

impl ClientSync {
    /// Starts connecting with `connector`, reconnecting per `policy`.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn spawn<C: Connector>(connector: C, policy: BackoffPolicy) -> SyncHandle {
        let (state_tx, state_rx) = watch::channel(ClientState::default());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let shared = Shared {
            state: Arc::new(state_tx),
            alive: Arc::new(AtomicBool::new(true)),
        };

        let task = tokio::spawn(run(connector, policy, shared.clone(), cancel_rx));

        SyncHandle {
            state_rx,
            shared,
            cancel: cancel_tx,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Handle to a running [`ClientSync`] task.
///
/// Dropping the handle tears the task down.
pub struct SyncHandle {
    state_rx: watch::Receiver<ClientState>,
    shared: Shared,
    cancel: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncHandle {
    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state_rx.borrow().clone()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Stops syncing: cancels any pending reconnect and closes the connection.
    ///
    /// Returns `false` if already torn down. No event is applied after this
    /// returns.
    pub fn teardown(&self) -> bool {
        let mut first = false;
        self.shared.state.send_modify(|state| {
            first = self.shared.alive.swap(false, Ordering::SeqCst);
            if first {
                state.status = ConnectionStatus::Disconnected;
                state.next_retry_in = None;
            }
        });
        if !first {
            return false;
        }

        self.cancel.send_replace(true);
        if let Some(task) = self.task.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
        info!("Client sync torn down");
        true
    }
}

impl fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncHandle")
            .field("alive", &self.is_alive())
            .field("status", &self.state_rx.borrow().status)
            .finish()
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn run<C: Connector>(
    connector: C,
    policy: BackoffPolicy,
    shared: Shared,
    mut cancel: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        let cancelled = *cancel.borrow();
        if cancelled || !shared.update(|s| s.status = ConnectionStatus::Connecting) {
            break;
        }

        let connected = tokio::select! {
            _ = cancel.changed() => break,
            result = connector.connect() => result,
        };

        let error = match connected {
            Ok(mut frames) => {
                attempt = 0;
                shared.update(|s| {
                    s.status = ConnectionStatus::Connected;
                    s.reconnect_attempts = 0;
                    s.next_retry_in = None;
                    s.last_error = None;
                });
                info!("Connected to change stream");

                loop {
                    let next = tokio::select! {
                        _ = cancel.changed() => return,
                        next = frames.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            debug!(event_type = ?event.event_type(), "Applying change event");
                            if !shared.update(|s| s.apply(event)) {
                                return;
                            }
                        }
                        Some(Err(e)) => break e,
                        None => break TransportError::Closed,
                    }
                }
            }
            Err(e) => e,
        };

        let delay = policy.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        warn!(error = %error, attempt, delay_ms = delay.as_millis() as u64, "Change stream unavailable, reconnecting");

        shared.update(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.last_error = Some(error.to_string());
        });
        shared.update(|s| {
            s.status = ConnectionStatus::Reconnecting;
            s.reconnect_attempts = attempt;
            s.next_retry_in = Some(delay);
        });

        tokio::select! {
            _ = cancel.changed() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    debug!("Client sync stopped");
}
