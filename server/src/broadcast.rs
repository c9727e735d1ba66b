//! Fan-out of document change events to stream sessions.
//!
//! A single [`crate::watcher::DocumentWatcher`] publishes every fresh parse
//! result through an [`EventBroadcaster`]; each stream session holds its own
//! subscription for as long as it is open.
//!
//! # Architecture
//!
//! The broadcaster wraps a tokio broadcast channel. Events are snapshots, not
//! diffs, so a receiver that falls behind (`RecvError::Lagged`) loses nothing
//! it cannot recover by re-reading the documents.
//!
//! # Example
//!
//! ```rust
//! use specline_server::broadcast::{EventBroadcaster, WatchEvent};
//! use specline_server::types::TaskBoardSnapshot;
//!
//! let broadcaster = EventBroadcaster::new();
//! let mut rx = broadcaster.subscribe();
//!
//! broadcaster.broadcast(WatchEvent::TaskBoard(TaskBoardSnapshot::default()));
//! assert!(matches!(rx.try_recv(), Ok(WatchEvent::TaskBoard(_))));
//! ```

use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, trace};

use crate::types::{ActivityFeed, DocumentRole, TaskBoardSnapshot};

/// Default capacity of the broadcast channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A fresh parse result (or degradation notice) for one watched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Activity(ActivityFeed),
    /// The activity log changed and its newest entry is a correction.
    Correction(ActivityFeed),
    TaskBoard(TaskBoardSnapshot),
    Diagnostic { role: DocumentRole, message: String },
}

impl WatchEvent {
    /// The document this event was produced from.
    #[must_use]
    pub fn role(&self) -> DocumentRole {
        match self {
            Self::Activity(_) | Self::Correction(_) => DocumentRole::ActivityLog,
            Self::TaskBoard(_) => DocumentRole::TaskBoard,
            Self::Diagnostic { role, .. } => *role,
        }
    }
}

/// Multi-subscriber hub for [`WatchEvent`]s. Clones share one channel.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: Sender<WatchEvent>,
}

impl EventBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        debug!(capacity, "Created event broadcaster");
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> Receiver<WatchEvent> {
        let rx = self.sender.subscribe();
        debug!(
            subscriber_count = self.subscriber_count(),
            "New subscriber added"
        );
        rx
    }

    /// Sends `event` to every current subscriber.
    ///
    /// Returns the number of subscribers reached; zero is not an error.
    pub fn broadcast(&self, event: WatchEvent) -> usize {
        let role = event.role();
        match self.sender.send(event) {
            Ok(receivers) => {
                trace!(%role, receivers, "Broadcast watch event");
                receivers
            }
            Err(_) => {
                trace!(%role, "No subscribers for watch event");
                0
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
