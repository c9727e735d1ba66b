//! Per-connection change stream sessions.
//!
//! A [`StreamSession`] turns the shared [`EventBroadcaster`] into the ordered
//! sequence of [`ChangeEvent`]s one client receives:
//!
//! 1. `InitialState` with a full snapshot of both documents
//! 2. every subsequent document change, as soon as it is published
//! 3. a `Heartbeat` on a fixed interval, independent of changes
//!
//! # Lifecycle
//!
//! `Connecting → Open → Streaming → Closed`. The session subscribes before it
//! reads the snapshot, so a change landing in between is delivered rather than
//! lost. Teardown happens exactly once, when the client goes away or
//! [`SessionHandle::disconnect`] is called (any number of times); after that
//! nothing more is written.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::broadcast::{EventBroadcaster, WatchEvent};
use crate::config::DocumentPaths;
use crate::parser::{self, activity, task_board};
use crate::types::{ChangeEvent, StateSnapshot};

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const FRAME_BUFFER: usize = 64;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Streaming,
    Closed,
}

/// Everything a session needs from the server.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub documents: DocumentPaths,
    pub broadcaster: EventBroadcaster,
    pub heartbeat_interval: Duration,
}

/// Builds a full snapshot of both documents.
///
/// # Errors
///
/// Returns [`parser::ParseError`] if either document exists but cannot be read.
pub fn build_snapshot(documents: &DocumentPaths) -> parser::Result<StateSnapshot> {
    Ok(StateSnapshot {
        activity: activity::parse_file(&documents.activity_log)?,
        task_board: task_board::parse_file(&documents.task_board)?,
    })
}

/// `InitialState` for the current documents, or an in-band error if the
/// snapshot cannot be built.
#[must_use]
pub fn initial_state_event(documents: &DocumentPaths) -> ChangeEvent {
    match build_snapshot(documents) {
        Ok(snapshot) => ChangeEvent::initial_state(snapshot),
        Err(e) => {
            warn!(error = %e, "Failed to build snapshot");
            ChangeEvent::stream_error(format!("failed to build snapshot: {e}"))
        }
    }
}

/// Maps a broadcast watch event to the wire event sent to clients.
#[must_use]
pub fn change_event_for(event: WatchEvent) -> ChangeEvent {
    match event {
        WatchEvent::Activity(feed) => ChangeEvent::activity(feed),
        WatchEvent::Correction(feed) => ChangeEvent::correction(feed),
        WatchEvent::TaskBoard(board) => ChangeEvent::prd_update(board),
        WatchEvent::Diagnostic { role, message } => {
            ChangeEvent::stream_error(format!("{role} unavailable: {message}"))
        }
    }
}

#[derive(Debug)]
struct Shared {
    connection_id: Uuid,
    open_since: DateTime<Utc>,
    state: Mutex<SessionState>,
    closed: AtomicBool,
    teardowns: AtomicUsize,
}

impl Shared {
    fn state(&self) -> SessionState {
        self.state.lock().map_or(SessionState::Closed, |s| *s)
    }

    fn transition(&self, next: SessionState) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            trace!(connection_id = %self.connection_id, from = ?*state, to = ?next, "Session transition");
            *state = next;
        }
    }

    fn is_stopping(&self, disconnect: &watch::Receiver<bool>) -> bool {
        self.closed.load(Ordering::SeqCst) || *disconnect.borrow()
    }

    /// Writes one frame. Returns `false` once the session is closed, a
    /// disconnect was requested or the client is gone.
    ///
    /// Waiting for buffer space gives way to a disconnect, and the frame is
    /// only committed if no disconnect arrived in the meantime.
    async fn send(
        &self,
        frames: &mpsc::Sender<ChangeEvent>,
        disconnect: &mut watch::Receiver<bool>,
        event: ChangeEvent,
    ) -> bool {
        if self.is_stopping(disconnect) {
            return false;
        }
        let permit = tokio::select! {
            biased;
            _ = disconnect.changed() => return false,
            permit = frames.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };
        if self.is_stopping(disconnect) {
            return false;
        }
        permit.send(event);
        true
    }

    fn send_heartbeat(&self, frames: &mpsc::Sender<ChangeEvent>, disconnect: &watch::Receiver<bool>) {
        if self.is_stopping(disconnect) {
            return;
        }
        if let Err(e) = frames.try_send(ChangeEvent::heartbeat()) {
            trace!(connection_id = %self.connection_id, error = %e, "Heartbeat not delivered");
        }
    }

    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            *state = SessionState::Closed;
        }
        self.teardowns.fetch_add(1, Ordering::SeqCst);

        let open_for = Utc::now() - self.open_since;
        info!(
            connection_id = %self.connection_id,
            open_secs = open_for.num_seconds(),
            "Stream session closed"
        );
    }
}

/// Entry point for opening sessions.
pub struct StreamSession;

impl StreamSession {
    /// Opens a session and returns the stream of events for its client.
    ///
    /// Must be called within a Tokio runtime. Dropping the returned stream
    /// disconnects the session.
    #[must_use]
    pub fn open(ctx: SessionContext) -> SessionStream {
        let shared = Arc::new(Shared {
            connection_id: Uuid::new_v4(),
            open_since: Utc::now(),
            state: Mutex::new(SessionState::Connecting),
            closed: AtomicBool::new(false),
            teardowns: AtomicUsize::new(0),
        });
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let (disconnect_tx, disconnect_rx) = watch::channel(false);

        let subscription = ctx.broadcaster.subscribe();
        info!(connection_id = %shared.connection_id, "Stream session opened");

        tokio::spawn(run_session(
            Arc::clone(&shared),
            ctx,
            subscription,
            frames_tx,
            disconnect_rx,
        ));

        SessionStream {
            frames: frames_rx,
            handle: SessionHandle {
                shared,
                disconnect: Arc::new(disconnect_tx),
            },
        }
    }
}

/// Control handle for an open session. Clones refer to the same session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
    disconnect: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    #[must_use]
    pub fn connection_id(&self) -> Uuid {
        self.shared.connection_id
    }

    #[must_use]
    pub fn open_since(&self) -> DateTime<Utc> {
        self.shared.open_since
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// How many times teardown ran; never more than one.
    #[must_use]
    pub fn teardown_count(&self) -> usize {
        self.shared.teardowns.load(Ordering::SeqCst)
    }

    /// Signals the session to close. Safe to call repeatedly.
    pub fn disconnect(&self) {
        self.disconnect.send_replace(true);
    }
}

/// Frames destined for one client.
///
/// Yields `None` once the session has closed.
#[derive(Debug)]
pub struct SessionStream {
    frames: mpsc::Receiver<ChangeEvent>,
    handle: SessionHandle,
}

impl SessionStream {
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }
}

impl Stream for SessionStream {
    type Item = ChangeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().frames.poll_recv(cx)
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.handle.disconnect();
    }
}

async fn run_session(
    shared: Arc<Shared>,
    ctx: SessionContext,
    mut subscription: broadcast::Receiver<WatchEvent>,
    frames: mpsc::Sender<ChangeEvent>,
    mut disconnect: watch::Receiver<bool>,
) {
    shared.transition(SessionState::Open);

    if shared
        .send(&frames, &mut disconnect, initial_state_event(&ctx.documents))
        .await
    {
        shared.transition(SessionState::Streaming);
        stream_changes(&shared, &ctx, &mut subscription, &frames, &mut disconnect).await;
    }

    drop(subscription);
    shared.teardown();
}

async fn stream_changes(
    shared: &Shared,
    ctx: &SessionContext,
    subscription: &mut broadcast::Receiver<WatchEvent>,
    frames: &mpsc::Sender<ChangeEvent>,
    disconnect: &mut watch::Receiver<bool>,
) {
    let period = ctx.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = disconnect.changed() => {
                debug!(connection_id = %shared.connection_id, "Disconnect requested");
                return;
            }
            () = frames.closed() => {
                debug!(connection_id = %shared.connection_id, "Client went away");
                return;
            }
            _ = heartbeat.tick() => shared.send_heartbeat(frames, disconnect),
            received = subscription.recv() => {
                let event = match received {
                    Ok(event) => change_event_for(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connection_id = %shared.connection_id, skipped, "Session lagged, resending snapshot");
                        initial_state_event(&ctx.documents)
                    }
                    Err(RecvError::Closed) => return,
                };
                if !shared.send(frames, disconnect, event).await {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActivityLevel, ChangeEventType, TaskBoardSnapshot};
    use futures_util::stream::StreamExt;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(2);

    fn context(dir: &TempDir, broadcaster: &EventBroadcaster, heartbeat: Duration) -> SessionContext {
        let documents =
            DocumentPaths::new(dir.path().join("activity.md"), dir.path().join("tasks.md"));
        fs::write(&documents.task_board, "- [x] 1 Done\n- [ ] 2 Pending\n").unwrap();
        fs::write(&documents.activity_log, "## 2025-01-15 10:00 - Task 1 completed\n").unwrap();
        SessionContext {
            documents,
            broadcaster: broadcaster.clone(),
            heartbeat_interval: heartbeat,
        }
    }

    async fn next(stream: &mut SessionStream) -> Option<ChangeEvent> {
        timeout(WAIT, stream.next()).await.expect("frame within timeout")
    }

    async fn wait_for_state(handle: &SessionHandle, state: SessionState) {
        timeout(WAIT, async {
            while handle.state() != state {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state reached");
    }

    #[tokio::test]
    async fn initial_state_comes_first() {
        let dir = TempDir::new().unwrap();
        let broadcaster = EventBroadcaster::new();
        let mut stream = StreamSession::open(context(&dir, &broadcaster, DEFAULT_HEARTBEAT_INTERVAL));

        match next(&mut stream).await {
            Some(ChangeEvent::InitialState { data, .. }) => {
                assert_eq!(data.task_board.total_tasks, 2);
                assert_eq!(data.task_board.completion_percentage, 50);
                assert_eq!(data.activity.entries.len(), 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        wait_for_state(&stream.handle(), SessionState::Streaming).await;
    }

    #[tokio::test]
    async fn broadcast_changes_are_forwarded() {
        let dir = TempDir::new().unwrap();
        let broadcaster = EventBroadcaster::new();
        let mut stream = StreamSession::open(context(&dir, &broadcaster, DEFAULT_HEARTBEAT_INTERVAL));
        next(&mut stream).await;

        broadcaster.broadcast(WatchEvent::TaskBoard(TaskBoardSnapshot::default()));
        let frame = next(&mut stream).await.unwrap();
        assert_eq!(frame.event_type(), ChangeEventType::PrdUpdate);

        broadcaster.broadcast(WatchEvent::Diagnostic {
            role: crate::types::DocumentRole::ActivityLog,
            message: "gone".to_string(),
        });
        match next(&mut stream).await {
            Some(ChangeEvent::Activity { data, .. }) => {
                assert_eq!(data.entries[0].level, ActivityLevel::Error);
                assert!(data.entries[0].message.contains("gone"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_stream_receives_heartbeats() {
        let dir = TempDir::new().unwrap();
        let broadcaster = EventBroadcaster::new();
        let mut stream =
            StreamSession::open(context(&dir, &broadcaster, Duration::from_millis(30)));
        next(&mut stream).await;

        for _ in 0..2 {
            let frame = next(&mut stream).await.unwrap();
            assert_eq!(frame.event_type(), ChangeEventType::Heartbeat);
        }
    }

    #[tokio::test]
    async fn snapshot_failure_is_reported_in_band() {
        let dir = TempDir::new().unwrap();
        let broadcaster = EventBroadcaster::new();
        let ctx = context(&dir, &broadcaster, DEFAULT_HEARTBEAT_INTERVAL);
        fs::remove_file(&ctx.documents.activity_log).unwrap();
        fs::create_dir(&ctx.documents.activity_log).unwrap();

        let mut stream = StreamSession::open(ctx);
        match next(&mut stream).await {
            Some(ChangeEvent::Activity { data, .. }) => {
                assert_eq!(data.entries[0].level, ActivityLevel::Error);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        wait_for_state(&stream.handle(), SessionState::Streaming).await;
    }

    #[tokio::test]
    async fn lagging_session_resyncs_with_snapshot() {
        let dir = TempDir::new().unwrap();
        let broadcaster = EventBroadcaster::with_capacity(2);
        let mut stream = StreamSession::open(context(&dir, &broadcaster, DEFAULT_HEARTBEAT_INTERVAL));
        next(&mut stream).await;

        // The session task cannot run between these sends, so it falls behind.
        for _ in 0..5 {
            broadcaster.broadcast(WatchEvent::TaskBoard(TaskBoardSnapshot::default()));
        }

        let resync = next(&mut stream).await.unwrap();
        assert_eq!(resync.event_type(), ChangeEventType::InitialState);
        let after = next(&mut stream).await.unwrap();
        assert_eq!(after.event_type(), ChangeEventType::PrdUpdate);
    }

    #[tokio::test]
    async fn disconnect_twice_tears_down_once() {
        let dir = TempDir::new().unwrap();
        let broadcaster = EventBroadcaster::new();
        let mut stream = StreamSession::open(context(&dir, &broadcaster, Duration::from_millis(20)));
        next(&mut stream).await;
        let handle = stream.handle();
        assert_eq!(broadcaster.subscriber_count(), 1);

        handle.disconnect();
        handle.disconnect();
        wait_for_state(&handle, SessionState::Closed).await;

        assert_eq!(handle.teardown_count(), 1);
        assert_eq!(broadcaster.subscriber_count(), 0);

        // Drain anything sent before the signal; then the stream ends.
        let drained = timeout(WAIT, async {
            while stream.next().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());

        broadcaster.broadcast(WatchEvent::TaskBoard(TaskBoardSnapshot::default()));
        assert!(stream.next().await.is_none());
        assert_eq!(handle.teardown_count(), 1);
    }

    #[tokio::test]
    async fn disconnect_unblocks_a_full_client() {
        let dir = TempDir::new().unwrap();
        let broadcaster = EventBroadcaster::new();
        let mut stream = StreamSession::open(context(&dir, &broadcaster, DEFAULT_HEARTBEAT_INTERVAL));
        let handle = stream.handle();
        wait_for_state(&handle, SessionState::Streaming).await;

        // One more change than the buffer holds leaves the session waiting.
        for _ in 0..FRAME_BUFFER {
            broadcaster.broadcast(WatchEvent::TaskBoard(TaskBoardSnapshot::default()));
        }
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), SessionState::Streaming);

        handle.disconnect();
        wait_for_state(&handle, SessionState::Closed).await;

        let mut delivered = 0;
        while next(&mut stream).await.is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, FRAME_BUFFER);
        assert_eq!(handle.teardown_count(), 1);
    }

    #[tokio::test]
    async fn dropping_the_stream_closes_the_session() {
        let dir = TempDir::new().unwrap();
        let broadcaster = EventBroadcaster::new();
        let mut stream = StreamSession::open(context(&dir, &broadcaster, DEFAULT_HEARTBEAT_INTERVAL));
        next(&mut stream).await;
        let handle = stream.handle();

        drop(stream);
        wait_for_state(&handle, SessionState::Closed).await;
        assert_eq!(handle.teardown_count(), 1);
    }
}
