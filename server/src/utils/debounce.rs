//! Debounce utility for coalescing bursts of change notifications.
//!
//! An atomic document write produces several file system events in quick
//! succession (temp file create, write, rename). The watcher only needs to
//! re-parse once per burst, so notifications are funnelled through a
//! [`Debouncer`] keyed by document role.
//!
//! # Architecture
//!
//! A background task keeps one deadline per pending key. Each new
//! notification for a key pushes its deadline back by the debounce interval;
//! once a key has been quiet for the full interval it is emitted on the
//! output channel. When every [`Debouncer`] handle is dropped the task
//! flushes whatever is still pending and exits.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use specline_server::utils::debounce::Debouncer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (output_tx, mut output_rx) = mpsc::channel(16);
//!     let debouncer = Debouncer::new(Duration::from_millis(100), output_tx);
//!
//!     debouncer.notify("tasks.md");
//!     debouncer.notify("tasks.md");
//!     debouncer.notify("tasks.md");
//!
//!     // One emission for the whole burst.
//!     assert_eq!(output_rx.recv().await, Some("tasks.md"));
//! }
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default debounce interval in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

const INPUT_CAPACITY: usize = 256;

/// Coalesces rapid notifications per key.
///
/// Cloning yields another handle onto the same background task, so a handle
/// can be moved into a synchronous callback.
#[derive(Debug, Clone)]
pub struct Debouncer<K> {
    input_tx: mpsc::Sender<K>,
}

impl<K> Debouncer<K>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    /// Spawns the debounce task. Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(interval: Duration, output_tx: mpsc::Sender<K>) -> Self {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        tokio::spawn(run_debounce_loop(interval, input_rx, output_tx));
        Self { input_tx }
    }

    /// Records a notification for `key` without waiting.
    ///
    /// Returns `false` if the input queue is full or the task has stopped.
    /// Dropping a notification is harmless while another one for the same
    /// key is already pending.
    pub fn notify(&self, key: K) -> bool {
        match self.input_tx.try_send(key) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Dropped change notification");
                false
            }
        }
    }
}

async fn run_debounce_loop<K>(
    interval: Duration,
    mut input_rx: mpsc::Receiver<K>,
    output_tx: mpsc::Sender<K>,
) where
    K: Clone + Eq + Hash + Debug,
{
    let mut pending: HashMap<K, Instant> = HashMap::new();
    debug!(interval_ms = interval.as_millis(), "Starting debounce loop");

    loop {
        let next_deadline = pending.values().min().copied();

        tokio::select! {
            received = input_rx.recv() => match received {
                Some(key) => {
                    trace!(key = ?key, "Deferring notification");
                    pending.insert(key, Instant::now() + interval);
                }
                None => {
                    for key in pending.drain().map(|(key, _)| key) {
                        emit(&output_tx, key).await;
                    }
                    break;
                }
            },
            () = sleep_until_next(next_deadline) => {
                let now = Instant::now();
                let due: Vec<K> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in due {
                    pending.remove(&key);
                    emit(&output_tx, key).await;
                }
            }
        }
    }

    debug!("Debounce loop terminated");
}

async fn sleep_until_next(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn emit<K: Debug>(output_tx: &mpsc::Sender<K>, key: K) {
    trace!(key = ?key, "Emitting debounced notification");
    if let Err(e) = output_tx.send(key).await {
        debug!(key = ?e.0, "Debounce output closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    fn test_debouncer(interval_ms: u64) -> (Debouncer<&'static str>, mpsc::Receiver<&'static str>) {
        let (tx, rx) = mpsc::channel(16);
        (Debouncer::new(Duration::from_millis(interval_ms), tx), rx)
    }

    #[tokio::test]
    async fn burst_is_coalesced() {
        let (debouncer, mut rx) = test_debouncer(50);

        for _ in 0..20 {
            assert!(debouncer.notify("board"));
        }

        let first = timeout(Duration::from_millis(500), rx.recv()).await.unwrap();
        assert_eq!(first, Some("board"));

        let more = timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(more.is_err(), "burst should emit once");
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (debouncer, mut rx) = test_debouncer(30);

        debouncer.notify("board");
        debouncer.notify("log");

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(timeout(Duration::from_millis(500), rx.recv()).await.unwrap().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec!["board", "log"]);
    }

    #[tokio::test]
    async fn new_notification_resets_timer() {
        let (debouncer, mut rx) = test_debouncer(100);

        debouncer.notify("board");
        sleep(Duration::from_millis(60)).await;
        debouncer.notify("board");

        let early = timeout(Duration::from_millis(60), rx.recv()).await;
        assert!(early.is_err(), "deadline should have been pushed back");

        let late = timeout(Duration::from_millis(300), rx.recv()).await.unwrap();
        assert_eq!(late, Some("board"));
    }

    #[tokio::test]
    async fn pending_keys_flush_when_handles_drop() {
        let (tx, mut rx) = mpsc::channel(4);
        let debouncer = Debouncer::new(Duration::from_secs(10), tx);
        let clone = debouncer.clone();

        debouncer.notify("log");
        drop(debouncer);
        drop(clone);

        let flushed = timeout(Duration::from_millis(500), rx.recv()).await.unwrap();
        assert_eq!(flushed, Some("log"));
        let closed = timeout(Duration::from_millis(500), rx.recv()).await.unwrap();
        assert_eq!(closed, None);
    }

    #[tokio::test]
    async fn separated_bursts_emit_separately() {
        let (debouncer, mut rx) = test_debouncer(30);

        debouncer.notify("board");
        let first = timeout(Duration::from_millis(500), rx.recv()).await.unwrap();
        debouncer.notify("board");
        let second = timeout(Duration::from_millis(500), rx.recv()).await.unwrap();

        assert_eq!(first, Some("board"));
        assert_eq!(second, Some("board"));
    }
}
