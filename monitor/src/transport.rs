//! Change stream transport for the Specline Monitor.
//!
//! The client side of `GET /stream`: a [`Connector`] opens a connection and
//! yields decoded [`ChangeEvent`]s until the connection fails or closes. The
//! production [`SseConnector`] reads Server-Sent Event frames off a streaming
//! `reqwest` response; tests substitute scripted connectors.
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use specline_monitor::transport::{Connector, SseConnector};
//!
//! #[tokio::main]
//! async fn main() {
//!     let connector = SseConnector::new("http://localhost:8080").unwrap();
//!     let mut frames = connector.connect().await.unwrap();
//!     while let Some(frame) = frames.next().await {
//!         println!("{frame:?}");
//!     }
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use specline_server::types::ChangeEvent;

/// Time allowed for the TCP connection to be established.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that end a stream connection.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The request could not be sent.
    #[error("failed to connect: {0}")]
    Connect(#[source] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server responded with status {0}")]
    Status(u16),

    /// The response body failed mid-stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// A frame did not hold a valid envelope.
    #[error("invalid frame: {0}")]
    Decode(#[from] serde_json::Error),

    /// The server ended the stream.
    #[error("stream closed by server")]
    Closed,
}

/// Decoded frames of one connection, ending after the first error.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent, TransportError>> + Send>>;

/// Opens change stream connections.
pub trait Connector: Send + Sync + 'static {
    /// Opens a new connection.
    fn connect(&self) -> impl Future<Output = Result<FrameStream, TransportError>> + Send;
}

/// Connects to a Specline server over Server-Sent Events.
#[derive(Debug, Clone)]
pub struct SseConnector {
    client: Client,
    url: String,
}

impl SseConnector {
    /// Creates a connector for the server at `server_url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the HTTP client cannot be built.
    pub fn new(server_url: &str) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(TransportError::Connect)?;

        Ok(Self {
            client,
            url: format!("{}/stream", server_url.trim_end_matches('/')),
        })
    }

    /// The stream endpoint this connector targets.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for SseConnector {
    async fn connect(&self) -> Result<FrameStream, TransportError> {
        let response = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(TransportError::Connect)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        debug!(url = %self.url, "Change stream connected");

        Ok(decode_frames(response.bytes_stream()))
    }
}

/// Decodes Server-Sent Event frames from a response body.
///
/// Every frame's `data` must hold a [`ChangeEvent`] envelope. The stream
/// yields [`TransportError::Closed`] when the body ends and stops after the
/// first error.
pub fn decode_frames<S, B, E>(body: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let frames = body
        .eventsource()
        .map(|item| match item {
            Ok(event) => serde_json::from_str::<ChangeEvent>(&event.data).map_err(TransportError::from),
            Err(e) => Err(TransportError::Stream(e.to_string())),
        })
        .chain(stream::once(future::ready(Err(TransportError::Closed))))
        .scan(false, |failed, frame| {
            if *failed {
                return future::ready(None);
            }
            *failed = frame.is_err();
            future::ready(Some(frame))
        });

    Box::pin(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use specline_server::types::ChangeEventType;

    const HEARTBEAT: &str = r#"{"type":"heartbeat","timestamp":"2025-01-15T10:30:30Z"}"#;

    fn body(chunks: &[&[u8]]) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> =
            chunks.iter().map(|chunk| Ok(chunk.to_vec())).collect();
        stream::iter(chunks)
    }

    async fn collect(frames: FrameStream) -> Vec<Result<ChangeEvent, TransportError>> {
        frames.collect().await
    }

    #[tokio::test]
    async fn decodes_frame_then_reports_close() {
        let frame = format!("data: {HEARTBEAT}\n\n");
        let frames = collect(decode_frames(body(&[frame.as_bytes()]))).await;

        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Ok(ChangeEvent::Heartbeat { .. })));
        assert!(matches!(frames[1], Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn reassembles_frames_split_across_chunks() {
        let frame = format!("data: {HEARTBEAT}\r\n\r\n");
        let (head, tail) = frame.as_bytes().split_at(9);
        let frames = collect(decode_frames(body(&[&b": keep-alive\n\n"[..], head, tail]))).await;

        let first = frames[0].as_ref().unwrap();
        assert_eq!(first.event_type(), ChangeEventType::Heartbeat);
        assert!(matches!(frames[1], Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn ignores_other_fields() {
        let frame = format!("event: update\nid: 7\nretry: 100\ndata: {HEARTBEAT}\n\n");
        let frames = collect(decode_frames(body(&[frame.as_bytes()]))).await;

        assert!(matches!(frames[0], Ok(ChangeEvent::Heartbeat { .. })));
    }

    #[tokio::test]
    async fn body_failure_ends_the_stream() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![Err(std::io::Error::other("reset"))];
        let frames = collect(decode_frames(stream::iter(chunks))).await;

        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Err(TransportError::Stream(message)) if message.contains("reset")));
    }

    #[test]
    fn connector_targets_stream_endpoint() {
        let connector = SseConnector::new("http://localhost:8080/").unwrap();
        assert_eq!(connector.url(), "http://localhost:8080/stream");
    }
}
