//! HTTP route handlers for the Specline server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /stream` - Server-Sent Events change stream for dashboards
//! - `GET /snapshot` - Current state of both documents as one JSON envelope
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration (document paths, heartbeat interval)
//! - Event broadcaster fed by the document watcher
//! - Server start time for uptime reporting
//!
//! Each `/stream` request opens its own [`StreamSession`]. Every SSE frame is
//! a single `data:` line holding one [`ChangeEvent`] envelope. When the client
//! disconnects axum drops the response body, which disconnects the session.
//!
//! # Example
//!
//! ```rust,no_run
//! use specline_server::config::Config;
//! use specline_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let app = create_router(AppState::new(config));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::broadcast::EventBroadcaster;
use crate::config::Config;
use crate::stream::{build_snapshot, SessionContext, StreamSession};
use crate::types::ChangeEvent;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub broadcaster: EventBroadcaster,
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_broadcaster(config, EventBroadcaster::new())
    }

    /// Uses an existing broadcaster, typically the one the watcher publishes to.
    #[must_use]
    pub fn with_broadcaster(config: Config, broadcaster: EventBroadcaster) -> Self {
        Self {
            config: Arc::new(config),
            broadcaster,
            start_time: Instant::now(),
        }
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            documents: self.config.documents.clone(),
            broadcaster: self.broadcaster.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("documents", &self.config.documents)
            .field("broadcaster", &self.broadcaster)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/stream", get(get_stream))
        .route("/snapshot", get(get_snapshot))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Error Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

// ============================================================================
// GET /stream
// ============================================================================

async fn get_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, axum::Error>>> {
    let session = StreamSession::open(state.session_context());
    debug!(connection_id = %session.handle().connection_id(), "Serving change stream");

    Sse::new(session.map(|event| to_sse_event(&event)))
}

/// Encodes one envelope as a single-`data:` SSE frame.
fn to_sse_event(event: &ChangeEvent) -> Result<SseEvent, axum::Error> {
    SseEvent::default().json_data(event)
}

// ============================================================================
// GET /snapshot
// ============================================================================

async fn get_snapshot(State(state): State<AppState>) -> Response {
    match build_snapshot(&state.config.documents) {
        Ok(snapshot) => Json(ChangeEvent::initial_state(snapshot)).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to build snapshot");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new(format!("failed to build snapshot: {e}"))),
            )
                .into_response()
        }
    }
}

// ============================================================================
// GET /health
// ============================================================================

/// Response body for the health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Open stream sessions.
    pub connections: usize,
    pub uptime_seconds: u64,
}

async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.broadcaster.subscriber_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DocumentPaths;
    use crate::types::ChangeEventType;
    use axum::body::Body;
    use axum::http::{header, Request};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_config(dir: &TempDir) -> Config {
        let documents =
            DocumentPaths::new(dir.path().join("activity.md"), dir.path().join("tasks.md"));
        fs::write(&documents.task_board, "- [x] 1. Done\n- [ ] 2. Pending\n").unwrap();
        Config {
            documents,
            port: 0,
            heartbeat_interval: Duration::from_secs(30),
            debounce: Duration::from_millis(10),
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok_status() {
        let dir = TempDir::new().unwrap();
        let app = create_router(AppState::new(test_config(&dir)));

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.connections, 0);
    }

    #[tokio::test]
    async fn snapshot_returns_initial_state_envelope() {
        let dir = TempDir::new().unwrap();
        let app = create_router(AppState::new(test_config(&dir)));

        let response = app.oneshot(get("/snapshot")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["type"], "initial_state");
        assert_eq!(json["data"]["taskBoard"]["totalTasks"], 2);
        assert_eq!(json["data"]["taskBoard"]["completionPercentage"], 50);
        // The activity log does not exist; the feed is empty but explained.
        assert_eq!(json["data"]["activity"]["diagnostic"]["kind"], "file_not_found");
    }

    #[tokio::test]
    async fn snapshot_failure_is_service_unavailable() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        fs::create_dir(&config.documents.activity_log).unwrap();
        let app = create_router(AppState::new(config));

        let response = app.oneshot(get("/snapshot")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn stream_starts_with_initial_state_frame() {
        let dir = TempDir::new().unwrap();
        let app = create_router(AppState::new(test_config(&dir)));

        let response = app.oneshot(get("/stream")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let mut body = response.into_body().into_data_stream();
        let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();

        let data = text
            .lines()
            .find_map(|line| line.strip_prefix("data:"))
            .expect("data line");
        let event: ChangeEvent = serde_json::from_str(data.trim()).unwrap();
        assert_eq!(event.event_type(), ChangeEventType::InitialState);
    }

    #[tokio::test]
    async fn health_counts_open_streams() {
        let dir = TempDir::new().unwrap();
        let state = AppState::new(test_config(&dir));
        let app = create_router(state.clone());

        let response = app.clone().oneshot(get("/stream")).await.unwrap();
        let body = app.oneshot(get("/health")).await.unwrap().into_body();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let health: HealthResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(health.connections, 1);

        drop(response);
        tokio::time::timeout(Duration::from_secs(2), async {
            while state.broadcaster.subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session released its subscription");
    }
}
