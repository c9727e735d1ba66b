//! Specline Server - Main entry point.
//!
//! This binary starts the Specline change stream server with:
//! - Structured JSON logging for production
//! - A document watcher feeding every stream session
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`specline_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! SPECLINE_TASK_BOARD=docs/tasks.md \
//! SPECLINE_ACTIVITY_LOG=docs/activity.md \
//! PORT=8080 \
//! cargo run --release --bin specline-server
//! ```

use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use specline_server::broadcast::EventBroadcaster;
use specline_server::config::Config;
use specline_server::error::{ConfigError, Result, ServerError};
use specline_server::routes::{create_router, AppState};
use specline_server::watcher::DocumentWatcher;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    match run().await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(ServerError::Config(err)) => {
            error!(error = %err, "Failed to load configuration");
            print_config_help(&err);
            ExitCode::from(1)
        }
        Err(err) => {
            error!(error = %err, "Server error");
            ExitCode::from(1)
        }
    }
}

fn print_config_help(err: &ConfigError) {
    eprintln!("Error: {err}");
    eprintln!();
    eprintln!("Required environment variables:");
    eprintln!("  SPECLINE_TASK_BOARD      - Path of the task board document");
    eprintln!("  SPECLINE_ACTIVITY_LOG    - Path of the activity log document");
    eprintln!();
    eprintln!("Optional environment variables:");
    eprintln!("  SPECLINE_HEARTBEAT_SECS  - Stream heartbeat interval (default: 30)");
    eprintln!("  SPECLINE_DEBOUNCE_MS     - File change debounce (default: 100)");
    eprintln!("  PORT                     - HTTP server port (default: 8080)");
    eprintln!("  RUST_LOG                 - Log level filter (default: info)");
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    info!(
        port = config.port,
        task_board = %config.documents.task_board.display(),
        activity_log = %config.documents.activity_log.display(),
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        "Specline server starting"
    );

    let broadcaster = EventBroadcaster::new();
    let watcher = DocumentWatcher::start(
        config.documents.clone(),
        broadcaster.clone(),
        config.debounce,
    );
    for diagnostic in watcher.diagnostics() {
        info!(?diagnostic, "Starting in degraded mode");
    }

    let address = format!("0.0.0.0:{}", config.port);
    let app = create_router(AppState::with_broadcaster(config, broadcaster));

    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| ServerError::Bind {
            address: address.clone(),
            source,
        })?;
    info!(address = %address, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::Serve)?;

    info!("Server shutting down gracefully");
    watcher.close();
    Ok(())
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
