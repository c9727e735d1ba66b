//! Specline Monitor - live task board client and orchestrator CLI.
//!
//! This binary connects to a Specline server's change stream and mirrors the
//! task board and activity log in the terminal. It also fronts the document
//! store for orchestrators that update task status from scripts.
//!
//! # Commands
//!
//! - `specline-monitor watch`: Follow the change stream, reconnecting on failure
//! - `specline-monitor set-status`: Update one task's checkbox with a backup
//! - `specline-monitor backups list`: Show the backups kept for the task board
//! - `specline-monitor backups restore`: Restore the task board from a backup
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use specline_monitor::config::Config;
use specline_monitor::error::Result;
use specline_monitor::sync::{ClientState, ClientSync, ConnectionStatus};
use specline_monitor::transport::SseConnector;
use specline_server::store::{default_backup_dir, BackupConfig, BackupManager, DEFAULT_MAX_BACKUPS};
use specline_server::tasks::TaskStatusMutator;
use specline_server::types::{ActivityLevel, TaskBoardSnapshot, TaskStatus};

/// Specline Monitor - live task board client.
///
/// Follows a Specline server's change stream and updates task status on
/// behalf of orchestrators.
#[derive(Parser, Debug)]
#[command(name = "specline-monitor")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    SPECLINE_SERVER_URL         Server URL (required for 'watch')
    SPECLINE_RECONNECT_BASE_MS  First reconnect delay (default: 1000)
    SPECLINE_RECONNECT_MAX_MS   Reconnect delay ceiling (default: 30000)
    SPECLINE_TASK_BOARD         Task board document for 'set-status' and 'backups'
    SPECLINE_BACKUP_DIR         Backup directory (default: <board dir>/.backups)
    SPECLINE_MAX_BACKUPS        Backups kept per document (default: 10)

EXAMPLES:
    # Follow the live board
    export SPECLINE_SERVER_URL=http://localhost:8080
    specline-monitor watch

    # Mark task 2.1 as done
    specline-monitor set-status 2.1 completed --board docs/tasks.md

    # Roll the board back
    specline-monitor backups list --board docs/tasks.md
    specline-monitor backups restore docs/.backups/tasks.md.backup.<stamp>.md --board docs/tasks.md
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Location of the task board and its backups.
#[derive(clap::Args, Debug)]
struct BoardArgs {
    /// Task board document.
    #[arg(long, env = "SPECLINE_TASK_BOARD")]
    board: PathBuf,

    /// Directory holding backups (default: <board dir>/.backups).
    #[arg(long, env = "SPECLINE_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Number of backups kept per document.
    #[arg(long, env = "SPECLINE_MAX_BACKUPS", default_value_t = DEFAULT_MAX_BACKUPS)]
    max_backups: usize,
}

impl BoardArgs {
    fn backups(&self) -> BackupManager {
        let dir = self
            .backup_dir
            .clone()
            .unwrap_or_else(|| default_backup_dir(&self.board));
        BackupManager::new(BackupConfig::new(dir).with_max_backups(self.max_backups))
    }
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the change stream.
    ///
    /// Prints status changes, task board progress and new activity until
    /// interrupted. Requires SPECLINE_SERVER_URL or --url.
    Watch {
        /// Server URL, overriding SPECLINE_SERVER_URL.
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Set the status of one task.
    ///
    /// STATUS is one of not_started, queued, in_progress or completed.
    SetStatus {
        /// Task ID as written on the board (e.g. 2.1).
        task_id: String,

        /// New status.
        status: TaskStatus,

        #[command(flatten)]
        board: BoardArgs,
    },

    /// Inspect or restore task board backups.
    Backups {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Subcommand, Debug)]
enum BackupAction {
    /// List backups, newest first.
    List {
        #[command(flatten)]
        board: BoardArgs,
    },

    /// Replace the task board with a backup.
    Restore {
        /// Backup file to restore.
        backup: PathBuf,

        #[command(flatten)]
        board: BoardArgs,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Command::Watch { url } => {
            let runtime = build_runtime().context("Failed to create tokio runtime")?;

            runtime
                .block_on(run_watch(url))
                .context("Failed to follow the change stream")
        }
        Command::SetStatus {
            task_id,
            status,
            board,
        } => run_set_status(&task_id, status, &board)
            .with_context(|| format!("Failed to set task {task_id} to {status}")),
        Command::Backups { action } => match action {
            BackupAction::List { board } => {
                run_list_backups(&board).context("Failed to list backups")
            }
            BackupAction::Restore { backup, board } => run_restore(&backup, &board)
                .with_context(|| format!("Failed to restore {}", backup.display())),
        },
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

/// Follows the change stream until interrupted.
async fn run_watch(url: Option<String>) -> Result<()> {
    let config = Config::from_env_with_url(url)?;
    let connector = SseConnector::new(&config.server_url)?;

    info!(server_url = %config.server_url, "Starting Specline Monitor");

    let sync = ClientSync::spawn(connector, config.backoff);
    let mut updates = sync.subscribe();
    let mut printer = Printer::default();

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    warn!("Client sync stopped unexpectedly");
                    break;
                }
                let state = updates.borrow_and_update().clone();
                printer.render(&state);
            }
        }
    }

    sync.teardown();
    Ok(())
}

/// Updates one task's checkbox.
fn run_set_status(task_id: &str, status: TaskStatus, board: &BoardArgs) -> Result<()> {
    let mutator = TaskStatusMutator::new(board.backups());
    let update = mutator.update_task_status(&board.board, task_id, status)?;

    println!(
        "Task {}: {} -> {} (line {})",
        update.task_id, update.previous_token, update.new_token, update.line
    );
    if let Some(backup) = update.backup {
        println!("Backup: {}", backup.display());
    }
    Ok(())
}

fn run_list_backups(board: &BoardArgs) -> Result<()> {
    let backups = board.backups().list_backups(&board.board)?;

    if backups.is_empty() {
        println!("No backups for {}", board.board.display());
        return Ok(());
    }
    for backup in backups {
        println!("{}  {}", backup.timestamp, backup.path.display());
    }
    Ok(())
}

fn run_restore(backup: &Path, board: &BoardArgs) -> Result<()> {
    board.backups().restore_from_backup(backup, &board.board)?;

    println!("Restored {} from {}", board.board.display(), backup.display());
    Ok(())
}

/// Prints what changed between successive client states.
#[derive(Debug, Default)]
struct Printer {
    status: Option<ConnectionStatus>,
    board: Option<(usize, usize, u8)>,
    last_activity: Option<String>,
}

impl Printer {
    fn render(&mut self, state: &ClientState) {
        if self.status != Some(state.status) {
            self.status = Some(state.status);
            match (state.status, state.next_retry_in) {
                (ConnectionStatus::Reconnecting, Some(delay)) => println!(
                    "* reconnecting in {:.1}s (attempt {})",
                    delay.as_secs_f64(),
                    state.reconnect_attempts
                ),
                (status, _) => println!("* {status}"),
            }
        }

        if let Some(board) = &state.task_board {
            let summary = (board.completed_tasks, board.total_tasks, board.completion_percentage);
            if self.board != Some(summary) {
                self.board = Some(summary);
                print_board(board);
            }
        }

        let start = self
            .last_activity
            .as_ref()
            .and_then(|id| state.activities.iter().position(|e| &e.id == id))
            .map_or(0, |index| index + 1);
        for entry in state.activities.iter().skip(start) {
            let marker = match entry.level {
                ActivityLevel::Info => "   ",
                ActivityLevel::Success => " ok",
                ActivityLevel::Error => "err",
                ActivityLevel::Correction => "fix",
            };
            println!(
                "[{marker}] {} {}",
                entry.timestamp.format("%Y-%m-%d %H:%M"),
                entry.message
            );
        }
        if let Some(last) = state.activities.back() {
            self.last_activity = Some(last.id.clone());
        }
    }
}

fn print_board(board: &TaskBoardSnapshot) {
    if let Some(diagnostic) = &board.diagnostic {
        println!("Task board unavailable: {}", diagnostic.message);
        return;
    }
    println!(
        "Task board: {}/{} completed ({}%), {} in progress, {} queued",
        board.completed_tasks,
        board.total_tasks,
        board.completion_percentage,
        board.in_progress_tasks,
        board.queued_tasks
    );
    for task in &board.tasks {
        let optional = if task.optional { " (optional)" } else { "" };
        println!("  {} {} {}{optional}", task.status.checkbox(), task.id, task.description);
    }
}

/// Initializes the logging subsystem.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
