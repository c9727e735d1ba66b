//! Shared document and wire types for the Specline server.
//!
//! This module defines the records produced by the document parsers and the
//! [`ChangeEvent`] envelope pushed to stream clients. Every record is rebuilt
//! from disk on demand; nothing here is persisted independently of the
//! documents themselves.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical role of a watched document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentRole {
    /// The append-mostly activity log.
    ActivityLog,
    /// The checkbox task board.
    TaskBoard,
}

impl DocumentRole {
    /// Every role, in watch registration order.
    pub const ALL: [DocumentRole; 2] = [DocumentRole::ActivityLog, DocumentRole::TaskBoard];
}

impl fmt::Display for DocumentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActivityLog => write!(f, "activity log"),
            Self::TaskBoard => write!(f, "task board"),
        }
    }
}

/// Lifecycle state of a task, encoded by a single checkbox glyph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    Queued,
    InProgress,
    Completed,
}

impl TaskStatus {
    /// Returns the checkbox token written for this status.
    #[must_use]
    pub fn checkbox(self) -> &'static str {
        match self {
            Self::NotStarted => "[ ]",
            Self::Queued => "[~]",
            Self::InProgress => "[>]",
            Self::Completed => "[x]",
        }
    }

    /// Maps the contents between the checkbox brackets to a status.
    ///
    /// Unknown glyphs read as [`TaskStatus::NotStarted`].
    #[must_use]
    pub fn from_glyph(glyph: &str) -> Self {
        match glyph.trim() {
            "~" => Self::Queued,
            ">" => Self::InProgress,
            "x" | "X" => Self::Completed,
            _ => Self::NotStarted,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "not_started" | "todo" | "pending" => Ok(Self::NotStarted),
            "queued" => Ok(Self::Queued),
            "in_progress" | "started" => Ok(Self::InProgress),
            "completed" | "done" => Ok(Self::Completed),
            other => Err(format!(
                "unknown task status '{other}' (expected not_started, queued, in_progress or completed)"
            )),
        }
    }
}

/// A single top-level task parsed from the task board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub dependencies: Vec<String>,
    pub priority: u32,
    /// Set when the checkbox token is followed by `*`.
    pub optional: bool,
    /// 1-based line number in the source document.
    pub line: usize,
}

/// Severity of an activity entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Info,
    Success,
    Error,
    Correction,
}

/// One dated block of the activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub level: ActivityLevel,
}

impl ActivityEntry {
    /// Builds an error entry that does not originate from the log itself.
    ///
    /// Used to report degraded snapshots in-band.
    #[must_use]
    pub fn synthetic_error(message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            message: message.into(),
            status: None,
            level: ActivityLevel::Error,
        }
    }
}

/// Why a parse result is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    FileNotFound,
    PermissionDenied,
}

/// Explanation attached to a degraded (empty) parse result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub path: String,
    pub message: String,
}

/// The display window of the activity log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityFeed {
    /// Most recent entries, oldest first.
    pub entries: Vec<ActivityEntry>,
    /// Number of entries retained before the display cut.
    pub total_entries: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

impl ActivityFeed {
    /// An empty feed explaining why nothing could be read.
    #[must_use]
    pub fn degraded(diagnostic: Diagnostic) -> Self {
        Self {
            diagnostic: Some(diagnostic),
            ..Self::default()
        }
    }

    /// Level of the newest entry, if any.
    #[must_use]
    pub fn latest_level(&self) -> Option<ActivityLevel> {
        self.entries.last().map(|entry| entry.level)
    }
}

/// Aggregated view of the task board.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBoardSnapshot {
    pub tasks: Vec<Task>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub in_progress_tasks: usize,
    pub queued_tasks: usize,
    pub not_started_tasks: usize,
    pub completion_percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

impl TaskBoardSnapshot {
    /// An empty board explaining why nothing could be read.
    #[must_use]
    pub fn degraded(diagnostic: Diagnostic) -> Self {
        Self {
            diagnostic: Some(diagnostic),
            ..Self::default()
        }
    }
}

/// Full state sent when a stream opens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub activity: ActivityFeed,
    pub task_board: TaskBoardSnapshot,
}

/// Discriminant of a [`ChangeEvent`], handy for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventType {
    InitialState,
    Activity,
    PrdUpdate,
    Correction,
    Heartbeat,
}

/// Envelope pushed to stream clients.
///
/// Serialized as `{"type": ..., "timestamp": ..., "data": ...}`; heartbeats
/// carry no `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    InitialState {
        timestamp: DateTime<Utc>,
        data: StateSnapshot,
    },
    Activity {
        timestamp: DateTime<Utc>,
        data: ActivityFeed,
    },
    PrdUpdate {
        timestamp: DateTime<Utc>,
        data: TaskBoardSnapshot,
    },
    Correction {
        timestamp: DateTime<Utc>,
        data: ActivityFeed,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl ChangeEvent {
    #[must_use]
    pub fn initial_state(data: StateSnapshot) -> Self {
        Self::InitialState {
            timestamp: Utc::now(),
            data,
        }
    }

    #[must_use]
    pub fn activity(data: ActivityFeed) -> Self {
        Self::Activity {
            timestamp: Utc::now(),
            data,
        }
    }

    #[must_use]
    pub fn prd_update(data: TaskBoardSnapshot) -> Self {
        Self::PrdUpdate {
            timestamp: Utc::now(),
            data,
        }
    }

    #[must_use]
    pub fn correction(data: ActivityFeed) -> Self {
        Self::Correction {
            timestamp: Utc::now(),
            data,
        }
    }

    #[must_use]
    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    /// An `Activity` event carrying one synthetic error entry.
    #[must_use]
    pub fn stream_error(message: impl Into<String>) -> Self {
        let entry = ActivityEntry::synthetic_error(message);
        Self::activity(ActivityFeed {
            entries: vec![entry],
            total_entries: 1,
            diagnostic: None,
        })
    }

    #[must_use]
    pub fn event_type(&self) -> ChangeEventType {
        match self {
            Self::InitialState { .. } => ChangeEventType::InitialState,
            Self::Activity { .. } => ChangeEventType::Activity,
            Self::PrdUpdate { .. } => ChangeEventType::PrdUpdate,
            Self::Correction { .. } => ChangeEventType::Correction,
            Self::Heartbeat { .. } => ChangeEventType::Heartbeat,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::InitialState { timestamp, .. }
            | Self::Activity { timestamp, .. }
            | Self::PrdUpdate { timestamp, .. }
            | Self::Correction { timestamp, .. }
            | Self::Heartbeat { timestamp } => *timestamp,
        }
    }
}
