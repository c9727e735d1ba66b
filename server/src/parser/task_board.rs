//! Task board parser.
//!
//! Only top-level checkbox lines are tasks; indented sub-items are notes on
//! their parent and are skipped.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{read_source, Result, Source};
use crate::types::{Task, TaskBoardSnapshot, TaskStatus};

static TASK_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[-*+]\s+\[(?P<glyph>[^\]]*)\](?P<optional>\*)?\s+(?P<text>.*?)\s*$")
        .expect("task line pattern is valid")
});

/// An id ends at the line end, at punctuation or whitespace, or at a `.`
/// that does not start another segment. `TaskStatusMutator` targets the
/// same ids.
static TASK_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<id>\d+(?:\.\d+)*)(?:$|\.$|\.[^\w]|[^\w.])\s*(?P<description>.*)$")
        .expect("task id pattern is valid")
});

static PRIORITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bP(?P<short>\d+)\b|\bpriority\s*[:=]?\s*(?P<long>\d+)\b")
        .expect("priority pattern is valid")
});

const ID_LIST: &str = r"(?P<list>#?\d+(?:\.\d+)*(?:\s*(?:,|&|\band\b)\s*#?\d+(?:\.\d+)*)*)";

static DEPENDS_ON: Lazy<Regex> = Lazy::new(|| dependency_pattern(r"depends\s+on"));
static REQUIRES: Lazy<Regex> = Lazy::new(|| dependency_pattern(r"requires"));
static BLOCKED_BY: Lazy<Regex> = Lazy::new(|| dependency_pattern(r"blocked\s+by"));

static LIST_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*(?:,|&|\band\b)\s*").expect("separator pattern is valid"));

fn dependency_pattern(phrase: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b{phrase}\s*:?\s*(?:tasks?\s+)?{ID_LIST}"))
        .expect("dependency pattern is valid")
}

/// Parses the task board at `path`.
///
/// A missing or unreadable file yields an empty board carrying a diagnostic.
///
/// # Errors
///
/// Returns [`super::ParseError::Io`] for any other read failure.
pub fn parse_file(path: &Path) -> Result<TaskBoardSnapshot> {
    Ok(match read_source(path)? {
        Source::Text(text) => parse(&text),
        Source::Degraded(diagnostic) => TaskBoardSnapshot::degraded(diagnostic),
    })
}

/// Parses task board text into tasks and aggregate counts.
#[must_use]
pub fn parse(text: &str) -> TaskBoardSnapshot {
    let tasks: Vec<Task> = text
        .lines()
        .enumerate()
        .filter_map(|(index, line)| parse_task_line(line, index + 1))
        .collect();

    let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
    let completed_tasks = count(TaskStatus::Completed);
    let in_progress_tasks = count(TaskStatus::InProgress);
    let queued_tasks = count(TaskStatus::Queued);
    let not_started_tasks = count(TaskStatus::NotStarted);
    let total_tasks = tasks.len();

    TaskBoardSnapshot {
        completion_percentage: completion_percentage(completed_tasks, total_tasks),
        tasks,
        total_tasks,
        completed_tasks,
        in_progress_tasks,
        queued_tasks,
        not_started_tasks,
        diagnostic: None,
    }
}

/// `round(completed / total * 100)`, or 0 for an empty board.
#[must_use]
pub fn completion_percentage(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (completed as f64 / total as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

fn parse_task_line(line: &str, line_number: usize) -> Option<Task> {
    let caps = TASK_LINE.captures(line)?;
    let glyph = caps.name("glyph").map_or("", |m| m.as_str());
    let text = caps.name("text").map_or("", |m| m.as_str());

    let (id, description) = match TASK_ID.captures(text) {
        Some(id_caps) => (
            id_caps["id"].to_string(),
            id_caps["description"].trim().to_string(),
        ),
        None => (format!("line-{line_number}"), text.to_string()),
    };

    Some(Task {
        id,
        status: TaskStatus::from_glyph(glyph),
        dependencies: dependencies(&description),
        priority: priority(&description),
        optional: caps.name("optional").is_some(),
        line: line_number,
        description,
    })
}

fn priority(text: &str) -> u32 {
    PRIORITY
        .captures(text)
        .and_then(|caps| caps.name("short").or_else(|| caps.name("long")))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Dependency ids from all three phrasings, de-duplicated in first-seen order.
fn dependencies(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();

    for pattern in [&*DEPENDS_ON, &*REQUIRES, &*BLOCKED_BY] {
        for caps in pattern.captures_iter(text) {
            let Some(list) = caps.name("list") else {
                continue;
            };
            for id in LIST_SEPARATOR.split(list.as_str()) {
                let id = id.trim().trim_start_matches('#');
                if !id.is_empty() && !found.iter().any(|seen| seen == id) {
                    found.push(id.to_string());
                }
            }
        }
    }

    found
}
