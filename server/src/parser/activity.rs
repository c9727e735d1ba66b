//! Activity log parser.
//!
//! The activity log is a markdown document where each entry starts with a
//! heading carrying an ISO-8601 date, for example:
//!
//! ```text
//! ## 2025-01-15 10:30 - Task 2.1 started
//! **Status**: In Progress
//!
//! Parsing headings and body.
//!
//! ---
//! ```
//!
//! A block runs until the next heading or horizontal rule. Headings without a
//! date end the previous block and start nothing.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use super::{read_source, Result, Source};
use crate::types::{ActivityEntry, ActivityFeed, ActivityLevel};

/// Upper bound on entries retained from one parse.
pub const MAX_ENTRIES: usize = 100;

/// Number of entries returned for display.
pub const DISPLAY_ENTRIES: usize = 10;

/// Namespace for activity entry ids.
const ACTIVITY_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5b, 0x0e, 0x8f, 0x2a, 0x41, 0x7c, 0x4d, 0x93, 0x9a, 0x1f, 0x6e, 0x24, 0xc8, 0x73, 0xd1, 0x05,
]);

static HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#{1,6}\s+(?P<title>.*?)\s*#*\s*$").expect("heading pattern is valid"));

static RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:-{3,}|\*{3,}|_{3,})\s*$").expect("rule pattern is valid"));

static DATE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\d{4}-\d{2}-\d{2}(?:[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?)?(?:Z|[+-]\d{2}:?\d{2})?",
    )
    .expect("date pattern is valid")
});

static STATUS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*]\s+)?\*{0,2}status\*{0,2}\s*:\s*\*{0,2}\s*(?P<status>.+?)\s*\**\s*$")
        .expect("status pattern is valid")
});

static CORRECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:correct(?:ion|ions|ive|ed)|self[- ]?heal\w*|auto[- ]?fix\w*|auto[- ]?correct\w*)\b")
        .expect("correction pattern is valid")
});

static ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:errors?|fail(?:s|ed|ure|ures|ing)?|exception|panic(?:ked)?|crash(?:ed)?)\b|❌")
        .expect("error pattern is valid")
});

static SUCCESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:complete[ds]?|completion|success(?:ful|fully)?|succeeded|done|passed|finished)\b|✅")
        .expect("success pattern is valid")
});

/// Parses the activity log at `path`.
///
/// A missing or unreadable file yields an empty feed carrying a diagnostic.
///
/// # Errors
///
/// Returns [`super::ParseError::Io`] for any other read failure.
pub fn parse_file(path: &Path) -> Result<ActivityFeed> {
    Ok(match read_source(path)? {
        Source::Text(text) => parse(&text),
        Source::Degraded(diagnostic) => ActivityFeed::degraded(diagnostic),
    })
}

/// Parses activity log text into its display window.
#[must_use]
pub fn parse(text: &str) -> ActivityFeed {
    // Repeated headings are told apart by how many times they were seen.
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut entries: Vec<ActivityEntry> = split_blocks(text)
        .iter()
        .filter_map(|block| {
            let occurrence = seen.entry(block.title.trim()).or_default();
            *occurrence += 1;
            block.to_entry(*occurrence)
        })
        .collect();

    entries.sort_by_key(|entry| entry.timestamp);
    if entries.len() > MAX_ENTRIES {
        entries.drain(..entries.len() - MAX_ENTRIES);
    }
    let total_entries = entries.len();
    if entries.len() > DISPLAY_ENTRIES {
        entries.drain(..entries.len() - DISPLAY_ENTRIES);
    }

    ActivityFeed {
        entries,
        total_entries,
        diagnostic: None,
    }
}

#[derive(Debug)]
struct Block<'a> {
    title: &'a str,
    body: Vec<&'a str>,
}

impl Block<'_> {
    /// Ids depend on the heading and its occurrence count only, so entries
    /// keep their id when other blocks are inserted or a body is edited.
    fn to_entry(&self, occurrence: usize) -> Option<ActivityEntry> {
        let date = DATE_TOKEN.find(self.title)?;
        let timestamp = parse_timestamp(date.as_str())?;

        let status = self.body.iter().find_map(|line| status_token(line));
        let message = Some(clean_title(&self.title[..date.start()], &self.title[date.end()..]))
            .filter(|m| !m.is_empty())
            .or_else(|| self.first_body_line())
            .unwrap_or_default();

        let raw = std::iter::once(self.title)
            .chain(self.body.iter().copied())
            .collect::<Vec<_>>()
            .join("\n");
        let key = format!("{}\n{}\n{occurrence}", timestamp.to_rfc3339(), self.title.trim());
        let id = Uuid::new_v5(&ACTIVITY_NAMESPACE, key.as_bytes());

        Some(ActivityEntry {
            id: id.to_string(),
            timestamp,
            message,
            status,
            level: classify_level(&raw),
        })
    }

    fn first_body_line(&self) -> Option<String> {
        self.body
            .iter()
            .map(|line| line.trim())
            .find(|line| !line.is_empty() && status_token(line).is_none())
            .map(|line| line.trim_start_matches(['-', '*', ' ']).to_string())
    }
}

fn split_blocks(text: &str) -> Vec<Block<'_>> {
    let mut blocks = Vec::new();
    let mut current: Option<Block<'_>> = None;

    for line in text.lines() {
        if let Some(caps) = HEADING.captures(line) {
            blocks.extend(current.take());
            let title = caps.name("title").map_or("", |m| m.as_str());
            if DATE_TOKEN.is_match(title) {
                current = Some(Block {
                    title,
                    body: Vec::new(),
                });
            }
        } else if RULE.is_match(line) {
            blocks.extend(current.take());
        } else if let Some(block) = current.as_mut() {
            block.body.push(line);
        }
    }
    blocks.extend(current);
    blocks
}

/// Parses a date token; naive times are taken as UTC, bare dates as midnight.
fn parse_timestamp(token: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(token) {
        return Some(dt.with_timezone(&Utc));
    }

    const OFFSET_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f%z",
        "%Y-%m-%d %H:%M:%S%.f%z",
        "%Y-%m-%dT%H:%M%z",
        "%Y-%m-%d %H:%M%z",
    ];
    if let Some(dt) = OFFSET_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(token, fmt).ok())
    {
        return Some(dt.with_timezone(&Utc));
    }

    let naive = token.trim_end_matches('Z');
    const NAIVE_FORMATS: [&str; 6] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    if let Some(dt) = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive, fmt).ok())
    {
        return Some(dt.and_utc());
    }

    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn status_token(line: &str) -> Option<String> {
    STATUS_LINE
        .captures(line)
        .and_then(|caps| caps.name("status"))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Heading text around the date, with separators and brackets trimmed.
fn clean_title(before: &str, after: &str) -> String {
    const SEPARATORS: &[char] = &['-', '–', '—', ':', '|', '[', ']', '(', ')', ' ', '\t'];
    let before = before.trim_matches(SEPARATORS);
    let after = after.trim_matches(SEPARATORS);
    match (before.is_empty(), after.is_empty()) {
        (true, _) => after.to_string(),
        (false, true) => before.to_string(),
        (false, false) => format!("{before} - {after}"),
    }
}

/// Correction takes precedence over error, error over success.
fn classify_level(text: &str) -> ActivityLevel {
    if CORRECTION.is_match(text) {
        ActivityLevel::Correction
    } else if ERROR.is_match(text) {
        ActivityLevel::Error
    } else if SUCCESS.is_match(text) {
        ActivityLevel::Success
    } else {
        ActivityLevel::Info
    }
}
