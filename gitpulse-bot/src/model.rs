//! Core value types shared by every stage of the poll pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tracked repository, always stored as lowercase `owner/repo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Source(String);

impl Source {
    /// Parse and normalise an `owner/repo` identifier.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (owner, repo) = raw.split_once('/')?;
        let valid_part = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !valid_part(owner) || !valid_part(repo) || repo == "." || repo == ".." {
            return None;
        }
        Some(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A channel that receives announcements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination(String);

impl Destination {
    /// Accepts `#chan` / `&chan` names without spaces, commas or control bytes.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() > 1
            && (raw.starts_with('#') || raw.starts_with('&'))
            && !raw.chars().any(|c| c == ' ' || c == ',' || c.is_control());
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// IRC channel names compare case-insensitively.
    pub fn same_channel(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// GitHub event types the formatter knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Push,
    PullRequest,
    Issues,
    IssueComment,
    Create,
    Delete,
    Release,
    Fork,
    Watch,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Push => "PushEvent",
            EventKind::PullRequest => "PullRequestEvent",
            EventKind::Issues => "IssuesEvent",
            EventKind::IssueComment => "IssueCommentEvent",
            EventKind::Create => "CreateEvent",
            EventKind::Delete => "DeleteEvent",
            EventKind::Release => "ReleaseEvent",
            EventKind::Fork => "ForkEvent",
            EventKind::Watch => "WatchEvent",
            EventKind::Other(name) => name,
        }
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        match name {
            "PushEvent" => EventKind::Push,
            "PullRequestEvent" => EventKind::PullRequest,
            "IssuesEvent" => EventKind::Issues,
            "IssueCommentEvent" => EventKind::IssueComment,
            "CreateEvent" => EventKind::Create,
            "DeleteEvent" => EventKind::Delete,
            "ReleaseEvent" => EventKind::Release,
            "ForkEvent" => EventKind::Fork,
            "WatchEvent" => EventKind::Watch,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event as returned by the fetcher. Consumed by the formatter and
/// dropped; only its id outlives a poll, in the seen set.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub id: String,
    pub kind: EventKind,
    pub actor: String,
    /// Display name of the repository (`owner/Repo` as GitHub spells it).
    pub repo: String,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// A single outgoing chat line with IRC formatting codes.
///
/// Never contains CR, LF or NUL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedLine(String);

impl FormattedLine {
    pub(crate) fn new(text: String) -> Self {
        debug_assert!(!text.contains(['\r', '\n', '\0']));
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FormattedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
