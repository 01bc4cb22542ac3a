//! Turning raw events into IRC lines.
//!
//! [`format`] is pure: the same event always renders the same lines. Kinds
//! we don't announce (and known kinds with actions we don't care about or
//! with missing fields) render as `None`.
//!
//! Emphasis uses mIRC control codes. Every piece of text taken from the
//! payload is reduced to one line without control bytes first, so
//! [`strip_markup`] on a rendered line gives back exactly the plain text.

use serde_json::Value;

use crate::model::{EventKind, FormattedLine, RawEvent};

pub const BOLD: char = '\x02';
pub const COLOR: char = '\x03';
pub const RESET: char = '\x0f';

/// mIRC colour numbers used in announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Green = 3,
    Red = 4,
    Yellow = 8,
    Blue = 12,
}

fn bold(text: &str) -> String {
    format!("{BOLD}{text}{BOLD}")
}

/// Colour `text` and reset afterwards. A leading comma would be read as a
/// background colour separator, so it is shielded by an empty bold pair.
fn paint(color: Color, text: &str) -> String {
    let guard = if text.starts_with(',') {
        format!("{BOLD}{BOLD}")
    } else {
        String::new()
    };
    format!("{COLOR}{:02}{guard}{text}{RESET}", color as u8)
}

/// Remove all mIRC formatting codes.
pub fn strip_markup(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x02' | '\x0f' | '\x11' | '\x16' | '\x1d' | '\x1e' | '\x1f' => {}
            '\x03' => {
                let mut digits = 0;
                while digits < 2 && chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                    chars.next();
                    digits += 1;
                }
                if digits > 0 && chars.peek() == Some(&',') {
                    let mut ahead = chars.clone();
                    ahead.next();
                    if ahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                        chars.next();
                        let mut bg = 0;
                        while bg < 2 && chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                            chars.next();
                            bg += 1;
                        }
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// First line of `text`, without control characters, trimmed.
fn sanitize(text: &str) -> String {
    text.lines()
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

fn text_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for key in path {
        cur = cur.get(key)?;
    }
    let s = sanitize(cur.as_str()?);
    (!s.is_empty()).then_some(s)
}

fn branch_name(git_ref: &str) -> &str {
    git_ref
        .strip_prefix("refs/heads/")
        .or_else(|| git_ref.strip_prefix("refs/tags/"))
        .unwrap_or(git_ref)
}

/// Render an event as zero or more lines. `None` means "nothing to say".
pub fn format(event: &RawEvent) -> Option<Vec<FormattedLine>> {
    let actor = sanitize(&event.actor);
    let repo = sanitize(&event.repo);
    let p = &event.payload;

    let lines = match event.kind {
        EventKind::Push => push_lines(&actor, &repo, p)?,
        EventKind::PullRequest => {
            let action = match (text_at(p, &["action"])?.as_str(), p["pull_request"]["merged"].as_bool()) {
                ("closed", Some(true)) => paint(Color::Green, "merged"),
                ("closed", _) => paint(Color::Blue, "closed"),
                ("opened", _) => paint(Color::Green, "opened"),
                ("reopened", _) => paint(Color::Green, "reopened"),
                _ => return None,
            };
            let title = text_at(p, &["pull_request", "title"])?;
            let url = text_at(p, &["pull_request", "html_url"])?;
            let head = text_at(p, &["pull_request", "head", "ref"])?;
            vec![format!(
                "{} {action} pull request: {} on branch {}: {}",
                bold(&actor),
                paint(Color::Red, &title),
                bold(&head),
                paint(Color::Blue, &url),
            )]
        }
        EventKind::Issues => {
            let action = match text_at(p, &["action"])?.as_str() {
                "opened" => paint(Color::Red, "opened"),
                "reopened" => paint(Color::Red, "reopened"),
                "closed" => paint(Color::Green, "closed"),
                _ => return None,
            };
            let title = text_at(p, &["issue", "title"])?;
            let url = text_at(p, &["issue", "html_url"])?;
            vec![format!(
                "{} {} {action}: {} {}",
                bold(&actor),
                paint(Color::Red, "issue"),
                paint(Color::Red, &title),
                paint(Color::Blue, &url),
            )]
        }
        EventKind::IssueComment => {
            if text_at(p, &["action"])? != "created" {
                return None;
            }
            let number = p["issue"]["number"].as_u64()?;
            let title = text_at(p, &["issue", "title"])?;
            let url = text_at(p, &["comment", "html_url"])?;
            vec![format!(
                "{} commented on {}: {} {}",
                bold(&actor),
                paint(Color::Yellow, &format!("#{number}")),
                title,
                paint(Color::Blue, &url),
            )]
        }
        EventKind::Create => {
            let ref_type = text_at(p, &["ref_type"])?;
            if ref_type == "repository" {
                vec![format!("{} created repository {}", bold(&actor), bold(&repo))]
            } else {
                let name = text_at(p, &["ref"])?;
                vec![format!(
                    "{} created {ref_type} {} in {}",
                    bold(&actor),
                    paint(Color::Green, &name),
                    bold(&repo),
                )]
            }
        }
        EventKind::Delete => {
            let ref_type = text_at(p, &["ref_type"])?;
            let name = text_at(p, &["ref"])?;
            vec![format!(
                "{} deleted {ref_type} {} in {}",
                bold(&actor),
                paint(Color::Red, &name),
                bold(&repo),
            )]
        }
        EventKind::Release => {
            if text_at(p, &["action"])? != "published" {
                return None;
            }
            let name = text_at(p, &["release", "name"]).or_else(|| text_at(p, &["release", "tag_name"]))?;
            let url = text_at(p, &["release", "html_url"])?;
            vec![format!(
                "{} published release {} in {}: {}",
                bold(&actor),
                paint(Color::Green, &name),
                bold(&repo),
                paint(Color::Blue, &url),
            )]
        }
        EventKind::Fork => {
            let fork = text_at(p, &["forkee", "full_name"])?;
            let url = text_at(p, &["forkee", "html_url"])?;
            vec![format!(
                "{} forked {} to {}: {}",
                bold(&actor),
                bold(&repo),
                bold(&fork),
                paint(Color::Blue, &url),
            )]
        }
        EventKind::Watch => vec![format!("{} starred {}", bold(&actor), bold(&repo))],
        EventKind::Other(_) => return None,
    };

    Some(lines.into_iter().map(FormattedLine::new).collect())
}

fn push_lines(actor: &str, repo: &str, p: &Value) -> Option<Vec<String>> {
    let branch = text_at(p, &["ref"]).map(|r| branch_name(&r).to_string())?;
    let branch_label = paint(Color::Green, &format!("branch: {}", bold(&branch)));

    let commits = p["commits"].as_array().map(Vec::as_slice).unwrap_or_default();
    let mut lines = Vec::with_capacity(commits.len());
    for commit in commits {
        let Some(sha) = text_at(commit, &["sha"]) else {
            continue;
        };
        let message = text_at(commit, &["message"]).unwrap_or_default();
        let url = format!("https://github.com/{repo}/commit/{sha}");
        lines.push(format!(
            "{} pushed: {branch_label} {message} to {}: {}",
            bold(actor),
            bold(repo),
            paint(Color::Blue, &url),
        ));
    }

    // Feeds that omit commit details still carry the new head
    if lines.is_empty() {
        let head = text_at(p, &["head"])?;
        let url = format!("https://github.com/{repo}/commit/{head}");
        lines.push(format!(
            "{} pushed: {branch_label} to {}: {}",
            bold(actor),
            bold(repo),
            paint(Color::Blue, &url),
        ));
    }
    Some(lines)
}
