//! Channel commands.
//!
//! Parsing is pure; [`execute`] applies a command and returns the reply
//! lines (without the `[GitPulse]` prefix, which the sender adds).

use std::sync::Arc;
use std::time::Duration;

use crate::error::FetchError;
use crate::model::{Destination, Source};
use crate::poller::Poller;
use crate::scheduler::Scheduler;
use crate::subscriptions::Change;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Subscribe(String),
    Unsubscribe(String),
    List,
    Fetch,
    Interval(Option<String>),
    Help,
}

/// Parse `text` if it starts with `prefix` and names a known command.
pub fn parse(text: &str, prefix: &str) -> Option<BotCommand> {
    let cmd_text = text.strip_prefix(prefix)?;
    let mut parts = cmd_text.trim().splitn(2, ' ');
    let cmd = parts.next()?.to_lowercase();
    let arg = parts.next().unwrap_or("").trim().to_string();

    match cmd.as_str() {
        "subscribe" => Some(BotCommand::Subscribe(arg)),
        "unsubscribe" => Some(BotCommand::Unsubscribe(arg)),
        "subscriptions" | "listgitpulse" => Some(BotCommand::List),
        "fetch" => Some(BotCommand::Fetch),
        "interval" => Some(BotCommand::Interval((!arg.is_empty()).then_some(arg))),
        "help" => Some(BotCommand::Help),
        _ => None,
    }
}

/// Result of running a command.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub replies: Vec<String>,
    /// Source to poll once the replies are out.
    pub poll: Option<Source>,
}

impl Outcome {
    fn reply(text: impl Into<String>) -> Self {
        Self {
            replies: vec![text.into()],
            poll: None,
        }
    }
}

pub async fn execute(
    cmd: BotCommand,
    channel: &Destination,
    prefix: &str,
    poller: &Arc<Poller>,
    scheduler: &Scheduler,
) -> Outcome {
    match cmd {
        BotCommand::Subscribe(arg) => {
            let Some(source) = parse_source(&arg) else {
                return Outcome::reply(format!("Usage: {prefix}subscribe owner/repo"));
            };
            match poller.subscriptions().subscribe(channel, &source) {
                Change::Applied => {
                    tracing::info!(destination = %channel, source = %source, "Subscribed");
                    Outcome {
                        replies: vec![format!("Subscribed to {source} in channel {channel}.")],
                        poll: Some(source),
                    }
                }
                Change::Unchanged => {
                    Outcome::reply(format!("Already subscribed to {source} in channel {channel}."))
                }
            }
        }
        BotCommand::Unsubscribe(arg) => {
            let Some(source) = parse_source(&arg) else {
                return Outcome::reply(format!("Usage: {prefix}unsubscribe owner/repo"));
            };
            match poller.unsubscribe(channel, &source) {
                Change::Applied => {
                    tracing::info!(destination = %channel, source = %source, "Unsubscribed");
                    Outcome::reply(format!("Unsubscribed from {source} in channel {channel}."))
                }
                Change::Unchanged => {
                    Outcome::reply(format!("Not subscribed to {source} in channel {channel}."))
                }
            }
        }
        BotCommand::List => {
            let sources = poller.subscriptions().sources_for(channel);
            if sources.is_empty() {
                Outcome::reply(format!("No repositories subscribed to in {channel}."))
            } else {
                let list: Vec<&str> = sources.iter().map(Source::as_str).collect();
                Outcome::reply(format!(
                    "Subscribed to the following repositories in {channel}: {}",
                    list.join(", ")
                ))
            }
        }
        BotCommand::Fetch => {
            let results = poller.poll_destination(channel).await;
            if results.is_empty() {
                return Outcome::reply(format!("No repositories subscribed to in {channel}."));
            }
            let failures: Vec<String> = results
                .iter()
                .filter_map(|(source, r)| r.as_ref().err().map(|e| format!("{source} ({})", describe(e))))
                .collect();
            if !failures.is_empty() {
                return Outcome::reply(format!("Could not fetch {}", failures.join(", ")));
            }
            let lines: usize = results
                .iter()
                .filter_map(|(_, r)| r.as_ref().ok())
                .map(|r| r.lines)
                .sum();
            if lines == 0 {
                Outcome::reply(format!("No new activity for {channel}."))
            } else {
                Outcome::default()
            }
        }
        BotCommand::Interval(None) => Outcome::reply(format!(
            "Polling every {}s ({}).",
            scheduler.interval().as_secs(),
            scheduler.state()
        )),
        BotCommand::Interval(Some(arg)) => {
            let secs = arg.parse::<u64>().ok().filter(|s| *s > 0);
            match secs.map(|s| scheduler.set_interval(Duration::from_secs(s))) {
                Some(Ok(())) => Outcome::reply(format!("Poll interval set to {arg}s.")),
                _ => Outcome::reply("Interval must be a positive number of seconds."),
            }
        }
        BotCommand::Help => Outcome {
            replies: vec![
                format!("{prefix}subscribe owner/repo    Announce a repository here"),
                format!("{prefix}unsubscribe owner/repo  Stop announcing it"),
                format!("{prefix}subscriptions           List this channel's repositories"),
                format!("{prefix}fetch                   Poll this channel's repositories now"),
                format!("{prefix}interval [secs]         Show or set the poll interval"),
            ],
            poll: None,
        },
    }
}

/// Poll a freshly subscribed source. Returns an error line on failure.
pub async fn follow_up(poller: &Poller, source: &Source) -> Option<String> {
    match poller.poll_followed(source).await {
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(source = %source, error = %e, "Initial poll failed");
            Some(format!("Could not fetch {source} ({})", describe(&e)))
        }
    }
}

fn parse_source(arg: &str) -> Option<Source> {
    let first = arg.split_whitespace().next()?;
    Source::parse(first)
}

fn describe(e: &FetchError) -> &'static str {
    match e {
        FetchError::NotFound => "not found",
        FetchError::RateLimited { .. } => "rate limited",
        FetchError::Transient(_) => "temporary failure",
    }
}
