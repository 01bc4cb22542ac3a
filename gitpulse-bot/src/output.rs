//! Delivering lines to IRC channels.
//!
//! [`Dispatcher`] is the seam the poller announces through. The IRC
//! implementation only talks to channels it has actually joined; anything
//! sent before registration or after a kick is dropped with a warning.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use gitpulse_sdk::client::ClientHandle;
use gitpulse_sdk::event::Event;
use parking_lot::{Mutex, RwLock};

use crate::format::COLOR;
use crate::model::{Destination, FormattedLine};

/// Prefix for command replies.
pub const REPLY_PREFIX: &str = "[GitPulse]";

/// Longest text we put in a single PRIVMSG.
pub const MAX_LINE_BYTES: usize = 400;

const LINE_DELAY: Duration = Duration::from_millis(100);

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Send `lines` to `destination` in order, one message per line.
    async fn dispatch(&self, destination: &Destination, lines: &[FormattedLine]);
}

/// Dispatcher backed by the live IRC connection.
///
/// Feed it every client event through [`IrcDispatcher::observe`] so it
/// knows the current handle, our nick and the channels we sit in.
pub struct IrcDispatcher {
    handle: RwLock<Option<ClientHandle>>,
    nick: RwLock<String>,
    joined: Mutex<HashSet<String>>,
    line_delay: Duration,
}

impl Default for IrcDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl IrcDispatcher {
    pub fn new() -> Self {
        Self::with_line_delay(LINE_DELAY)
    }

    pub fn with_line_delay(line_delay: Duration) -> Self {
        Self {
            handle: RwLock::new(None),
            nick: RwLock::new(String::new()),
            joined: Mutex::new(HashSet::new()),
            line_delay,
        }
    }

    /// Update connection state from a client event.
    pub fn observe(&self, handle: &ClientHandle, event: &Event) {
        match event {
            Event::Registered { nick } => {
                *self.handle.write() = Some(handle.clone());
                *self.nick.write() = nick.clone();
                self.joined.lock().clear();
            }
            Event::Joined { channel, nick } if self.is_me(nick) => {
                tracing::info!(channel = %channel, "Joined");
                self.joined.lock().insert(channel.to_ascii_lowercase());
            }
            Event::Parted { channel, nick } if self.is_me(nick) => {
                self.joined.lock().remove(&channel.to_ascii_lowercase());
            }
            Event::Kicked { channel, nick, by, reason } if self.is_me(nick) => {
                tracing::warn!(channel = %channel, by = %by, reason = %reason, "Kicked");
                self.joined.lock().remove(&channel.to_ascii_lowercase());
            }
            Event::NickChanged { old_nick, new_nick } if self.is_me(old_nick) => {
                *self.nick.write() = new_nick.clone();
            }
            Event::Disconnected { .. } => {
                *self.handle.write() = None;
                self.joined.lock().clear();
            }
            _ => {}
        }
    }

    /// Handle of the registered connection, if any.
    pub fn handle(&self) -> Option<ClientHandle> {
        self.handle.read().clone()
    }

    /// Our current nick, empty before registration.
    pub fn nick(&self) -> String {
        self.nick.read().clone()
    }

    pub fn is_me(&self, nick: &str) -> bool {
        let me = self.nick.read();
        !me.is_empty() && me.eq_ignore_ascii_case(nick)
    }

    pub fn is_joined(&self, destination: &Destination) -> bool {
        self.joined
            .lock()
            .contains(&destination.as_str().to_ascii_lowercase())
    }
}

#[async_trait]
impl Dispatcher for IrcDispatcher {
    async fn dispatch(&self, destination: &Destination, lines: &[FormattedLine]) {
        if lines.is_empty() {
            return;
        }
        let handle = self.handle.read().clone();
        let Some(handle) = handle.filter(|_| self.is_joined(destination)) else {
            tracing::warn!(
                destination = %destination,
                count = lines.len(),
                "Not in channel, dropping announcement"
            );
            return;
        };

        for line in lines {
            for part in wrap_lines(line.as_str(), MAX_LINE_BYTES) {
                if let Err(e) = handle.privmsg(destination.as_str(), &part).await {
                    tracing::warn!(destination = %destination, error = %e, "Send failed");
                    return;
                }
                tokio::time::sleep(self.line_delay).await;
            }
        }
    }
}

/// Post a command reply, prefixed with [`REPLY_PREFIX`].
pub async fn say(handle: &ClientHandle, channel: &str, text: &str) -> anyhow::Result<()> {
    for line in wrap_lines(text, MAX_LINE_BYTES - REPLY_PREFIX.len() - 1) {
        handle
            .privmsg(channel, &format!("{REPLY_PREFIX} {line}"))
            .await?;
        tokio::time::sleep(LINE_DELAY).await;
    }
    Ok(())
}

/// Wrap text into lines of at most `max_len` bytes, breaking at the last
/// space that fits. Spacing inside a line is kept as is. Words longer than
/// a line are split, but never inside a char or a colour code.
pub fn wrap_lines(text: &str, max_len: usize) -> Vec<String> {
    let mut result = Vec::new();
    for line in text.lines() {
        let bytes = line.as_bytes();
        let mut start = 0;
        let mut pos = 0;
        let mut last_space = None;

        while pos < line.len() {
            let end = pos + unit_len(&line[pos..]);
            if end - start <= max_len {
                if bytes[pos] == b' ' {
                    last_space = Some(pos);
                }
                pos = end;
                continue;
            }

            if bytes[pos] == b' ' {
                result.push(line[start..pos].to_string());
                start = end;
                pos = end;
            } else if let Some(space) = last_space.filter(|&s| s > start) {
                result.push(line[start..space].to_string());
                start = space + 1;
            } else if pos > start {
                result.push(line[start..pos].to_string());
                start = pos;
            } else {
                // A single unit wider than the line
                result.push(line[pos..end].to_string());
                start = end;
                pos = end;
            }
            last_space = None;
        }

        if start < line.len() || line.is_empty() {
            result.push(line[start..].to_string());
        }
    }
    result
}

/// Byte length of the indivisible unit at the start of `rest`: a colour
/// code with its digits, or one char.
fn unit_len(rest: &str) -> usize {
    let bytes = rest.as_bytes();
    if !rest.starts_with(COLOR) {
        return rest.chars().next().map_or(0, char::len_utf8);
    }
    let digits = |from: usize| {
        bytes[from..]
            .iter()
            .take(2)
            .take_while(|b| b.is_ascii_digit())
            .count()
    };
    let mut len = 1 + digits(1);
    if len > 1 && bytes.get(len) == Some(&b',') && bytes.get(len + 1).is_some_and(u8::is_ascii_digit) {
        len += 1 + digits(len + 1);
    }
    len
}
