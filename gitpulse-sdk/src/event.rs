//! What the connection reports upward.

use std::collections::HashMap;

/// Connection and channel activity, in the order the server produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Socket is up; registration has not started.
    Connected,
    /// Server sent 001. The nick may differ from the configured one after a
    /// collision.
    Registered { nick: String },
    Joined { channel: String, nick: String },
    Parted { channel: String, nick: String },
    /// `nick` was removed from `channel` by `by`.
    Kicked {
        channel: String,
        nick: String,
        by: String,
        reason: String,
    },
    NickChanged { old_nick: String, new_nick: String },
    /// PRIVMSG. `target` is a channel or our own nick.
    Message {
        from: String,
        target: String,
        text: String,
        tags: HashMap<String, String>,
    },
    /// NOTICE from a user. Never to be answered automatically.
    Notice {
        from: String,
        target: String,
        text: String,
    },
    /// Notice from the server itself, or an error numeric.
    ServerNotice { text: String },
    /// Terminal for this connection. Nothing follows it.
    Disconnected { reason: String },
}
