//! gitpulse-sdk: the IRC transport used by the GitPulse bot.
//!
//! - [`client`]: connection, registration, keepalive, reconnect loop
//! - [`event`]: events emitted to the bot
//! - [`irc`]: protocol line parsing

pub mod client;
pub mod event;
pub mod irc;
