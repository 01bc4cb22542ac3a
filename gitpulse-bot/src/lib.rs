//! gitpulse: announce GitHub repository activity in IRC channels.
//!
//! Channels subscribe to repositories (`owner/repo`). A background
//! scheduler polls each subscribed repository's public event feed, renders
//! events it has not announced before as IRC lines and posts them to every
//! channel that follows the repository.
//!
//! The pipeline is assembled from a few seams:
//! - [`fetcher::Fetcher`]: where events come from (GitHub's Events API)
//! - [`seen::SeenTracker`]: which event ids were already announced
//! - [`format::format`]: event to IRC lines
//! - [`output::Dispatcher`]: where lines go (the IRC connection)
//! - [`store::StateStore`]: persistence for seen sets and subscriptions

pub mod commands;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod format;
pub mod model;
pub mod output;
pub mod poller;
pub mod scheduler;
pub mod seen;
pub mod store;
pub mod subscriptions;
