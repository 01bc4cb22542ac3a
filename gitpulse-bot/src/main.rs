//! gitpulse: GitHub activity announcer for IRC.
//!
//! Connects to one IRC server, joins the configured channels plus every
//! channel with subscriptions, and polls subscribed repositories in the
//! background. Commands (default prefix `!`):
//!
//!   !subscribe owner/repo     Announce a repository in this channel
//!   !unsubscribe owner/repo   Stop announcing it
//!   !subscriptions            List this channel's repositories
//!   !fetch                    Poll this channel's repositories now
//!   !interval [secs]          Show or set the poll interval
//!   !help                     List commands
//!
//! Set GITHUB_TOKEN for the authenticated API quota.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::Parser;
use gitpulse_sdk::client::{self, ClientHandle, ConnectConfig, ReconnectConfig};
use gitpulse_sdk::event::Event;

use gitpulse_bot::commands;
use gitpulse_bot::config::{Cli, FileConfig, Settings};
use gitpulse_bot::fetcher::{GithubConfig, GithubFetcher};
use gitpulse_bot::model::Destination;
use gitpulse_bot::output::{self, IrcDispatcher};
use gitpulse_bot::poller::Poller;
use gitpulse_bot::scheduler::Scheduler;
use gitpulse_bot::seen::SeenTracker;
use gitpulse_bot::store::{SqliteStore, StateStore};
use gitpulse_bot::subscriptions::Subscriptions;

/// Time for registration and joins before the first scheduled cycle.
const STARTUP_GRACE: Duration = Duration::from_secs(10);

struct Bot {
    dispatcher: Arc<IrcDispatcher>,
    poller: Arc<Poller>,
    scheduler: Arc<Scheduler>,
    prefix: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gitpulse_bot=info,gitpulse_sdk=info,gitpulse=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let file = FileConfig::load(cli.config.as_deref())?;
    let settings = Settings::merge(&cli, &file)?;

    if let Some(parent) = settings.state_db.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let store: Arc<dyn StateStore> = Arc::new(
        SqliteStore::open(&settings.state_db)
            .with_context(|| format!("Failed to open {}", settings.state_db.display()))?,
    );

    if settings.github_token.is_none() {
        tracing::warn!("No GitHub token configured, the anonymous API quota is 60 requests/hour");
    }
    let fetcher = Arc::new(GithubFetcher::new(GithubConfig {
        api_base: settings.api_base.clone(),
        token: settings.github_token.clone(),
        timeout: settings.http_timeout,
        per_page: settings.per_page,
        ..Default::default()
    })?);

    let window = TimeDelta::from_std(settings.window).context("window_secs out of range")?;
    let seen = SeenTracker::new(store.clone(), settings.seen_cap, window);
    let subscriptions = Subscriptions::load(store);

    let mut channels: Vec<Destination> = settings.channels.clone();
    for dest in subscriptions.destinations() {
        if !channels.contains(&dest) {
            channels.push(dest);
        }
    }

    let dispatcher = Arc::new(IrcDispatcher::new());
    let poller = Arc::new(Poller::new(
        fetcher,
        dispatcher.clone(),
        seen,
        subscriptions,
        settings.rate_limit_floor,
    ));
    let (scheduler, scheduler_task) =
        Scheduler::spawn_after(poller.clone(), settings.poll_interval, STARTUP_GRACE);
    let scheduler = Arc::new(scheduler);

    tracing::info!(
        server = %settings.server,
        nick = %settings.nick,
        channels = channels.len(),
        interval_secs = settings.poll_interval.as_secs(),
        "Starting gitpulse"
    );

    let config = ConnectConfig {
        server_addr: settings.server.clone(),
        nick: settings.nick.clone(),
        user: settings.nick.clone(),
        realname: "GitPulse".to_string(),
        tls: settings.tls,
        tls_insecure: settings.tls_insecure,
    };
    let reconnect = ReconnectConfig {
        channels: channels.iter().map(|c| c.to_string()).collect(),
        ..Default::default()
    };

    let bot = Arc::new(Bot {
        dispatcher: dispatcher.clone(),
        poller,
        scheduler: scheduler.clone(),
        prefix: settings.prefix.clone(),
    });
    let mut irc = tokio::spawn(client::run_with_reconnect(config, reconnect, move |handle, event| {
        let bot = bot.clone();
        Box::pin(async move {
            handle_event(bot, handle, event).await;
            Ok(())
        })
    }));

    tracing::info!("Bot running. Ctrl+C to stop.");

    tokio::select! {
        res = &mut irc => {
            match res {
                Ok(Err(e)) => tracing::error!(error = %e, "IRC loop failed"),
                Err(e) => tracing::error!(error = %e, "IRC task panicked"),
                Ok(Ok(())) => {}
            }
        }
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("Shutting down");
        }
    }

    scheduler.shutdown();
    if let Err(e) = scheduler_task.await {
        tracing::error!(error = %e, "Scheduler task failed");
    }
    if let Some(handle) = dispatcher.handle() {
        let _ = handle.quit(Some("GitPulse shutting down")).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    irc.abort();
    Ok(())
}

async fn handle_event(bot: Arc<Bot>, handle: ClientHandle, event: Event) {
    bot.dispatcher.observe(&handle, &event);

    match event {
        Event::Connected => tracing::info!("Connected"),
        Event::Registered { nick } => tracing::info!(nick = %nick, "Registered"),
        Event::Message { from, target, text, .. } => {
            if bot.dispatcher.is_me(&from) {
                return;
            }
            // Private messages are ignored
            let Some(channel) = Destination::parse(&target) else {
                return;
            };
            let Some(cmd) = commands::parse(&text, &bot.prefix) else {
                return;
            };
            tracing::info!(from = %from, destination = %channel, command = ?cmd, "Command");

            tokio::spawn(async move {
                let outcome =
                    commands::execute(cmd, &channel, &bot.prefix, &bot.poller, &bot.scheduler).await;
                for reply in &outcome.replies {
                    if let Err(e) = output::say(&handle, channel.as_str(), reply).await {
                        tracing::warn!(destination = %channel, error = %e, "Reply failed");
                        return;
                    }
                }
                let Some(source) = outcome.poll else {
                    return;
                };
                if let Some(line) = commands::follow_up(&bot.poller, &source).await {
                    if let Err(e) = output::say(&handle, channel.as_str(), &line).await {
                        tracing::warn!(destination = %channel, error = %e, "Reply failed");
                    }
                }
            });
        }
        Event::Notice { from, .. } => tracing::debug!(from = %from, "Ignoring notice"),
        Event::ServerNotice { text } => tracing::debug!(text = %text, "Server notice"),
        Event::Disconnected { reason } => tracing::warn!(reason = %reason, "Disconnected"),
        _ => {}
    }
}
