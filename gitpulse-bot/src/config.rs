//! Startup configuration.
//!
//! Values come from, in order of precedence: command-line flags, environment
//! variables, a TOML file, built-in defaults. The file is `--config` if
//! given, else `./gitpulse.toml`, else `~/.config/gitpulse/gitpulse.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;

use crate::model::Destination;

pub const DEFAULT_SERVER: &str = "irc.libera.chat:6697";
pub const DEFAULT_NICK: &str = "gitpulse";
pub const DEFAULT_PREFIX: &str = "!";
pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SEEN_CAP: usize = 50;
pub const DEFAULT_WINDOW_SECS: u64 = 2 * 60 * 60;
pub const DEFAULT_RATE_LIMIT_FLOOR: u32 = 10;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_STATE_DB: &str = "gitpulse.db";
/// Largest page the Events API serves.
pub const MAX_PER_PAGE: usize = 100;

const FILE_NAME: &str = "gitpulse.toml";

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "gitpulse", version, about = "Announce GitHub repository activity in IRC channels")]
pub struct Cli {
    /// Config file (TOML)
    #[arg(long, env = "GITPULSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// IRC server address (host:port)
    #[arg(long, env = "GITPULSE_SERVER")]
    pub server: Option<String>,

    /// Bot nick
    #[arg(long, env = "GITPULSE_NICK")]
    pub nick: Option<String>,

    /// Channel to join (repeatable)
    #[arg(long = "channel")]
    pub channels: Vec<String>,

    /// Force TLS (on by default for port 6697)
    #[arg(long)]
    pub tls: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub tls_insecure: bool,

    /// Command prefix
    #[arg(long)]
    pub prefix: Option<String>,

    /// GitHub API token
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// GitHub API root
    #[arg(long)]
    pub api_base: Option<String>,

    /// Seconds between poll cycles
    #[arg(long = "poll-interval", env = "GITPULSE_POLL_INTERVAL")]
    pub poll_interval_secs: Option<u64>,

    /// Event ids remembered per repository
    #[arg(long)]
    pub seen_cap: Option<usize>,

    /// Ignore events older than this many seconds
    #[arg(long = "window")]
    pub window_secs: Option<u64>,

    /// Stop a cycle when fewer API calls than this remain
    #[arg(long)]
    pub rate_limit_floor: Option<u32>,

    /// HTTP request timeout in seconds
    #[arg(long = "http-timeout")]
    pub http_timeout_secs: Option<u64>,

    /// State database path
    #[arg(long, env = "GITPULSE_STATE_DB")]
    pub state_db: Option<PathBuf>,
}

/// Contents of `gitpulse.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub server: Option<String>,
    pub nick: Option<String>,
    pub channels: Option<Vec<String>>,
    pub tls: Option<bool>,
    pub tls_insecure: Option<bool>,
    pub prefix: Option<String>,
    pub github_token: Option<String>,
    pub api_base: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub seen_cap: Option<usize>,
    pub window_secs: Option<u64>,
    pub rate_limit_floor: Option<u32>,
    pub http_timeout_secs: Option<u64>,
    pub state_db: Option<PathBuf>,
}

impl FileConfig {
    /// Load `explicit`, or the first default location that exists. No file
    /// at all is fine; an unreadable or invalid one is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_paths().into_iter().find(|p| p.exists()) {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Can't read {}", path.display()))?;
        let config = Self::parse(&text).with_context(|| format!("Bad config file {}", path.display()))?;
        tracing::info!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("gitpulse").join(FILE_NAME));
    }
    paths
}

/// Effective settings after merging.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: String,
    pub nick: String,
    pub channels: Vec<Destination>,
    pub tls: bool,
    pub tls_insecure: bool,
    pub prefix: String,
    pub github_token: Option<String>,
    pub api_base: String,
    pub poll_interval: Duration,
    pub seen_cap: usize,
    /// Events requested per fetch. Never above `seen_cap`, so one batch
    /// cannot evict its own ids from the seen set.
    pub per_page: u8,
    pub window: Duration,
    pub rate_limit_floor: u32,
    pub http_timeout: Duration,
    pub state_db: PathBuf,
}

impl Settings {
    /// Merge: CLI/env > config file > defaults, then validate.
    pub fn merge(cli: &Cli, file: &FileConfig) -> Result<Self> {
        let server = cli
            .server
            .clone()
            .or_else(|| file.server.clone())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());
        // Bare host means the TLS port
        let server = if server.contains(':') {
            server
        } else {
            format!("{server}:6697")
        };

        let nick = cli
            .nick
            .clone()
            .or_else(|| file.nick.clone())
            .unwrap_or_else(|| DEFAULT_NICK.to_string());
        if nick.is_empty() || nick.contains(char::is_whitespace) {
            bail!("Invalid nick {nick:?}");
        }

        let raw_channels = if cli.channels.is_empty() {
            file.channels.clone().unwrap_or_default()
        } else {
            cli.channels.clone()
        };
        let mut channels = Vec::with_capacity(raw_channels.len());
        for raw in &raw_channels {
            let Some(channel) = Destination::parse(raw) else {
                bail!("Invalid channel name {raw:?}");
            };
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }

        let prefix = cli
            .prefix
            .clone()
            .or_else(|| file.prefix.clone())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        if prefix.is_empty() {
            bail!("Command prefix must not be empty");
        }

        let poll_interval_secs = cli
            .poll_interval_secs
            .or(file.poll_interval_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        if poll_interval_secs == 0 {
            bail!("poll_interval_secs must be positive");
        }

        let seen_cap = cli.seen_cap.or(file.seen_cap).unwrap_or(DEFAULT_SEEN_CAP);
        if seen_cap == 0 {
            bail!("seen_cap must be positive");
        }

        let window_secs = cli.window_secs.or(file.window_secs).unwrap_or(DEFAULT_WINDOW_SECS);
        if window_secs == 0 {
            bail!("window_secs must be positive");
        }

        let http_timeout_secs = cli
            .http_timeout_secs
            .or(file.http_timeout_secs)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
        if http_timeout_secs == 0 {
            bail!("http_timeout_secs must be positive");
        }

        Ok(Self {
            tls: cli.tls || file.tls.unwrap_or(false) || server.ends_with(":6697"),
            tls_insecure: cli.tls_insecure || file.tls_insecure.unwrap_or(false),
            server,
            nick,
            channels,
            prefix,
            github_token: cli
                .github_token
                .clone()
                .or_else(|| file.github_token.clone())
                .filter(|t| !t.is_empty()),
            api_base: cli
                .api_base
                .clone()
                .or_else(|| file.api_base.clone())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            poll_interval: Duration::from_secs(poll_interval_secs),
            seen_cap,
            per_page: seen_cap.min(MAX_PER_PAGE) as u8,
            window: Duration::from_secs(window_secs),
            rate_limit_floor: cli
                .rate_limit_floor
                .or(file.rate_limit_floor)
                .unwrap_or(DEFAULT_RATE_LIMIT_FLOOR),
            http_timeout: Duration::from_secs(http_timeout_secs),
            state_db: cli
                .state_db
                .clone()
                .or_else(|| file.state_db.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DB)),
        })
    }
}
