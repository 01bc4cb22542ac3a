//! Event fetching.
//!
//! [`Fetcher`] is the seam the poller pulls events through. The GitHub
//! implementation talks to the public Events API with conditional requests
//! (`If-None-Match`) and reports the remaining API quota back to the caller.
//! It holds no per-source state: validators and quota decisions belong to
//! the poller.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, ETAG, HeaderMap, IF_NONE_MATCH, RETRY_AFTER};
use serde::Deserialize;

use crate::error::FetchError;
use crate::model::{EventKind, RawEvent, Source};

/// API quota as last reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateStatus {
    pub remaining: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Successful fetch result.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Fresh events, oldest first, ids unique. May be empty.
    Modified {
        events: Vec<RawEvent>,
        validator: Option<String>,
        rate: Option<RateStatus>,
    },
    /// Nothing changed since `validator`; the caller keeps using it.
    NotModified {
        validator: Option<String>,
        rate: Option<RateStatus>,
    },
}

impl FetchOutcome {
    pub fn rate(&self) -> Option<RateStatus> {
        match self {
            FetchOutcome::Modified { rate, .. } | FetchOutcome::NotModified { rate, .. } => *rate,
        }
    }

    pub fn validator(&self) -> Option<&str> {
        match self {
            FetchOutcome::Modified { validator, .. }
            | FetchOutcome::NotModified { validator, .. } => validator.as_deref(),
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Pull the current events for `source`. `validator` is the token from
    /// the previous successful fetch, if any.
    async fn fetch(&self, source: &Source, validator: Option<&str>)
    -> Result<FetchOutcome, FetchError>;
}

/// Settings for [`GithubFetcher`].
#[derive(Debug, Clone)]
pub struct GithubConfig {
    /// API root without trailing slash, e.g. `https://api.github.com`.
    pub api_base: String,
    pub token: Option<String>,
    /// Events requested per call (GitHub caps this at 100).
    pub per_page: u8,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            token: None,
            per_page: 30,
            timeout: Duration::from_secs(15),
            user_agent: concat!("gitpulse/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Fetches `GET /repos/{owner}/{repo}/events`.
pub struct GithubFetcher {
    config: GithubConfig,
    http: reqwest::Client,
}

impl GithubFetcher {
    pub fn new(config: GithubConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, http })
    }

    fn events_url(&self, source: &Source) -> String {
        format!(
            "{}/repos/{}/events?per_page={}",
            self.config.api_base.trim_end_matches('/'),
            source,
            self.config.per_page
        )
    }
}

#[async_trait]
impl Fetcher for GithubFetcher {
    async fn fetch(
        &self,
        source: &Source,
        validator: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        let mut req = self
            .http
            .get(self.events_url(source))
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(ref token) = self.config.token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(tag) = validator {
            req = req.header(IF_NONE_MATCH, tag);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let rate = rate_status(resp.headers());
        let retry_after = retry_after(resp.headers());
        tracing::debug!(
            source = %source,
            status = status.as_u16(),
            remaining = rate.map(|r| r.remaining),
            "GitHub events response"
        );

        match status {
            StatusCode::NOT_MODIFIED => {
                return Ok(FetchOutcome::NotModified {
                    validator: validator.map(str::to_string),
                    rate,
                });
            }
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound),
            // Secondary limits come as 403 with quota left and `retry-after`
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
                if status == StatusCode::TOO_MANY_REQUESTS
                    || retry_after.is_some()
                    || rate.is_some_and(|r| r.remaining == 0) =>
            {
                let reset_at = retry_after
                    .map(|secs| Utc::now() + secs)
                    .or_else(|| rate.and_then(|r| r.reset_at));
                return Err(FetchError::RateLimited { reset_at });
            }
            s if !s.is_success() => {
                return Err(FetchError::Transient(format!("HTTP {s}")));
            }
            _ => {}
        }

        let new_validator = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?;
        let events = parse_events(&body, source)?;

        Ok(FetchOutcome::Modified {
            events,
            validator: new_validator,
            rate,
        })
    }
}

fn rate_status(headers: &HeaderMap) -> Option<RateStatus> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let remaining = header("x-ratelimit-remaining")?.trim().parse().ok()?;
    let reset_at = header("x-ratelimit-reset")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    Some(RateStatus { remaining, reset_at })
}

fn retry_after(headers: &HeaderMap) -> Option<chrono::TimeDelta> {
    let secs = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<i64>().ok()?;
    chrono::TimeDelta::try_seconds(secs)
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    actor: WireActor,
    repo: Option<WireRepo>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireActor {
    login: String,
    display_login: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireRepo {
    name: String,
}

/// Decode a newest-first GitHub event array into oldest-first, de-duplicated
/// [`RawEvent`]s.
pub fn parse_events(body: &[u8], source: &Source) -> Result<Vec<RawEvent>, FetchError> {
    let wire: Vec<WireEvent> = serde_json::from_slice(body)
        .map_err(|e| FetchError::Transient(format!("malformed events payload: {e}")))?;

    let mut seen = HashSet::new();
    let mut events = Vec::with_capacity(wire.len());
    for ev in wire.into_iter().rev() {
        if !seen.insert(ev.id.clone()) {
            continue;
        }
        events.push(RawEvent {
            id: ev.id,
            kind: EventKind::from(ev.kind.as_str()),
            actor: ev.actor.display_login.unwrap_or(ev.actor.login),
            repo: ev.repo.map(|r| r.name).unwrap_or_else(|| source.to_string()),
            created_at: ev.created_at,
            payload: ev.payload,
        });
    }
    Ok(events)
}
