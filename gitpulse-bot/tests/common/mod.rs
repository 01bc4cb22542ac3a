//! Shared fakes for pipeline tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};

use gitpulse_bot::error::{FetchError, PersistenceError};
use gitpulse_bot::fetcher::{FetchOutcome, Fetcher, RateStatus, parse_events};
use gitpulse_bot::format::strip_markup;
use gitpulse_bot::model::{Destination, FormattedLine, RawEvent, Source};
use gitpulse_bot::output::Dispatcher;
use gitpulse_bot::poller::Poller;
use gitpulse_bot::seen::SeenTracker;
use gitpulse_bot::store::{SqliteStore, StateStore, StoredSeen};
use gitpulse_bot::subscriptions::Subscriptions;

pub fn src(s: &str) -> Source {
    Source::parse(s).unwrap()
}

pub fn dest(s: &str) -> Destination {
    Destination::parse(s).unwrap()
}

/// A GitHub-shaped event, `minutes_ago` before now.
pub fn wire_event(id: &str, kind: &str, minutes_ago: i64, payload: Value) -> Value {
    let created = Utc::now() - TimeDelta::minutes(minutes_ago);
    json!({
        "id": id,
        "type": kind,
        "actor": {"login": "octocat"},
        "repo": {"name": "octo/repo"},
        "created_at": created.to_rfc3339(),
        "payload": payload,
    })
}

pub fn push(id: &str, minutes_ago: i64, sha: &str, message: &str) -> Value {
    wire_event(
        id,
        "PushEvent",
        minutes_ago,
        json!({"ref": "refs/heads/main", "commits": [{"sha": sha, "message": message}]}),
    )
}

pub fn issue(id: &str, minutes_ago: i64, title: &str) -> Value {
    wire_event(
        id,
        "IssuesEvent",
        minutes_ago,
        json!({
            "action": "opened",
            "issue": {"title": title, "html_url": format!("https://github.com/octo/repo/issues/{id}")}
        }),
    )
}

pub fn star(id: &str, minutes_ago: i64) -> Value {
    wire_event(id, "WatchEvent", minutes_ago, json!({"action": "started"}))
}

/// Decode a newest-first list the way the GitHub fetcher does.
pub fn feed(source: &Source, newest_first: Vec<Value>) -> Vec<RawEvent> {
    let body = serde_json::to_vec(&newest_first).unwrap();
    parse_events(&body, source).unwrap()
}

#[derive(Debug, Clone)]
pub enum Reply {
    Events {
        events: Vec<RawEvent>,
        validator: Option<String>,
        rate: Option<RateStatus>,
    },
    NotModified,
    RateLimited,
    NotFound,
    Transient,
}

/// Fetcher that serves a configurable reply per source.
#[derive(Default)]
pub struct FakeFetcher {
    replies: Mutex<HashMap<Source, Reply>>,
    calls: Mutex<Vec<(Source, Option<String>)>>,
    delay: Mutex<Duration>,
}

impl FakeFetcher {
    pub fn set(&self, source: &Source, reply: Reply) {
        self.replies.lock().insert(source.clone(), reply);
    }

    pub fn set_events(&self, source: &Source, events: Vec<RawEvent>) {
        self.set(
            source,
            Reply::Events {
                events,
                validator: None,
                rate: None,
            },
        );
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Every fetch so far: source and the validator it was given.
    pub fn calls(&self) -> Vec<(Source, Option<String>)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(
        &self,
        source: &Source,
        validator: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        self.calls
            .lock()
            .push((source.clone(), validator.map(str::to_string)));
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let reply = self.replies.lock().get(source).cloned();
        match reply {
            Some(Reply::Events {
                events,
                validator,
                rate,
            }) => Ok(FetchOutcome::Modified {
                events,
                validator,
                rate,
            }),
            Some(Reply::NotModified) => Ok(FetchOutcome::NotModified {
                validator: validator.map(str::to_string),
                rate: None,
            }),
            Some(Reply::RateLimited) => Err(FetchError::RateLimited { reset_at: None }),
            Some(Reply::NotFound) | None => Err(FetchError::NotFound),
            Some(Reply::Transient) => Err(FetchError::Transient("boom".into())),
        }
    }
}

/// Dispatcher that records what it was asked to send.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<(Destination, String)>>,
}

impl RecordingDispatcher {
    /// Plain text of every line sent, in order.
    pub fn lines(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn lines_for(&self, destination: &Destination) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, destination: &Destination, lines: &[FormattedLine]) {
        let mut sent = self.sent.lock();
        for line in lines {
            sent.push((destination.clone(), strip_markup(line.as_str())));
        }
    }
}

/// Store where every operation fails.
pub struct BrokenStore;

impl StateStore for BrokenStore {
    fn load_seen(&self, _: &Source) -> Result<Option<StoredSeen>, PersistenceError> {
        Err(PersistenceError::Unavailable)
    }

    fn save_seen(&self, _: &Source, _: &StoredSeen) -> Result<(), PersistenceError> {
        Err(PersistenceError::Unavailable)
    }

    fn load_subscriptions(&self) -> Result<BTreeMap<Destination, Vec<Source>>, PersistenceError> {
        Err(PersistenceError::Unavailable)
    }

    fn save_subscriptions(&self, _: &Destination, _: &[Source]) -> Result<(), PersistenceError> {
        Err(PersistenceError::Unavailable)
    }
}

pub struct Harness {
    pub poller: Arc<Poller>,
    pub fetcher: Arc<FakeFetcher>,
    pub dispatcher: Arc<RecordingDispatcher>,
}

pub fn harness_with(store: Arc<dyn StateStore>, cap: usize, rate_limit_floor: u32) -> Harness {
    let fetcher = Arc::new(FakeFetcher::default());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let seen = SeenTracker::new(store.clone(), cap, TimeDelta::hours(2));
    let poller = Arc::new(Poller::new(
        fetcher.clone(),
        dispatcher.clone(),
        seen,
        Subscriptions::load(store),
        rate_limit_floor,
    ));
    Harness {
        poller,
        fetcher,
        dispatcher,
    }
}

pub fn harness() -> Harness {
    harness_with(Arc::new(SqliteStore::in_memory().unwrap()), 50, 10)
}
