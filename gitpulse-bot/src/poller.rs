//! The poll pipeline: fetch → filter → format → dispatch → commit.
//!
//! Work is grouped by source. A source is fetched once per cycle and its
//! new lines go to every channel following it, then the ids are committed
//! so no channel can starve another. The whole per-source section runs
//! under an async mutex keyed by source, which makes overlapping polls
//! (scheduled cycle plus a manual `fetch`) announce each id at most once.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::error::FetchError;
use crate::fetcher::{FetchOutcome, Fetcher, RateStatus};
use crate::format::format;
use crate::model::{Destination, FormattedLine, Source};
use crate::output::Dispatcher;
use crate::seen::SeenTracker;
use crate::subscriptions::{Change, Subscriptions};

/// What one source poll produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceReport {
    /// Events that passed the seen filter and were committed.
    pub new_events: usize,
    /// Lines sent to each follower.
    pub lines: usize,
    pub rate: Option<RateStatus>,
}

/// Summary of one scheduled cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub attempted: usize,
    pub failed: usize,
    /// Sources not attempted because the API quota ran low.
    pub skipped: usize,
    pub new_events: usize,
    pub rate_limited: bool,
    pub cancelled: bool,
}

pub struct Poller {
    fetcher: Arc<dyn Fetcher>,
    dispatcher: Arc<dyn Dispatcher>,
    seen: SeenTracker,
    subscriptions: Subscriptions,
    locks: parking_lot::Mutex<HashMap<Source, Arc<tokio::sync::Mutex<()>>>>,
    rate_limit_floor: u32,
}

impl Poller {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        dispatcher: Arc<dyn Dispatcher>,
        seen: SeenTracker,
        subscriptions: Subscriptions,
        rate_limit_floor: u32,
    ) -> Self {
        Self {
            fetcher,
            dispatcher,
            seen,
            subscriptions,
            locks: parking_lot::Mutex::new(HashMap::new()),
            rate_limit_floor,
        }
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    pub fn seen(&self) -> &SeenTracker {
        &self.seen
    }

    /// Remove `source` from `destination` and, once nobody follows it, drop
    /// the per-source state kept in memory.
    pub fn unsubscribe(&self, destination: &Destination, source: &Source) -> Change {
        let change = self.subscriptions.unsubscribe(destination, source);
        if change == Change::Applied && self.subscriptions.destinations_for(source).is_empty() {
            let mut locks = self.locks.lock();
            // A poll in flight holds a clone; leave its lock alone
            if locks.get(source).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(source);
            }
            self.seen.forget(source);
        }
        change
    }

    /// Sources with a lock slot, for diagnostics.
    pub fn tracked_sources(&self) -> usize {
        self.locks.lock().len()
    }

    fn lock_for(&self, source: &Source) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(source.clone()).or_default().clone()
    }

    /// Poll one source and announce anything new to `destinations`.
    pub async fn poll_source(
        &self,
        source: &Source,
        destinations: &[Destination],
    ) -> Result<SourceReport, FetchError> {
        let lock = self.lock_for(source);
        let _guard = lock.lock().await;

        let validator = self.seen.validator(source);
        let outcome = self.fetcher.fetch(source, validator.as_deref()).await?;
        let (events, validator, rate) = match outcome {
            FetchOutcome::NotModified { rate, .. } => {
                tracing::debug!(source = %source, "Not modified");
                return Ok(SourceReport {
                    rate,
                    ..Default::default()
                });
            }
            FetchOutcome::Modified {
                events,
                validator,
                rate,
            } => (events, validator, rate),
        };

        // Newest `cap` only; a larger batch would evict its own ids on commit
        let mut events = events;
        let cap = self.seen.cap();
        if events.len() > cap {
            let excess = events.len() - cap;
            tracing::debug!(source = %source, dropped = excess, "Batch exceeds seen cap, dropping oldest");
            events.drain(..excess);
        }

        let fresh = self.seen.filter_new(source, events, Utc::now());
        let lines: Vec<FormattedLine> = fresh.iter().filter_map(format).flatten().collect();

        if !lines.is_empty() {
            tracing::info!(
                source = %source,
                count = lines.len(),
                followers = destinations.len(),
                "Announcing"
            );
            for destination in destinations {
                self.dispatcher.dispatch(destination, &lines).await;
            }
        }

        // Unannounceable kinds are committed too so they are not refiltered
        self.seen.commit(source, &fresh);
        self.seen.set_validator(source, validator);

        Ok(SourceReport {
            new_events: fresh.len(),
            lines: lines.len(),
            rate,
        })
    }

    /// Poll `source` for every channel that follows it.
    pub async fn poll_followed(&self, source: &Source) -> Result<SourceReport, FetchError> {
        let destinations = self.subscriptions.destinations_for(source);
        self.poll_source(source, &destinations).await
    }

    /// Poll every source `destination` follows, right now. New events go to
    /// all followers of each source, not only `destination`.
    pub async fn poll_destination(
        &self,
        destination: &Destination,
    ) -> Vec<(Source, Result<SourceReport, FetchError>)> {
        let mut results = Vec::new();
        for source in self.subscriptions.sources_for(destination) {
            let result = self.poll_followed(&source).await;
            if let Err(ref e) = result {
                tracing::warn!(source = %source, error = %e, "Manual fetch failed");
            }
            results.push((source, result));
        }
        results
    }

    /// Run one cycle over every subscribed source. `shutdown` is checked
    /// before each source.
    pub async fn poll_cycle(&self, shutdown: &watch::Receiver<bool>) -> CycleReport {
        let mut report = CycleReport::default();

        for (source, destinations) in self.subscriptions.by_source() {
            if *shutdown.borrow() {
                report.cancelled = true;
                break;
            }
            if report.rate_limited {
                report.skipped += 1;
                continue;
            }

            report.attempted += 1;
            match self.poll_source(&source, &destinations).await {
                Ok(r) => {
                    report.new_events += r.new_events;
                    if let Some(rate) = r.rate.filter(|rate| rate.remaining < self.rate_limit_floor) {
                        tracing::warn!(
                            remaining = rate.remaining,
                            reset_at = ?rate.reset_at,
                            "API quota low, skipping rest of cycle"
                        );
                        report.rate_limited = true;
                    }
                }
                Err(FetchError::RateLimited { reset_at }) => {
                    tracing::warn!(source = %source, reset_at = ?reset_at, "Rate limited, skipping rest of cycle");
                    report.failed += 1;
                    report.rate_limited = true;
                }
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "Fetch failed, will retry next cycle");
                    report.failed += 1;
                }
            }
        }

        if report.skipped > 0 {
            tracing::info!(count = report.skipped, "Sources deferred to next cycle");
        }
        report
    }
}
