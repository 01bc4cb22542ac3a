//! Seen-set tracking: which events have already been announced.
//!
//! Each source keeps a bounded FIFO of event ids. Ids are only unique per
//! source on GitHub's side, so records are never shared between sources.
//! Events older than the configured window are ignored outright so that a
//! restart with an empty history does not replay the whole feed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::model::{RawEvent, Source};
use crate::store::{StateStore, StoredSeen};

/// Bounded, insertion-ordered id set. Evicts oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenRecord {
    ids: VecDeque<String>,
    cap: usize,
}

impl SeenRecord {
    pub fn new(cap: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Rebuild from persisted ids (oldest first), dropping duplicates and
    /// anything beyond the cap.
    pub fn from_ids(ids: impl IntoIterator<Item = String>, cap: usize) -> Self {
        let mut record = Self::new(cap);
        for id in ids {
            record.insert(id);
        }
        record
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|seen| seen == id)
    }

    /// Append `id` unless already present, then evict down to the cap.
    /// Returns whether the id was new.
    pub fn insert(&mut self, id: String) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.ids.push_back(id);
        while self.ids.len() > self.cap {
            self.ids.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids oldest first.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

#[derive(Debug)]
struct Entry {
    record: SeenRecord,
    validator: Option<String>,
}

/// Per-source seen sets with write-through persistence.
///
/// Callers must serialise `filter_new` → `commit` for a given source; the
/// poller does that with its per-source locks.
pub struct SeenTracker {
    store: Arc<dyn StateStore>,
    cap: usize,
    max_age: TimeDelta,
    entries: Mutex<HashMap<Source, Entry>>,
}

impl SeenTracker {
    pub fn new(store: Arc<dyn StateStore>, cap: usize, max_age: TimeDelta) -> Self {
        Self {
            store,
            cap,
            max_age,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn max_age(&self) -> TimeDelta {
        self.max_age
    }

    /// Events not yet announced for `source` and younger than the window,
    /// in their original order.
    pub fn filter_new(&self, source: &Source, events: Vec<RawEvent>, now: DateTime<Utc>) -> Vec<RawEvent> {
        let cutoff = now - self.max_age;
        self.with_entry(source, |entry| {
            events
                .into_iter()
                .filter(|event| {
                    if event.created_at < cutoff {
                        tracing::debug!(source = %source, id = %event.id, "Skipping event outside window");
                        return false;
                    }
                    !entry.record.contains(&event.id)
                })
                .collect()
        })
    }

    /// Record `events` as announced and persist. Re-committing an id is a
    /// no-op.
    pub fn commit(&self, source: &Source, events: &[RawEvent]) {
        let snapshot = self.with_entry(source, |entry| {
            let mut added = 0usize;
            for event in events {
                if entry.record.insert(event.id.clone()) {
                    added += 1;
                }
            }
            (added > 0).then(|| snapshot(entry))
        });
        if let Some(snapshot) = snapshot {
            self.persist(source, &snapshot);
        }
    }

    /// Last validator token stored for `source`.
    pub fn validator(&self, source: &Source) -> Option<String> {
        self.with_entry(source, |entry| entry.validator.clone())
    }

    /// Replace the stored validator token and persist if it changed.
    pub fn set_validator(&self, source: &Source, validator: Option<String>) {
        let snapshot = self.with_entry(source, |entry| {
            if entry.validator == validator {
                return None;
            }
            entry.validator = validator;
            Some(snapshot(entry))
        });
        if let Some(snapshot) = snapshot {
            self.persist(source, &snapshot);
        }
    }

    /// Current ids for `source`, oldest first.
    pub fn ids(&self, source: &Source) -> Vec<String> {
        self.with_entry(source, |entry| entry.record.ids().map(str::to_string).collect())
    }

    /// Drop the cached entry for `source`. Persisted state stays and is
    /// reloaded on next use.
    pub fn forget(&self, source: &Source) {
        self.entries.lock().remove(source);
    }

    /// Number of sources held in memory.
    pub fn cached(&self) -> usize {
        self.entries.lock().len()
    }

    fn with_entry<R>(&self, source: &Source, f: impl FnOnce(&mut Entry) -> R) -> R {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(source.clone())
            .or_insert_with(|| self.load(source));
        f(entry)
    }

    fn load(&self, source: &Source) -> Entry {
        match self.store.load_seen(source) {
            Ok(Some(stored)) => Entry {
                record: SeenRecord::from_ids(stored.ids, self.cap),
                validator: stored.validator,
            },
            Ok(None) => Entry {
                record: SeenRecord::new(self.cap),
                validator: None,
            },
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "Could not load seen set, starting empty");
                Entry {
                    record: SeenRecord::new(self.cap),
                    validator: None,
                }
            }
        }
    }

    fn persist(&self, source: &Source, seen: &StoredSeen) {
        if let Err(e) = self.store.save_seen(source, seen) {
            tracing::warn!(source = %source, error = %e, "Could not persist seen set, keeping it in memory");
        }
    }
}

fn snapshot(entry: &Entry) -> StoredSeen {
    StoredSeen {
        ids: entry.record.ids().map(str::to_string).collect(),
        validator: entry.validator.clone(),
    }
}
