//! Which channels follow which repositories.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::{Destination, Source};
use crate::store::StateStore;

/// Result of a subscribe/unsubscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Applied,
    Unchanged,
}

/// In-memory subscription table with write-through persistence.
pub struct Subscriptions {
    store: Arc<dyn StateStore>,
    table: Mutex<BTreeMap<Destination, Vec<Source>>>,
}

impl Subscriptions {
    /// Load the table from `store`. A store that cannot be read yields an
    /// empty table; later changes still try to persist.
    pub fn load(store: Arc<dyn StateStore>) -> Self {
        let table = match store.load_subscriptions() {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load subscriptions, starting empty");
                BTreeMap::new()
            }
        };
        Self {
            store,
            table: Mutex::new(table),
        }
    }

    pub fn subscribe(&self, destination: &Destination, source: &Source) -> Change {
        let mut table = self.table.lock();
        let sources = table.entry(destination.clone()).or_default();
        if sources.contains(source) {
            return Change::Unchanged;
        }
        sources.push(source.clone());
        self.persist(destination, sources);
        Change::Applied
    }

    pub fn unsubscribe(&self, destination: &Destination, source: &Source) -> Change {
        let mut table = self.table.lock();
        let Some(sources) = table.get_mut(destination) else {
            return Change::Unchanged;
        };
        let before = sources.len();
        sources.retain(|s| s != source);
        if sources.len() == before {
            return Change::Unchanged;
        }
        self.persist(destination, sources);
        Change::Applied
    }

    /// Sources followed by `destination`, in subscription order.
    pub fn sources_for(&self, destination: &Destination) -> Vec<Source> {
        self.table.lock().get(destination).cloned().unwrap_or_default()
    }

    /// Every destination following `source`.
    pub fn destinations_for(&self, source: &Source) -> Vec<Destination> {
        self.table
            .lock()
            .iter()
            .filter(|(_, sources)| sources.contains(source))
            .map(|(dest, _)| dest.clone())
            .collect()
    }

    /// All destinations that have ever subscribed (including emptied ones).
    pub fn destinations(&self) -> Vec<Destination> {
        self.table.lock().keys().cloned().collect()
    }

    /// Source → followers, sources in first-subscription order across
    /// destinations.
    pub fn by_source(&self) -> Vec<(Source, Vec<Destination>)> {
        let table = self.table.lock();
        let mut out: Vec<(Source, Vec<Destination>)> = Vec::new();
        for (dest, sources) in table.iter() {
            for source in sources {
                match out.iter_mut().find(|(s, _)| s == source) {
                    Some((_, dests)) => dests.push(dest.clone()),
                    None => out.push((source.clone(), vec![dest.clone()])),
                }
            }
        }
        out
    }

    fn persist(&self, destination: &Destination, sources: &[Source]) {
        if let Err(e) = self.store.save_subscriptions(destination, sources) {
            tracing::warn!(
                destination = %destination,
                error = %e,
                "Could not persist subscriptions, keeping them in memory"
            );
        }
    }
}
