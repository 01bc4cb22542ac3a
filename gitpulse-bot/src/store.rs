//! Persistent poller state backed by SQLite.
//!
//! Holds each source's seen-id history (plus its last validator token) and
//! each channel's subscription list. Lists are stored as JSON arrays so a
//! row is read and replaced as a whole.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::PersistenceError;
use crate::model::{Destination, Source};

/// What is persisted per source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredSeen {
    /// Announced event ids, oldest first.
    pub ids: Vec<String>,
    /// Revalidation token from the last successful fetch.
    pub validator: Option<String>,
}

/// Storage seam for the poller. Implementations must be cheap to call from
/// async code; every call is a single small read or write.
pub trait StateStore: Send + Sync {
    fn load_seen(&self, source: &Source) -> Result<Option<StoredSeen>, PersistenceError>;
    fn save_seen(&self, source: &Source, seen: &StoredSeen) -> Result<(), PersistenceError>;
    fn load_subscriptions(&self) -> Result<BTreeMap<Destination, Vec<Source>>, PersistenceError>;
    fn save_subscriptions(
        &self,
        destination: &Destination,
        sources: &[Source],
    ) -> Result<(), PersistenceError>;
}

/// SQLite implementation of [`StateStore`].
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the state database at the given path.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let db = Connection::open(path)?;
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self, PersistenceError> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS seen (
                source TEXT PRIMARY KEY,
                ids TEXT NOT NULL,
                validator TEXT
            );
            CREATE TABLE IF NOT EXISTS subscriptions (
                destination TEXT PRIMARY KEY,
                sources TEXT NOT NULL
            );",
        )?;
        Ok(Self { db: Mutex::new(db) })
    }
}

impl StateStore for SqliteStore {
    fn load_seen(&self, source: &Source) -> Result<Option<StoredSeen>, PersistenceError> {
        let db = self.db.lock();
        let row = db
            .query_row(
                "SELECT ids, validator FROM seen WHERE source = ?1",
                params![source.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        match row {
            Some((ids, validator)) => Ok(Some(StoredSeen {
                ids: serde_json::from_str(&ids)?,
                validator,
            })),
            None => Ok(None),
        }
    }

    fn save_seen(&self, source: &Source, seen: &StoredSeen) -> Result<(), PersistenceError> {
        let ids = serde_json::to_string(&seen.ids)?;
        let db = self.db.lock();
        db.execute(
            "INSERT OR REPLACE INTO seen (source, ids, validator) VALUES (?1, ?2, ?3)",
            params![source.as_str(), ids, seen.validator],
        )?;
        Ok(())
    }

    fn load_subscriptions(&self) -> Result<BTreeMap<Destination, Vec<Source>>, PersistenceError> {
        let db = self.db.lock();
        let mut stmt = db.prepare("SELECT destination, sources FROM subscriptions")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = BTreeMap::new();
        for (destination, sources) in rows {
            let Some(destination) = Destination::parse(&destination) else {
                tracing::warn!(%destination, "Ignoring stored subscriptions for invalid channel");
                continue;
            };
            let raw: Vec<String> = serde_json::from_str(&sources)?;
            let sources = raw.iter().filter_map(|s| Source::parse(s)).collect();
            out.insert(destination, sources);
        }
        Ok(out)
    }

    fn save_subscriptions(
        &self,
        destination: &Destination,
        sources: &[Source],
    ) -> Result<(), PersistenceError> {
        let raw: Vec<&str> = sources.iter().map(Source::as_str).collect();
        let json = serde_json::to_string(&raw)?;
        let db = self.db.lock();
        db.execute(
            "INSERT OR REPLACE INTO subscriptions (destination, sources) VALUES (?1, ?2)",
            params![destination.as_str(), json],
        )?;
        Ok(())
    }
}
