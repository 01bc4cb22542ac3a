//! Error types for the fetch and persistence seams.

use chrono::{DateTime, Utc};

/// Why a source could not be fetched this time around.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transport failure, server error, or a payload we could not parse.
    /// Retried on the next cycle.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// The API quota is exhausted until `reset_at` (if the server said).
    #[error("rate limited")]
    RateLimited { reset_at: Option<DateTime<Utc>> },
    /// The source does not exist or is not visible with our credentials.
    #[error("not found")]
    NotFound,
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Transient(e.to_string())
    }
}

/// Failure to read or write persisted poller state.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt stored value: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("state store unavailable")]
    Unavailable,
}
