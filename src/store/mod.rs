//! Event store contract and its adapters.
//!
//! The relay treats storage as a black box offering four things: an
//! idempotent `put`, a `query` driven by a compiled [`Predicate`], a lookup
//! by id, and a change feed that yields one raw payload per successful
//! insert. [`PgEventStore`] implements it on PostgreSQL with
//! `LISTEN`/`NOTIFY`; [`MemoryEventStore`] implements it in-process for
//! tests and local development.

pub mod memory;
pub mod postgres;
pub mod predicate;

use std::future::Future;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;
pub use predicate::{Predicate, compile};

use crate::domain::Event;

/// Errors raised by an [`EventStore`] or its [`ChangeSource`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store refused the record.
    #[error("invalid record: {0}")]
    Invalid(String),

    /// The store could not be reached or the operation failed transiently.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored or notified payload could not be decoded.
    #[error("could not decode stored event: {0}")]
    Decode(String),

    /// The change feed has ended and will not produce further payloads.
    #[error("change feed closed")]
    Closed,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => Self::Invalid(db.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Decode(err.to_string())
            }
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Whether a `put` stored a new row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The event was new and is now stored.
    Inserted,
    /// An event with the same id already existed; nothing changed.
    Duplicate,
}

/// Durable event storage consumed by the relay.
///
/// Implementations must be safe for concurrent `put`/`query` from many
/// sessions.
pub trait EventStore: Send + Sync + 'static {
    /// Change feed type returned by [`EventStore::changes`].
    type Changes: ChangeSource;

    /// Stores an event. A duplicate id is reported as
    /// [`PutOutcome::Duplicate`], not as an error.
    fn put(&self, event: &Event) -> impl Future<Output = StoreResult<PutOutcome>> + Send;

    /// Returns the events selected by `predicate`, newest first, with each
    /// branch capped at its own limit.
    fn query(&self, predicate: &Predicate) -> impl Future<Output = StoreResult<Vec<Event>>> + Send;

    /// Looks up one event by id.
    fn get(&self, id: &str) -> impl Future<Output = StoreResult<Option<Event>>> + Send;

    /// Opens a change feed yielding one raw payload per successful insert.
    fn changes(&self) -> impl Future<Output = StoreResult<Self::Changes>> + Send;

    /// Releases the store's resources.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Continuous stream of raw change payloads.
pub trait ChangeSource: Send + 'static {
    /// Waits for the next payload.
    ///
    /// [`StoreError::Closed`] means the feed is finished; any other error
    /// is transient and the caller may retry.
    fn recv(&mut self) -> impl Future<Output = StoreResult<String>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_closed_is_unavailable() {
        let err = StoreError::from(sqlx::Error::PoolClosed);
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn row_not_found_is_unavailable() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
