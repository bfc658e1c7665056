//! PostgreSQL implementation of the event store.
//!
//! Events live in a single `event` table (see `migrations/`). An
//! `AFTER INSERT` trigger publishes each new row on the [`NOTIFY_CHANNEL`],
//! which [`PgChangeSource`] consumes through a dedicated [`PgListener`]
//! connection.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};

use super::predicate::TagProjection;
use super::{ChangeSource, EventStore, Predicate, PutOutcome, StoreError, StoreResult};
use crate::config::RelayConfig;
use crate::domain::Event;

/// Channel the insert trigger notifies on.
pub const NOTIFY_CHANNEL: &str = "nostr_event";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// PostgreSQL-backed event store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Creates a store over an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool sized from `config` and applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be
    /// reached or the schema cannot be migrated.
    pub async fn connect(config: &RelayConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connect_timeout_secs))
            .connect(&config.database_url)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Applies the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if a migration fails.
    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))
    }
}

fn decode_raw(raw: &str) -> StoreResult<Event> {
    serde_json::from_str(raw).map_err(|e| StoreError::Decode(e.to_string()))
}

impl EventStore for PgEventStore {
    type Changes = PgChangeSource;

    async fn put(&self, event: &Event) -> StoreResult<PutOutcome> {
        let raw = serde_json::to_string(event).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let tags = TagProjection::of(event);

        let result = sqlx::query(
            "INSERT INTO event (id, pubkey, kind, created_at, sig, content, raw, etags, ptags, tagvalues) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(i32::from(event.kind))
        .bind(event.created_at_i64())
        .bind(&event.sig)
        .bind(&event.content)
        .bind(raw)
        .bind(tags.etags)
        .bind(tags.ptags)
        .bind(tags.tagvalues)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(PutOutcome::Duplicate)
        } else {
            Ok(PutOutcome::Inserted)
        }
    }

    async fn query(&self, predicate: &Predicate) -> StoreResult<Vec<Event>> {
        let Some(mut qb) = predicate.to_query() else {
            return Ok(Vec::new());
        };
        let rows = qb
            .build_query_scalar::<String>()
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|raw| decode_raw(raw)).collect()
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Event>> {
        let raw = sqlx::query_scalar::<_, String>("SELECT raw FROM event WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        raw.as_deref().map(decode_raw).transpose()
    }

    async fn changes(&self) -> StoreResult<PgChangeSource> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        Ok(PgChangeSource { listener })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Change feed backed by `LISTEN nostr_event`.
///
/// [`PgListener`] reconnects on its own after a dropped connection;
/// notifications sent while disconnected are lost.
#[derive(Debug)]
pub struct PgChangeSource {
    listener: PgListener,
}

impl ChangeSource for PgChangeSource {
    async fn recv(&mut self) -> StoreResult<String> {
        let notification = self.listener.recv().await?;
        Ok(notification.payload().to_string())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn decode_raw_rejects_garbage() {
        assert!(matches!(decode_raw("{not json"), Err(StoreError::Decode(_))));
    }

    #[test]
    fn decode_raw_accepts_stored_shape() {
        let raw = r#"{"id":"a1","pubkey":"pk","created_at":100,"kind":1,"tags":[["e","b2"]],"content":"","sig":""}"#;
        let Ok(event) = decode_raw(raw) else {
            panic!("stored shape should decode");
        };
        assert_eq!(event.tag_values("e").collect::<Vec<_>>(), vec!["b2"]);
    }
}
