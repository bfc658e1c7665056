//! In-process event store.
//!
//! Holds events in a map and publishes each inserted event's raw JSON on a
//! [`tokio::sync::broadcast`] channel, standing in for PostgreSQL
//! `NOTIFY`. Queries evaluate the compiled [`Predicate`] directly, with the
//! same per-branch caps and ordering as the SQL rendering.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};

use super::{ChangeSource, EventStore, Predicate, PutOutcome, StoreError, StoreResult};
use crate::domain::Event;

/// Capacity of the change feed ring buffer.
const CHANGE_FEED_CAPACITY: usize = 4096;

/// Map-backed [`EventStore`].
#[derive(Debug, Clone)]
pub struct MemoryEventStore {
    events: Arc<RwLock<HashMap<String, Arc<Event>>>>,
    changes: broadcast::Sender<String>,
}

impl MemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            events: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    /// Returns the number of stored events.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    /// Returns `true` if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Newest first; ties broken by ascending id.
fn newest_first(a: &Event, b: &Event) -> Ordering {
    b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
}

impl EventStore for MemoryEventStore {
    type Changes = MemoryChangeSource;

    async fn put(&self, event: &Event) -> StoreResult<PutOutcome> {
        let raw = serde_json::to_string(event).map_err(|e| StoreError::Invalid(e.to_string()))?;
        {
            let mut map = self.events.write().await;
            if map.contains_key(&event.id) {
                return Ok(PutOutcome::Duplicate);
            }
            map.insert(event.id.clone(), Arc::new(event.clone()));
        }
        // No receivers simply means no listener is running yet.
        let _ = self.changes.send(raw);
        Ok(PutOutcome::Inserted)
    }

    async fn query(&self, predicate: &Predicate) -> StoreResult<Vec<Event>> {
        let map = self.events.read().await;
        let mut selected: HashMap<&str, &Arc<Event>> = HashMap::new();
        for branch in predicate.branches() {
            let mut hits: Vec<&Arc<Event>> = map.values().filter(|e| branch.admits(e)).collect();
            hits.sort_by(|a, b| newest_first(a, b));
            let cap = branch
                .limit()
                .and_then(|l| usize::try_from(l).ok())
                .unwrap_or(usize::MAX);
            for event in hits.into_iter().take(cap) {
                selected.insert(event.id.as_str(), event);
            }
        }
        let mut events: Vec<Event> = selected.into_values().map(|e| Event::clone(e)).collect();
        events.sort_by(newest_first);
        Ok(events)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Event>> {
        Ok(self.events.read().await.get(id).map(|e| Event::clone(e)))
    }

    async fn changes(&self) -> StoreResult<MemoryChangeSource> {
        Ok(MemoryChangeSource {
            receiver: self.changes.subscribe(),
        })
    }

    async fn close(&self) {}
}

/// Change feed over the in-process broadcast channel.
#[derive(Debug)]
pub struct MemoryChangeSource {
    receiver: broadcast::Receiver<String>,
}

impl ChangeSource for MemoryChangeSource {
    async fn recv(&mut self) -> StoreResult<String> {
        match self.receiver.recv().await {
            Ok(raw) => Ok(raw),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(StoreError::Unavailable(format!(
                "change feed lagged, {n} notifications lost"
            ))),
            Err(broadcast::error::RecvError::Closed) => Err(StoreError::Closed),
        }
    }
}
