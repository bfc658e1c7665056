//! Process-wide registry of live subscriptions.
//!
//! [`SubscriberRegistry`] maps each [`SubscriptionKey`] to its filter group
//! and the sending half of a bounded delivery channel. Sessions register
//! and remove entries; the change listener calls
//! [`SubscriberRegistry::broadcast`] for every newly stored event.
//!
//! # Concurrency
//!
//! - The map sits behind a [`tokio::sync::RwLock`]; subscribe and
//!   unsubscribe take the write lock, broadcast takes the read lock, so
//!   every broadcast sees a consistent snapshot.
//! - Broadcast never awaits a subscriber: it uses `try_send` and drops the
//!   event for any subscriber whose channel is full.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, mpsc};

use super::{ConnectionId, Event, FilterGroup, SubscriptionKey};
use crate::error::RelayError;

/// Registered subscription: its filters and delivery channel.
#[derive(Debug)]
struct Subscriber {
    filters: FilterGroup,
    sender: mpsc::Sender<Arc<Event>>,
    dropped: AtomicU64,
}

/// Outcome of one [`SubscriberRegistry::broadcast`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscriptions whose filters matched.
    pub matched: usize,
    /// Matching subscriptions the event was enqueued for.
    pub delivered: usize,
    /// Matching subscriptions whose channel was full.
    pub dropped: usize,
    /// Matching subscriptions whose receiver is already gone.
    pub closed: usize,
}

/// Concurrent map from subscription key to live subscriber.
#[derive(Debug)]
pub struct SubscriberRegistry {
    entries: RwLock<HashMap<SubscriptionKey, Subscriber>>,
    capacity: usize,
    dropped_total: AtomicU64,
}

impl SubscriberRegistry {
    /// Creates an empty registry whose delivery channels hold `capacity`
    /// events (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Registers a subscription and returns its delivery channel.
    ///
    /// An existing entry under the same key is evicted; dropping its sender
    /// closes the old channel so its consumer observes the end of stream.
    pub async fn subscribe(
        &self,
        key: SubscriptionKey,
        filters: FilterGroup,
    ) -> mpsc::Receiver<Arc<Event>> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let subscriber = Subscriber {
            filters,
            sender,
            dropped: AtomicU64::new(0),
        };
        let replaced = self.entries.write().await.insert(key.clone(), subscriber);
        if replaced.is_some() {
            tracing::debug!(subscription = %key, "replaced existing subscription");
        }
        receiver
    }

    /// Removes a subscription. Returns `true` if it was registered.
    pub async fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// Removes every subscription owned by `connection`, returning how many
    /// were removed.
    pub async fn unsubscribe_connection(&self, connection: ConnectionId) -> usize {
        let mut map = self.entries.write().await;
        let before = map.len();
        map.retain(|key, _| key.connection != connection);
        before.saturating_sub(map.len())
    }

    /// Offers `event` to every subscription whose filters match it.
    ///
    /// Never blocks on a subscriber. A full channel drops the event for
    /// that subscriber only and is counted.
    pub async fn broadcast(&self, event: Arc<Event>) -> BroadcastReport {
        let map = self.entries.read().await;
        let mut report = BroadcastReport::default();
        for (key, subscriber) in map.iter() {
            if !subscriber.filters.matches(&event) {
                continue;
            }
            report.matched += 1;
            match subscriber.sender.try_send(Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    report.dropped += 1;
                    subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    let err = RelayError::DeliveryOverflow(key.clone());
                    tracing::warn!(event_id = %event.id, error = %err, "dropping live event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    report.closed += 1;
                    tracing::debug!(subscription = %key, "delivery channel already closed");
                }
            }
        }
        report
    }

    /// Returns `true` if `key` is registered.
    pub async fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.read().await.contains_key(key)
    }

    /// Returns how many events were dropped for `key` because its channel
    /// was full, or `None` if it is not registered.
    pub async fn dropped_for(&self, key: &SubscriptionKey) -> Option<u64> {
        self.entries
            .read()
            .await
            .get(key)
            .map(|s| s.dropped.load(Ordering::Relaxed))
    }

    /// Returns the number of events dropped across all subscribers since
    /// startup.
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Returns the number of live subscriptions.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns `true` if no subscription is registered.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{Filter, SubscriptionId};

    fn key(connection: ConnectionId, id: &str) -> SubscriptionKey {
        let Ok(sub) = SubscriptionId::new(id) else {
            panic!("valid subscription id");
        };
        SubscriptionKey::new(connection, sub)
    }

    fn event(id: &str, pubkey: &str, kind: u16) -> Arc<Event> {
        Arc::new(Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at: 100,
            kind,
            tags: Vec::new(),
            content: String::new(),
            sig: String::new(),
        })
    }

    #[tokio::test]
    async fn matching_subscriber_receives_event_once() {
        let registry = SubscriberRegistry::new(8);
        let k = key(ConnectionId::new(), "s1");
        let mut rx = registry
            .subscribe(k, Filter::new().authors(["pk1"]).into())
            .await;

        let report = registry.broadcast(event("a1", "pk1", 1)).await;
        assert_eq!(report.delivered, 1);

        let Some(received) = rx.recv().await else {
            panic!("expected an event");
        };
        assert_eq!(received.id, "a1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_matching_subscriber_is_skipped() {
        let registry = SubscriberRegistry::new(8);
        let mut rx = registry
            .subscribe(key(ConnectionId::new(), "s1"), Filter::new().kinds([2]).into())
            .await;

        let report = registry.broadcast(event("a1", "pk1", 1)).await;
        assert_eq!(report, BroadcastReport::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let registry = SubscriberRegistry::new(8);
        let k = key(ConnectionId::new(), "s1");
        let mut rx = registry.subscribe(k.clone(), Filter::new().into()).await;

        assert!(registry.unsubscribe(&k).await);
        assert!(!registry.unsubscribe(&k).await);

        let report = registry.broadcast(event("a1", "pk1", 1)).await;
        assert_eq!(report.matched, 0);
        // Sender was dropped with the entry.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_channel_drops_without_blocking_others() {
        let registry = SubscriberRegistry::new(1);
        let slow = key(ConnectionId::new(), "slow");
        let fast = key(ConnectionId::new(), "fast");
        let _slow_rx = registry.subscribe(slow.clone(), Filter::new().into()).await;
        let mut fast_rx = registry.subscribe(fast, Filter::new().into()).await;

        let first = registry.broadcast(event("a1", "pk", 1)).await;
        assert_eq!(first.delivered, 2);
        let Some(_) = fast_rx.recv().await else {
            panic!("fast subscriber should get the first event");
        };

        let second = registry.broadcast(event("a2", "pk", 1)).await;
        assert_eq!(second.delivered, 1);
        assert_eq!(second.dropped, 1);
        let Some(received) = fast_rx.recv().await else {
            panic!("fast subscriber should get the second event");
        };
        assert_eq!(received.id, "a2");
        assert_eq!(registry.dropped_for(&slow).await, Some(1));
        assert_eq!(registry.dropped_total(), 1);
    }

    #[tokio::test]
    async fn resubscribe_replaces_and_closes_old_channel() {
        let registry = SubscriberRegistry::new(8);
        let k = key(ConnectionId::new(), "s1");
        let mut old_rx = registry.subscribe(k.clone(), Filter::new().kinds([1]).into()).await;
        let mut new_rx = registry.subscribe(k, Filter::new().kinds([2]).into()).await;

        assert_eq!(registry.len().await, 1);
        assert!(old_rx.recv().await.is_none());

        let _ = registry.broadcast(event("a2", "pk", 2)).await;
        let Some(received) = new_rx.recv().await else {
            panic!("replacement should receive kind 2");
        };
        assert_eq!(received.kind, 2);
    }

    #[tokio::test]
    async fn same_id_on_two_connections_does_not_collide() {
        let registry = SubscriberRegistry::new(8);
        let mut rx_a = registry
            .subscribe(key(ConnectionId::new(), "feed"), Filter::new().into())
            .await;
        let mut rx_b = registry
            .subscribe(key(ConnectionId::new(), "feed"), Filter::new().into())
            .await;

        let report = registry.broadcast(event("a1", "pk", 1)).await;
        assert_eq!(report.delivered, 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn unsubscribe_connection_removes_only_its_entries() {
        let registry = SubscriberRegistry::new(8);
        let conn = ConnectionId::new();
        let _a = registry.subscribe(key(conn, "a"), Filter::new().into()).await;
        let _b = registry.subscribe(key(conn, "b"), Filter::new().into()).await;
        let other = key(ConnectionId::new(), "a");
        let _c = registry.subscribe(other.clone(), Filter::new().into()).await;

        assert_eq!(registry.unsubscribe_connection(conn).await, 2);
        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(&other).await);
    }

    #[tokio::test]
    async fn dropped_receiver_is_reported_as_closed() {
        let registry = SubscriberRegistry::new(8);
        let rx = registry
            .subscribe(key(ConnectionId::new(), "gone"), Filter::new().into())
            .await;
        drop(rx);

        let report = registry.broadcast(event("a1", "pk", 1)).await;
        assert_eq!(report.closed, 1);
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn concurrent_subscribe_and_broadcast() {
        let registry = Arc::new(SubscriberRegistry::new(64));
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let k = key(ConnectionId::new(), &format!("s{i}"));
                let _rx = registry.subscribe(k.clone(), Filter::new().into()).await;
                let _ = registry.broadcast(event(&format!("e{i}"), "pk", 1)).await;
                registry.unsubscribe(&k).await
            }));
        }
        for handle in handles {
            let Ok(removed) = handle.await else {
                panic!("task panicked");
            };
            assert!(removed);
        }
        assert!(registry.is_empty().await);
    }
}
