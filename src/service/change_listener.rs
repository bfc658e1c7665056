//! Change listener: store notifications → registry broadcast.
//!
//! A single long-lived task consumes the store's change feed, decodes each
//! payload into an [`Event`] and hands it to
//! [`SubscriberRegistry::broadcast`]. A bad payload is logged and skipped.
//! Transient feed errors are retried with exponential backoff capped at
//! [`MAX_BACKOFF`]. After too many consecutive failures live delivery is
//! marked degraded, and the flag clears on the next successful receive. Only
//! a closed feed stops the task. Historical queries keep working throughout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::domain::{Event, SubscriberRegistry};
use crate::error::RelayError;
use crate::store::{ChangeSource, EventStore, StoreError};

/// Upper bound for the retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Shared flag telling whether live delivery is running.
#[derive(Debug, Clone)]
pub struct LiveStatus(Arc<AtomicBool>);

impl LiveStatus {
    /// Creates a status that starts out active.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// `true` while the change listener is delivering.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Records that live delivery has stopped.
    pub fn set_degraded(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Records that live delivery is running again. Returns `true` if the
    /// status was degraded.
    pub fn set_active(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the listener loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// The shutdown token was cancelled.
    Shutdown,
    /// The change feed ended.
    FeedClosed,
}

/// Payload carried by a change notification: the full event, or just its
/// id when the event was too large to inline.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChangePayload {
    Full(Event),
    Reference { id: String },
}

/// Consumes a change feed and drives registry broadcasts.
#[derive(Debug)]
pub struct ChangeListener<S> {
    store: Arc<S>,
    registry: Arc<SubscriberRegistry>,
    status: LiveStatus,
    max_retries: u32,
    initial_backoff: Duration,
}

impl<S: EventStore> ChangeListener<S> {
    /// Creates a listener that resolves id-only payloads through `store`.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        registry: Arc<SubscriberRegistry>,
        status: LiveStatus,
        max_retries: u32,
        initial_backoff: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            status,
            max_retries: max_retries.max(1),
            initial_backoff,
        }
    }

    /// Runs until `shutdown` is cancelled or the feed closes.
    pub async fn run<C: ChangeSource>(
        self,
        mut changes: C,
        shutdown: CancellationToken,
    ) -> ListenerExit {
        tracing::info!("change listener started");
        let mut failures: u32 = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    tracing::info!("change listener stopping for shutdown");
                    return ListenerExit::Shutdown;
                }
                next = changes.recv() => next,
            };

            match next {
                Ok(payload) => {
                    if self.status.set_active() {
                        tracing::info!(failures, "change feed recovered; live delivery resumed");
                    }
                    failures = 0;
                    backoff = self.initial_backoff;
                    self.dispatch(&payload).await;
                }
                Err(StoreError::Closed) => {
                    self.status.set_degraded();
                    tracing::error!("change feed closed; live delivery degraded");
                    return ListenerExit::FeedClosed;
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let err = RelayError::Listener(err.to_string());
                    if failures == self.max_retries {
                        self.status.set_degraded();
                        tracing::error!(
                            error = %err,
                            failures,
                            "change feed still failing; live delivery degraded"
                        );
                    }
                    tracing::warn!(error = %err, failures, retry_in = ?backoff, "change feed receive failed");
                    tokio::select! {
                        () = shutdown.cancelled() => return ListenerExit::Shutdown,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Decodes one payload and broadcasts the resulting event.
    async fn dispatch(&self, payload: &str) {
        let event = match serde_json::from_str::<ChangePayload>(payload) {
            Ok(ChangePayload::Full(event)) => event,
            Ok(ChangePayload::Reference { id }) => match self.store.get(&id).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    tracing::warn!(event_id = %id, "notified event not found in store");
                    return;
                }
                Err(err) => {
                    tracing::warn!(event_id = %id, error = %err, "could not load notified event");
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed change payload");
                return;
            }
        };

        let event_id = event.id.clone();
        let report = self.registry.broadcast(Arc::new(event)).await;
        tracing::debug!(
            %event_id,
            matched = report.matched,
            delivered = report.delivered,
            dropped = report.dropped,
            "broadcast live event"
        );
    }
}
