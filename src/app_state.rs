//! Shared application state injected into all Axum handlers.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::RelayConfig;
use crate::domain::{DigestValidator, EventValidator, SubscriberRegistry};
use crate::service::LiveStatus;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
///
/// Generic over the event store so tests can run the full relay on
/// [`crate::store::MemoryEventStore`].
pub struct AppState<S> {
    /// Event store shared by every session and the change listener.
    pub store: Arc<S>,
    /// Live subscriptions across all connections.
    pub registry: Arc<SubscriberRegistry>,
    /// Acceptance checks applied to submitted events.
    pub validator: Arc<dyn EventValidator>,
    /// Loaded configuration.
    pub config: Arc<RelayConfig>,
    /// Process-wide shutdown signal.
    pub shutdown: CancellationToken,
    /// Tracks session tasks so shutdown can wait for them.
    pub tracker: TaskTracker,
    /// Whether the change listener is delivering.
    pub live: LiveStatus,
}

impl<S> AppState<S> {
    /// Builds state around `store` with the default [`DigestValidator`].
    #[must_use]
    pub fn new(store: S, config: RelayConfig) -> Self {
        Self {
            store: Arc::new(store),
            registry: Arc::new(SubscriberRegistry::new(config.subscription_capacity)),
            validator: Arc::new(DigestValidator),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            live: LiveStatus::new(),
        }
    }

    /// Replaces the event validator.
    #[must_use]
    pub fn with_validator(mut self, validator: impl EventValidator) -> Self {
        self.validator = Arc::new(validator);
        self
    }
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            validator: Arc::clone(&self.validator),
            config: Arc::clone(&self.config),
            shutdown: self.shutdown.clone(),
            tracker: self.tracker.clone(),
            live: self.live.clone(),
        }
    }
}

impl<S> fmt::Debug for AppState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("shutdown", &self.shutdown.is_cancelled())
            .field("live", &self.live.is_active())
            .finish_non_exhaustive()
    }
}
