//! Relay server: router assembly, listener start-up and coordinated
//! shutdown.
//!
//! [`serve`] opens the store's change feed and starts the
//! [`ChangeListener`] before accepting connections. When the shared
//! shutdown token is cancelled, axum stops accepting, every session and the
//! listener observe the same token, and the server waits for tracked tasks
//! up to the configured grace period before closing the store.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::app_state::AppState;
use crate::error::RelayError;
use crate::service::ChangeListener;
use crate::store::EventStore;
use crate::ws::handler::relay_handler;

/// Builds the complete router: relay endpoint, system endpoints, OpenAPI.
pub fn build_router<S: EventStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/", get(relay_handler::<S>))
        .merge(api::build_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs the relay on `listener` until `state.shutdown` is cancelled.
///
/// # Errors
///
/// Returns [`RelayError::Storage`] if the change feed cannot be opened, or
/// [`RelayError::Transport`] if the HTTP server fails.
pub async fn serve<S: EventStore>(
    state: AppState<S>,
    listener: TcpListener,
) -> Result<(), RelayError> {
    let changes = state.store.changes().await?;
    let change_listener = ChangeListener::new(
        Arc::clone(&state.store),
        Arc::clone(&state.registry),
        state.live.clone(),
        state.config.listener_max_retries,
        Duration::from_millis(state.config.listener_backoff_ms),
    );
    state
        .tracker
        .spawn(change_listener.run(changes, state.shutdown.clone()));

    let shutdown = state.shutdown.clone();
    let tracker = state.tracker.clone();
    let store = Arc::clone(&state.store);
    let grace = state.config.shutdown_grace();

    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "relay listening");
    }
    let served = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;
    if let Err(err) = &served {
        tracing::error!(error = %err, "http server failed");
        shutdown.cancel();
    }

    tracing::info!("draining sessions");
    tracker.close();
    if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
        tracing::warn!(
            remaining = tracker.len(),
            ?grace,
            "grace period elapsed with tasks still running"
        );
    }
    store.close().await;
    tracing::info!("relay stopped");

    served.map_err(|e| RelayError::Transport(e.to_string()))
}
