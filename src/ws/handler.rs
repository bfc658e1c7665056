//! Axum WebSocket upgrade handler.

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;

use super::session::Session;
use crate::api::handlers::system::{RelayInfo, root_response};
use crate::app_state::AppState;
use crate::error::RelayError;
use crate::store::EventStore;

/// `GET /`: upgrade to the relay protocol, or describe the relay.
///
/// Upgrade requests start a [`Session`] tracked by the relay's task
/// tracker. Plain requests get the information document or a banner.
#[utoipa::path(
    get,
    path = "/",
    tag = "Relay",
    summary = "Relay endpoint",
    description = "WebSocket upgrade for NIP-01 clients. Without upgrade headers, returns the NIP-11 information document when `Accept: application/nostr+json` is sent, otherwise a text banner.",
    responses(
        (status = 101, description = "Switching to the relay protocol"),
        (status = 200, description = "Relay information document", body = RelayInfo, content_type = "application/nostr+json"),
        (status = 503, description = "Relay is shutting down"),
    )
)]
pub async fn relay_handler<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(ws) = upgrade else {
        return root_response(&state, &headers);
    };
    if state.shutdown.is_cancelled() {
        return RelayError::ShutdownInProgress.into_response();
    }

    let session = Session::new(&state);
    let tracker = state.tracker.clone();
    tracing::debug!(connection = %session.connection(), "websocket upgrade");
    ws.on_upgrade(move |socket| {
        let (sink, stream) = socket.split();
        tracker.track_future(session.run(sink, stream))
    })
    .into_response()
}
