//! System endpoints: health check and relay information document.

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;
use crate::domain::subscription::MAX_SUBSCRIPTION_ID_LEN;
use crate::store::EventStore;

/// Media type clients send in `Accept` to request the information document.
pub const NOSTR_JSON: &str = "application/nostr+json";

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `healthy`, or `draining` once shutdown has begun.
    status: String,
    /// `active` while the change listener runs, `degraded` after it stops.
    live_delivery: String,
    /// Live subscriptions across all connections.
    subscriptions: usize,
    /// Crate version.
    version: String,
    /// RFC 3339 server time.
    timestamp: String,
}

/// `GET /health`: relay health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns relay status, live-delivery state, subscription count, version and timestamp.",
    responses(
        (status = 200, description = "Relay status", body = HealthResponse),
    )
)]
pub async fn health_handler<S: EventStore>(State(state): State<AppState<S>>) -> impl IntoResponse {
    let status = if state.shutdown.is_cancelled() {
        "draining"
    } else {
        "healthy"
    };
    let live_delivery = if state.live.is_active() {
        "active"
    } else {
        "degraded"
    };
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: status.to_string(),
            live_delivery: live_delivery.to_string(),
            subscriptions: state.registry.len().await,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }),
    )
}

/// Server-side limits advertised in the information document.
#[derive(Debug, Serialize, ToSchema)]
pub struct RelayLimitation {
    /// Largest `limit` honoured per filter.
    max_limit: u64,
    /// Longest accepted subscription id.
    max_subid_length: usize,
}

/// Relay information document (NIP-11).
#[derive(Debug, Serialize, ToSchema)]
pub struct RelayInfo {
    /// Relay name.
    name: String,
    /// Relay description.
    description: String,
    /// Implemented NIPs.
    supported_nips: Vec<u32>,
    /// Software identifier.
    software: String,
    /// Software version.
    version: String,
    /// Server-side limits.
    limitation: RelayLimitation,
}

impl RelayInfo {
    /// Builds the document from the relay configuration.
    #[must_use]
    pub fn from_state<S>(state: &AppState<S>) -> Self {
        Self {
            name: state.config.relay_name.clone(),
            description: state.config.relay_description.clone(),
            supported_nips: vec![1, 11],
            software: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            limitation: RelayLimitation {
                max_limit: state.config.max_limit,
                max_subid_length: MAX_SUBSCRIPTION_ID_LEN,
            },
        }
    }
}

/// Whether the request's `Accept` header asks for the information document.
#[must_use]
pub fn wants_relay_info(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains(NOSTR_JSON))
}

/// Response for a plain HTTP `GET /`: the information document when asked
/// for, otherwise a short banner.
pub fn root_response<S>(state: &AppState<S>, headers: &HeaderMap) -> Response {
    if wants_relay_info(headers) {
        let mut response = Json(RelayInfo::from_state(state)).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(NOSTR_JSON));
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        return response;
    }
    (
        StatusCode::OK,
        format!(
            "{}: connect with a NOSTR client over WebSocket.\n",
            state.config.relay_name
        ),
    )
        .into_response()
}

/// System routes mounted at the root level.
pub fn routes<S: EventStore>() -> Router<AppState<S>> {
    Router::new().route("/health", get(health_handler::<S>))
}
