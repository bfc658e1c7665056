//! HTTP API layer: system endpoints and the OpenAPI document.
//!
//! Everything here is mounted at the root next to the WebSocket endpoint.

pub mod handlers;

use axum::Router;
use utoipa::OpenApi;

use crate::app_state::AppState;
use crate::store::EventStore;

/// Path serving the generated OpenAPI document.
pub const OPENAPI_PATH: &str = "/api-docs/openapi.json";

/// OpenAPI description of the relay's HTTP surface.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "nostr-relay",
        description = "NOSTR relay with PostgreSQL storage and live subscription fan-out"
    ),
    paths(
        crate::ws::handler::relay_handler,
        handlers::system::health_handler,
    ),
    components(schemas(
        handlers::system::HealthResponse,
        handlers::system::RelayInfo,
        handlers::system::RelayLimitation,
    )),
    tags(
        (name = "Relay", description = "WebSocket endpoint and relay information"),
        (name = "System", description = "Operational endpoints"),
    )
)]
pub struct ApiDoc;

/// Builds the HTTP API router.
pub fn build_router<S: EventStore>() -> Router<AppState<S>> {
    let router = Router::new().merge(handlers::system::routes());

    #[cfg(feature = "swagger-ui")]
    let router = router.merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger-ui").url(OPENAPI_PATH, ApiDoc::openapi()),
    );

    #[cfg(not(feature = "swagger-ui"))]
    let router = router.route(
        OPENAPI_PATH,
        axum::routing::get(|| async { axum::Json(ApiDoc::openapi()) }),
    );

    router
}
