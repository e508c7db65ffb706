//! API route definitions

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::server::AppState;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/v1", version1_routes())
        .nest("/v2", version2_routes())
        .with_state(state)
}

/// Stateless access keyed by API key
fn version1_routes() -> Router<AppState> {
    Router::new()
        .route("/:site_name", get(handlers::v1::get_proxy))
        .route("/:site_name/:proxy_id/succeeded", post(handlers::v1::succeeded))
        .route("/:site_name/:proxy_id/failed", post(handlers::v1::failed))
}

/// Client sessions with proxy reservations
fn version2_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/authenticate",
            get(handlers::v2::authenticate).post(handlers::v2::authenticate),
        )
        .route("/:site_name", get(handlers::v2::get_proxy))
        .route("/:site_name/:proxy_id/succeeded", post(handlers::v2::succeeded))
        .route("/:site_name/:proxy_id/failed", post(handlers::v2::failed))
}
