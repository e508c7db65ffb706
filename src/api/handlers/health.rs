//! Health check endpoint

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::api::server::AppState;

/// Health check endpoint; unhealthy while the durable store is unreachable
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    match state.durable.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": "zartan",
                "database": "ok",
                "uptime_seconds": uptime,
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "zartan",
                    "database": e.to_string(),
                    "uptime_seconds": uptime,
                })),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::ApiFixture;
    use axum::http::{Method, StatusCode};

    #[tokio::test]
    async fn test_health_check() {
        let api = ApiFixture::new();
        let (status, body) = api.call(Method::GET, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "zartan");
        assert_eq!(body["database"], "ok");
    }

    #[tokio::test]
    async fn test_health_check_reports_unreachable_database() {
        let api = ApiFixture::new();
        api.fx.durable.set_offline(true);

        let (status, body) = api.call(Method::GET, "/health").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["database"], "Database connection failed: store is offline");
    }
}
