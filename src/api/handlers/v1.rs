//! Version 1: every call carries an API key, no reservations

use axum::extract::{Path, Query, State};
use serde::Deserialize;

use super::{cooldown, report, site_named};
use crate::api::response::ApiResponse;
use crate::api::server::AppState;
use crate::error::ZartanError;
use crate::pool::Outcome;

const UNRECOGNIZED_KEY: &str = "Unrecognized API Key";

#[derive(Debug, Deserialize, Default)]
pub struct KeyQuery {
    pub api_key: Option<String>,
    pub older_than: Option<i64>,
}

/// Select the least recently used proxy of a site
pub async fn get_proxy(
    State(state): State<AppState>,
    Path(site_name): Path<String>,
    Query(query): Query<KeyQuery>,
) -> Result<ApiResponse, ZartanError> {
    if !state.is_known_key(query.api_key.as_deref()) {
        return Ok(ApiResponse::error(UNRECOGNIZED_KEY));
    }
    let Some(site) = site_named(&state, &site_name).await? else {
        return Ok(ApiResponse::error("Invalid site name"));
    };

    let result = state
        .pool
        .select_proxy(site.id, cooldown(query.older_than))
        .await?;
    Ok(ApiResponse::from_result(result, state.default_retry))
}

pub async fn succeeded(
    State(state): State<AppState>,
    Path((site_name, proxy_id)): Path<(String, i64)>,
    Query(query): Query<KeyQuery>,
) -> Result<ApiResponse, ZartanError> {
    report_result(state, site_name, proxy_id, query, Outcome::Succeeded).await
}

pub async fn failed(
    State(state): State<AppState>,
    Path((site_name, proxy_id)): Path<(String, i64)>,
    Query(query): Query<KeyQuery>,
) -> Result<ApiResponse, ZartanError> {
    report_result(state, site_name, proxy_id, query, Outcome::Failed).await
}

async fn report_result(
    state: AppState,
    site_name: String,
    proxy_id: i64,
    query: KeyQuery,
    outcome: Outcome,
) -> Result<ApiResponse, ZartanError> {
    if !state.is_known_key(query.api_key.as_deref()) {
        return Ok(ApiResponse::error(UNRECOGNIZED_KEY));
    }
    let Some(site) = site_named(&state, &site_name).await? else {
        return Ok(ApiResponse::error("Invalid site name"));
    };
    report(&state, &site, proxy_id, outcome).await?;
    Ok(ApiResponse::success())
}

#[cfg(test)]
mod tests {
    use super::super::testing::{ApiFixture, API_KEY};
    use crate::jobs::Job;
    use crate::store::DurableStore;
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_key_is_rejected() {
        let api = ApiFixture::new();
        let (status, body) = api.call(Method::GET, "/v1/example.com?api_key=nope").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"result": "error", "reason": "Unrecognized API Key"}));
    }

    #[tokio::test]
    async fn test_get_proxy_then_cooldown() {
        let api = ApiFixture::new();
        let (_, ids) = api.seed("example.com", 1).await;

        let (_, body) = api
            .call(Method::GET, &format!("/v1/example.com?api_key={}", API_KEY))
            .await;
        assert_eq!(body["result"], "success");
        assert_eq!(body["payload"]["id"], ids[0]);
        assert_eq!(body["payload"]["port"], 8080);

        let (_, body) = api
            .call(
                Method::GET,
                &format!("/v1/example.com?api_key={}&older_than=30", API_KEY),
            )
            .await;
        assert_eq!(body, json!({"result": "please_retry", "interval": 30}));
    }

    #[tokio::test]
    async fn test_new_site_has_no_proxy_yet() {
        let api = ApiFixture::new();
        let (_, body) = api
            .call(Method::GET, &format!("/v1/fresh.example?api_key={}", API_KEY))
            .await;

        assert_eq!(body, json!({"result": "please_retry", "interval": 5}));
        let sites = api.fx.durable.list_sites().await.unwrap();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].max_proxies, 10);
    }

    #[tokio::test]
    async fn test_report_for_unknown_proxy_is_success() {
        let api = ApiFixture::new();
        let (status, body) = api
            .call(
                Method::POST,
                &format!("/v1/example.com/999/failed?api_key={}", API_KEY),
            )
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"result": "success"}));
    }

    #[tokio::test]
    async fn test_failures_reach_threshold() {
        let api = ApiFixture::new();
        let (site, ids) = api.seed("example.com", 1).await;
        let uri = format!("/v1/example.com/{}/failed?api_key={}", ids[0], API_KEY);

        api.call(Method::POST, &uri).await;
        api.call(Method::POST, &uri).await;

        assert!(api.fx.jobs.jobs().contains(&Job::TargetedPerformanceAnalyzer {
            site_id: site.id,
            proxy_id: ids[0]
        }));
    }
}
