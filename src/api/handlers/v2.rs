//! Version 2: clients authenticate once and hold proxy reservations

use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::json;

use super::{cooldown, report, site_named};
use crate::api::response::ApiResponse;
use crate::api::server::AppState;
use crate::error::ZartanError;
use crate::pool::Outcome;

const UNRECOGNIZED_CLIENT: &str = "Unrecognized client id";

#[derive(Debug, Deserialize, Default)]
pub struct AuthenticateQuery {
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ClientQuery {
    pub client_id: Option<String>,
    pub older_than: Option<i64>,
}

/// Exchange an API key for a client id
pub async fn authenticate(
    State(state): State<AppState>,
    Query(query): Query<AuthenticateQuery>,
) -> Result<ApiResponse, ZartanError> {
    if !state.is_known_key(query.api_key.as_deref()) {
        return Ok(ApiResponse::error("Unrecognized API Key"));
    }
    let client = state.leases.authenticate().await?;
    Ok(ApiResponse::success_with(json!({ "client_id": client.id })))
}

/// Select a proxy, answering from the client's reservation when it has one
pub async fn get_proxy(
    State(state): State<AppState>,
    Path(site_name): Path<String>,
    Query(query): Query<ClientQuery>,
) -> Result<ApiResponse, ZartanError> {
    let Some(client_id) = valid_client(&state, &query).await? else {
        return Ok(ApiResponse::error(UNRECOGNIZED_CLIENT));
    };
    let Some(site) = site_named(&state, &site_name).await? else {
        return Ok(ApiResponse::error("Invalid site name"));
    };

    let result = state
        .leases
        .get_proxy(client_id, site.id, cooldown(query.older_than))
        .await?;
    Ok(ApiResponse::from_result(result, state.default_retry))
}

pub async fn succeeded(
    State(state): State<AppState>,
    Path((site_name, proxy_id)): Path<(String, i64)>,
    Query(query): Query<ClientQuery>,
) -> Result<ApiResponse, ZartanError> {
    report_result(state, site_name, proxy_id, query, Outcome::Succeeded).await
}

pub async fn failed(
    State(state): State<AppState>,
    Path((site_name, proxy_id)): Path<(String, i64)>,
    Query(query): Query<ClientQuery>,
) -> Result<ApiResponse, ZartanError> {
    report_result(state, site_name, proxy_id, query, Outcome::Failed).await
}

async fn report_result(
    state: AppState,
    site_name: String,
    proxy_id: i64,
    query: ClientQuery,
    outcome: Outcome,
) -> Result<ApiResponse, ZartanError> {
    let Some(client_id) = valid_client(&state, &query).await? else {
        return Ok(ApiResponse::error(UNRECOGNIZED_CLIENT));
    };
    let Some(site) = site_named(&state, &site_name).await? else {
        return Ok(ApiResponse::error("Invalid site name"));
    };
    report(&state, &site, proxy_id, outcome).await?;
    state.leases.touch(client_id).await?;
    Ok(ApiResponse::success())
}

async fn valid_client<'q>(state: &AppState, query: &'q ClientQuery) -> Result<Option<&'q str>, ZartanError> {
    let Some(client_id) = query.client_id.as_deref() else {
        return Ok(None);
    };
    if state.leases.is_valid(client_id).await? {
        Ok(Some(client_id))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{ApiFixture, API_KEY};
    use axum::http::Method;
    use serde_json::json;
    use std::time::Duration;

    async fn authenticate(api: &ApiFixture) -> String {
        let (_, body) = api
            .call(Method::POST, &format!("/v2/authenticate?api_key={}", API_KEY))
            .await;
        assert_eq!(body["result"], "success");
        body["payload"]["client_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_authenticate_rejects_unknown_key() {
        let api = ApiFixture::new();
        let (_, body) = api.call(Method::POST, "/v2/authenticate?api_key=nope").await;

        assert_eq!(body, json!({"result": "error", "reason": "Unrecognized API Key"}));
    }

    #[tokio::test]
    async fn test_unknown_client_is_rejected() {
        let api = ApiFixture::new();
        let (_, body) = api.call(Method::GET, "/v2/example.com?client_id=ghost").await;

        assert_eq!(body, json!({"result": "error", "reason": "Unrecognized client id"}));
    }

    #[tokio::test]
    async fn test_reservation_is_honored() {
        let api = ApiFixture::new();
        let (_, ids) = api.seed("example.com", 1).await;
        let client = authenticate(&api).await;
        let uri = format!("/v2/example.com?client_id={}&older_than=60", client);

        // Fresh proxies have never been used, so the first ask succeeds.
        let (_, body) = api.call(Method::GET, &uri).await;
        assert_eq!(body["payload"]["id"], ids[0]);

        api.fx.clock.advance(Duration::from_secs(20));
        let (_, body) = api.call(Method::GET, &uri).await;
        assert_eq!(body, json!({"result": "please_retry", "interval": 40}));

        api.fx.clock.advance(Duration::from_secs(15));
        let (_, body) = api.call(Method::GET, &uri).await;
        assert_eq!(body, json!({"result": "please_retry", "interval": 25}));

        api.fx.clock.advance(Duration::from_secs(25));
        let (_, body) = api.call(Method::GET, &uri).await;
        assert_eq!(body["payload"]["id"], ids[0]);
    }

    #[tokio::test]
    async fn test_report_with_client() {
        let api = ApiFixture::new();
        let (_, ids) = api.seed("example.com", 1).await;
        let client = authenticate(&api).await;

        let (_, body) = api
            .call(
                Method::POST,
                &format!("/v2/example.com/{}/succeeded?client_id={}", ids[0], client),
            )
            .await;
        assert_eq!(body, json!({"result": "success"}));
    }
}
