//! Response envelope shared by every client endpoint

use std::time::Duration;

use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::models::{Proxy, ProxyResult};

/// `success`, `please_retry` or `error`, always answered with 200
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApiResponse {
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    PleaseRetry {
        /// Seconds to wait before asking again
        interval: u64,
    },
    Error {
        reason: String,
    },
}

impl ApiResponse {
    pub fn success() -> Self {
        ApiResponse::Success { payload: None }
    }

    pub fn success_with(payload: Value) -> Self {
        ApiResponse::Success {
            payload: Some(payload),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        ApiResponse::Error {
            reason: reason.into(),
        }
    }

    /// Translate a selection result; `NoProxy` waits `default_retry`
    pub fn from_result(result: ProxyResult, default_retry: Duration) -> Self {
        match result {
            ProxyResult::Proxy(proxy) => Self::success_with(proxy_payload(&proxy)),
            ProxyResult::NotReady { timeout, .. } => ApiResponse::PleaseRetry {
                interval: ceil_secs(timeout),
            },
            ProxyResult::NoProxy => ApiResponse::PleaseRetry {
                interval: default_retry.as_secs(),
            },
        }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

fn proxy_payload(proxy: &Proxy) -> Value {
    json!({
        "id": proxy.id,
        "host": proxy.host,
        "port": proxy.port,
    })
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
