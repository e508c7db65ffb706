use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::sources::ProviderError;

/// Unified error type for Zartan
#[derive(Error, Debug)]
pub enum ZartanError {
    // Durable store errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection failed: {0}")]
    DatabaseConnection(String),

    // Fast store errors
    #[error("Fast store error: {0}")]
    FastStore(#[from] redis::RedisError),

    #[error("Fast store connection failed: {0}")]
    FastStoreConnection(String),

    #[error("Lock unavailable: {key}")]
    LockUnavailable { key: String },

    // Lookup errors
    #[error("Proxy not found: {id}")]
    ProxyNotFound { id: i64 },

    #[error("Site not found: {id}")]
    SiteNotFound { id: i64 },

    #[error("Source not found: {id}")]
    SourceNotFound { id: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    // Cloud provider errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("No cloud provider registered for source type {0}")]
    ProviderNotRegistered(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // Background work
    #[error("Job queue closed")]
    JobQueueClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Zartan operations
pub type Result<T> = std::result::Result<T, ZartanError>;

impl ZartanError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ZartanError::InvalidRequest(_) | ZartanError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }

            ZartanError::Unauthorized(_) => StatusCode::UNAUTHORIZED,

            ZartanError::ProxyNotFound { .. }
            | ZartanError::SiteNotFound { .. }
            | ZartanError::SourceNotFound { .. }
            | ZartanError::NotFound(_) => StatusCode::NOT_FOUND,

            ZartanError::LockUnavailable { .. }
            | ZartanError::DatabaseConnection(_)
            | ZartanError::FastStoreConnection(_)
            | ZartanError::JobQueueClosed => StatusCode::SERVICE_UNAVAILABLE,

            ZartanError::Provider(_) | ZartanError::ProviderNotRegistered(_) => {
                StatusCode::BAD_GATEWAY
            }

            ZartanError::Database(_)
            | ZartanError::FastStore(_)
            | ZartanError::Serialization(_)
            | ZartanError::Io(_)
            | ZartanError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Not-found errors are expected races with decommissioning and are
    /// treated as "no proxy" rather than failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ZartanError::ProxyNotFound { .. }
                | ZartanError::SiteNotFound { .. }
                | ZartanError::SourceNotFound { .. }
                | ZartanError::NotFound(_)
        )
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Errors reach API clients in the same envelope as every other response.
impl IntoResponse for ZartanError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "result": "error",
            "reason": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
