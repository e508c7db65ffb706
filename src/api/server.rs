//! API server using Axum
//!
//! Serves the client endpoints: authentication, proxy selection and result
//! reporting.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use tokio::sync::watch;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::ApiServerConfig;
use crate::error::{Result, ZartanError};
use crate::health::HealthTracker;
use crate::lease::LeaseCache;
use crate::pool::ProxyPool;
use crate::store::DurableStore;

use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub durable: Arc<dyn DurableStore>,
    pub pool: ProxyPool,
    pub leases: LeaseCache,
    pub health: HealthTracker,
    pub api_keys: Arc<HashSet<String>>,
    pub default_retry: Duration,
    pub started_at: Instant,
}

impl AppState {
    pub fn is_known_key(&self, key: Option<&str>) -> bool {
        key.is_some_and(|k| self.api_keys.contains(k))
    }
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    fn build_router(&self) -> Router {
        routes::create_router(self.state.clone())
            .layer(TimeoutLayer::new(Duration::from_secs(30)))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| ZartanError::InvalidConfig(format!("Invalid API server address: {}", e)))?;

        let router = self.build_router();

        info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| ZartanError::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}
