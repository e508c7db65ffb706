//! Proxy sources
//!
//! Cloud sources create and destroy servers through a `CloudProvider`; static
//! sources only hold manually entered proxies. `SourceManager` carries the
//! behaviour shared by both: provisioning requests, orphan adoption, teardown
//! and ownership conflicts.

mod cloud;
mod conflict;
mod registry;

#[cfg(test)]
pub mod testing;

pub use conflict::SourceConflict;
pub use registry::{ProviderFactory, ProviderRegistry};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Tunables;
use crate::error::Result;
use crate::fast_store::{FastStore, Keys};
use crate::jobs::{Job, JobQueue};
use crate::models::{Proxy, Source, SourceType};
use crate::pool::ProxyPool;
use crate::store::DurableStore;

/// Errors surfaced by a cloud provider
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Account limits reached; worth retrying next cycle
    #[error("At capacity: {0}")]
    AtCapacity(String),

    /// Credentials rejected; provisioning stops until reconfigured
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Remote resource kinds that are configured by name and used by id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Image,
    Flavor,
    Region,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Image => "image",
            ResourceKind::Flavor => "flavor",
            ResourceKind::Region => "region",
        }
    }
}

/// What to build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
    pub region_id: String,
}

/// A remote server as the provider reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandle {
    pub id: String,
    pub name: String,
    pub public_ip: Option<String>,
    pub image_id: String,
    pub flavor_id: String,
    pub region_id: String,
    pub ready: bool,
}

impl ServerHandle {
    /// Built from this image, flavor and region
    pub fn matches(&self, image_id: &str, flavor_id: &str, region_id: &str) -> bool {
        self.image_id == image_id && self.flavor_id == flavor_id && self.region_id == region_id
    }
}

/// The opaque capability a cloud backend exposes
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn list_servers(&self) -> ProviderResult<Vec<ServerHandle>>;

    /// Start building a server; it need not be ready on return
    async fn create_server(&self, spec: &ServerSpec) -> ProviderResult<ServerHandle>;

    async fn destroy(&self, server: &ServerHandle) -> ProviderResult<()>;

    async fn resolve_name_to_id(&self, kind: ResourceKind, name: &str) -> ProviderResult<String>;
}

/// `proxy-<YYYY.MM.DD-HH.MM.SS>-<uuid>`
pub fn server_name(now: DateTime<Utc>) -> String {
    format!(
        "proxy-{}-{}",
        now.format("%Y.%m.%d-%H.%M.%S"),
        Uuid::new_v4()
    )
}

/// Wait before retrying a teardown the provider refused
pub const DECOMMISSION_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Knobs the source code reads from `Tunables`
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub server_ready_timeout: Duration,
    pub server_poll_interval: Duration,
    pub recent_decommissions_length: usize,
    pub max_source_errors: usize,
    pub create_concurrency: usize,
}

impl From<&Tunables> for SourceSettings {
    fn from(t: &Tunables) -> Self {
        Self {
            server_ready_timeout: t.server_ready_timeout,
            server_poll_interval: t.server_poll_interval,
            recent_decommissions_length: t.fog_recent_decommissions_length,
            max_source_errors: t.max_source_errors,
            create_concurrency: 4,
        }
    }
}

#[derive(Clone)]
pub struct SourceManager {
    pool: ProxyPool,
    durable: Arc<dyn DurableStore>,
    fast: Arc<dyn FastStore>,
    keys: Keys,
    jobs: Arc<dyn JobQueue>,
    registry: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
    settings: SourceSettings,
}

impl SourceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: ProxyPool,
        durable: Arc<dyn DurableStore>,
        fast: Arc<dyn FastStore>,
        keys: Keys,
        jobs: Arc<dyn JobQueue>,
        registry: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
        settings: SourceSettings,
    ) -> Self {
        Self {
            pool,
            durable,
            fast,
            keys,
            jobs,
            registry,
            clock,
            settings,
        }
    }

    /// Ask a source for `shortfall` more proxies.
    ///
    /// The request is capped at the source's maximum and turned into one
    /// provisioning job; returns how many proxies were actually requested.
    pub async fn enqueue_provision(
        &self,
        source: &Source,
        site_id: Option<i64>,
        shortfall: i64,
    ) -> Result<i64> {
        if shortfall <= 0 {
            return Ok(0);
        }

        let active = self.durable.count_active_proxies(source.id).await?;
        let desired_total = (active + shortfall).min(source.effective_max_proxies());
        let accepted = (desired_total - active).max(0);

        if accepted > 0 {
            self.jobs
                .enqueue(Job::ProvisionProxies {
                    site_id,
                    source_id: source.id,
                    desired_total,
                })
                .await?;
            info!(
                source_id = source.id,
                ?site_id,
                desired_total,
                accepted,
                "Queued provisioning"
            );
        } else {
            debug!(source_id = source.id, active, "Source is at capacity");
        }

        Ok(accepted)
    }

    /// Tear down the server behind a proxy on behalf of `source`.
    ///
    /// Returns whether nothing is left running; false means the failure is on
    /// the source's error log and teardown should be tried again. Static
    /// sources have nothing to tear down.
    pub async fn decommission(&self, source: &Source, proxy: &Proxy) -> Result<bool> {
        match source.type_enum() {
            Some(SourceType::Static) => {
                debug!(source_id = source.id, proxy_id = proxy.id, "Static source, nothing to tear down");
                Ok(true)
            }
            Some(_) => self.decommission_server(source, proxy).await,
            None => {
                warn!(source_id = source.id, source_type = %source.source_type, "Unknown source type");
                Ok(true)
            }
        }
    }

    /// Handle a `DecommissionProxy` job.
    ///
    /// Does nothing if the proxy is already gone or still serves a site. If
    /// the server could not be torn down the proxy is kept and the job is
    /// queued again.
    pub async fn decommission_proxy(&self, proxy_id: i64) -> Result<()> {
        let Some(proxy) = self.durable.get_proxy(proxy_id).await? else {
            debug!(proxy_id, "Proxy already gone");
            return Ok(());
        };

        let affiliations = self.durable.count_active_affiliations(proxy_id).await?;
        if affiliations > 0 {
            debug!(proxy_id, affiliations, "Proxy still in use, keeping it");
            return Ok(());
        }

        if let Some(source_id) = proxy.source_id {
            if let Some(source) = self.durable.get_source(source_id).await? {
                if !self.decommission(&source, &proxy).await? {
                    warn!(proxy_id, source_id, "Teardown failed, retrying later");
                    self.jobs
                        .enqueue_in(DECOMMISSION_RETRY_DELAY, Job::DecommissionProxy { proxy_id })
                        .await?;
                    return Ok(());
                }
            }
        }

        self.durable.soft_delete_proxy(proxy_id).await?;
        info!(proxy_id, host = %proxy.host, "Decommissioned proxy");
        Ok(())
    }

    /// Append to the source's persistent error log
    pub async fn record_error(&self, source_id: i64, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        warn!(source_id, error = %message, "Source error");
        self.durable
            .append_source_error(source_id, &message, self.settings.max_source_errors)
            .await
    }
}
