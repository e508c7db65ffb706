//! Durable store: source of truth for identity and ownership
//!
//! Components receive a `DurableStore` handle explicitly. Postgres backs it in
//! production; the in-memory implementation backs tests and local runs.

mod memory;
mod postgres;

pub use memory::MemoryDurableStore;
pub use postgres::PgDurableStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::models::{Proxy, ProxyPerformance, Site, Source};
use crate::repository::NewSource;

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fails while the store cannot serve queries
    async fn ping(&self) -> Result<()>;

    // Proxies

    /// Active proxy by id; soft-deleted rows read as absent
    async fn get_proxy(&self, id: i64) -> Result<Option<Proxy>>;

    /// Proxy by address, including soft-deleted rows
    async fn find_proxy(&self, host: &str, port: i32) -> Result<Option<Proxy>>;

    /// Create or restore the row for `host:port` owned by `source_id`
    async fn restore_or_create_proxy(&self, host: &str, port: i32, source_id: i64)
        -> Result<Proxy>;

    async fn soft_delete_proxy(&self, id: i64) -> Result<bool>;

    async fn active_proxy_host_exists(&self, host: &str) -> Result<bool>;

    async fn count_active_proxies(&self, source_id: i64) -> Result<i64>;

    /// Active proxies of `source_id` never joined to `site_id`, at most `limit`
    async fn retrieve_unaffiliated(
        &self,
        source_id: i64,
        site_id: i64,
        limit: i64,
    ) -> Result<Vec<Proxy>>;

    // Sources

    async fn get_source(&self, id: i64) -> Result<Option<Source>>;

    async fn list_sources(&self) -> Result<Vec<Source>>;

    async fn create_source(&self, new: NewSource) -> Result<Source>;

    async fn update_source_config(&self, id: i64, config: &Value) -> Result<()>;

    /// Append to the bounded persistent error log of a source
    async fn append_source_error(&self, id: i64, message: &str, max_errors: usize) -> Result<()>;

    // Sites

    async fn get_site(&self, id: i64) -> Result<Option<Site>>;

    async fn find_or_create_site(&self, name: &str) -> Result<Site>;

    async fn list_sites(&self) -> Result<Vec<Site>>;

    // Proxy performances

    async fn get_active_performance(
        &self,
        site_id: i64,
        proxy_id: i64,
    ) -> Result<Option<ProxyPerformance>>;

    /// Restore or create affiliation rows for a batch, atomically
    async fn affiliate_proxies(&self, site_id: i64, proxy_ids: &[i64])
        -> Result<Vec<ProxyPerformance>>;

    async fn soft_delete_performance(&self, site_id: i64, proxy_id: i64) -> Result<bool>;

    /// Add counters to an active affiliation; `None` if it is not active
    async fn increment_performance(
        &self,
        site_id: i64,
        proxy_id: i64,
        succeeded: i64,
        failed: i64,
    ) -> Result<Option<ProxyPerformance>>;

    async fn active_performances(&self, site_id: i64) -> Result<Vec<ProxyPerformance>>;

    async fn count_active_affiliations(&self, proxy_id: i64) -> Result<i64>;

    /// Summed (succeeded, failed) of a source's proxies on a site
    async fn source_site_totals(&self, source_id: i64, site_id: i64) -> Result<(i64, i64)>;
}
