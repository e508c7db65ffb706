use async_trait::async_trait;
use serde_json::Value;

use super::DurableStore;
use crate::database::Database;
use crate::error::Result;
use crate::models::{Proxy, ProxyPerformance, Site, Source};
use crate::repository::{
    NewSource, PerformanceRepository, ProxyRepository, SiteRepository, SourceRepository,
};

/// `DurableStore` over the Postgres repositories
#[derive(Clone)]
pub struct PgDurableStore {
    db: Database,
    proxies: ProxyRepository,
    sources: SourceRepository,
    sites: SiteRepository,
    performances: PerformanceRepository,
}

impl PgDurableStore {
    pub fn new(db: &Database) -> Self {
        let pool = db.pool().clone();
        Self {
            db: db.clone(),
            proxies: ProxyRepository::new(pool.clone()),
            sources: SourceRepository::new(pool.clone()),
            sites: SiteRepository::new(pool.clone()),
            performances: PerformanceRepository::new(pool),
        }
    }
}

#[async_trait]
impl DurableStore for PgDurableStore {
    async fn ping(&self) -> Result<()> {
        self.db.ping().await
    }

    async fn get_proxy(&self, id: i64) -> Result<Option<Proxy>> {
        self.proxies.get_active(id).await
    }

    async fn find_proxy(&self, host: &str, port: i32) -> Result<Option<Proxy>> {
        self.proxies.find_by_address(host, port).await
    }

    async fn restore_or_create_proxy(
        &self,
        host: &str,
        port: i32,
        source_id: i64,
    ) -> Result<Proxy> {
        self.proxies.restore_or_create(host, port, source_id).await
    }

    async fn soft_delete_proxy(&self, id: i64) -> Result<bool> {
        self.proxies.soft_delete(id).await
    }

    async fn active_proxy_host_exists(&self, host: &str) -> Result<bool> {
        self.proxies.active_host_exists(host).await
    }

    async fn count_active_proxies(&self, source_id: i64) -> Result<i64> {
        self.proxies.count_active_by_source(source_id).await
    }

    async fn retrieve_unaffiliated(
        &self,
        source_id: i64,
        site_id: i64,
        limit: i64,
    ) -> Result<Vec<Proxy>> {
        self.proxies
            .retrieve_unaffiliated(source_id, site_id, limit)
            .await
    }

    async fn get_source(&self, id: i64) -> Result<Option<Source>> {
        self.sources.get_by_id(id).await
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        self.sources.get_all().await
    }

    async fn create_source(&self, new: NewSource) -> Result<Source> {
        self.sources.create(&new).await
    }

    async fn update_source_config(&self, id: i64, config: &Value) -> Result<()> {
        self.sources.update_config(id, config).await
    }

    async fn append_source_error(&self, id: i64, message: &str, max_errors: usize) -> Result<()> {
        self.sources.append_error(id, message, max_errors).await
    }

    async fn get_site(&self, id: i64) -> Result<Option<Site>> {
        self.sites.get_by_id(id).await
    }

    async fn find_or_create_site(&self, name: &str) -> Result<Site> {
        self.sites.find_or_create(name).await
    }

    async fn list_sites(&self) -> Result<Vec<Site>> {
        self.sites.get_all().await
    }

    async fn get_active_performance(
        &self,
        site_id: i64,
        proxy_id: i64,
    ) -> Result<Option<ProxyPerformance>> {
        self.performances.get_active(site_id, proxy_id).await
    }

    async fn affiliate_proxies(
        &self,
        site_id: i64,
        proxy_ids: &[i64],
    ) -> Result<Vec<ProxyPerformance>> {
        self.performances
            .restore_or_create_batch(site_id, proxy_ids)
            .await
    }

    async fn soft_delete_performance(&self, site_id: i64, proxy_id: i64) -> Result<bool> {
        self.performances.soft_delete(site_id, proxy_id).await
    }

    async fn increment_performance(
        &self,
        site_id: i64,
        proxy_id: i64,
        succeeded: i64,
        failed: i64,
    ) -> Result<Option<ProxyPerformance>> {
        self.performances
            .increment(site_id, proxy_id, succeeded, failed)
            .await
    }

    async fn active_performances(&self, site_id: i64) -> Result<Vec<ProxyPerformance>> {
        self.performances.get_active_by_site(site_id).await
    }

    async fn count_active_affiliations(&self, proxy_id: i64) -> Result<i64> {
        self.performances.count_active_by_proxy(proxy_id).await
    }

    async fn source_site_totals(&self, source_id: i64, site_id: i64) -> Result<(i64, i64)> {
        self.performances
            .totals_for_source(source_id, site_id)
            .await
    }
}
