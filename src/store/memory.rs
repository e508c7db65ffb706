use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::types::Json;

use super::DurableStore;
use crate::clock::Clock;
use crate::error::{Result, ZartanError};
use crate::models::{Proxy, ProxyPerformance, Site, Source, DEFAULT_MAX_PROXIES, DEFAULT_MIN_PROXIES};
use crate::repository::NewSource;

#[derive(Default)]
struct Tables {
    next_id: i64,
    proxies: HashMap<i64, Proxy>,
    sources: HashMap<i64, Source>,
    sites: HashMap<i64, Site>,
    performances: HashMap<(i64, i64), ProxyPerformance>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process `DurableStore` with the same semantics as the Postgres schema
pub struct MemoryDurableStore {
    clock: Arc<dyn Clock>,
    tables: Mutex<Tables>,
    offline: AtomicBool,
}

impl MemoryDurableStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tables: Mutex::new(Tables::default()),
            offline: AtomicBool::new(false),
        }
    }

    /// Make `ping` fail until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Change a site's proxy bounds
    pub fn set_site_bounds(&self, site_id: i64, min_proxies: i32, max_proxies: i32) -> Result<Site> {
        let mut tables = self.tables.lock();
        let site = tables
            .sites
            .get_mut(&site_id)
            .ok_or(ZartanError::SiteNotFound { id: site_id })?;
        site.min_proxies = min_proxies;
        site.max_proxies = max_proxies;
        site.updated_at = self.clock.now();
        Ok(site.clone())
    }

    /// Any proxy row, deleted or not
    pub fn proxy_row(&self, id: i64) -> Option<Proxy> {
        self.tables.lock().proxies.get(&id).cloned()
    }

    /// Any affiliation row, deleted or not
    pub fn performance_row(&self, site_id: i64, proxy_id: i64) -> Option<ProxyPerformance> {
        self.tables
            .lock()
            .performances
            .get(&(site_id, proxy_id))
            .cloned()
    }

    /// Any source row, deleted or not
    pub fn source_row(&self, id: i64) -> Option<Source> {
        self.tables.lock().sources.get(&id).cloned()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn ping(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ZartanError::DatabaseConnection("store is offline".into()));
        }
        Ok(())
    }

    async fn get_proxy(&self, id: i64) -> Result<Option<Proxy>> {
        Ok(self
            .tables
            .lock()
            .proxies
            .get(&id)
            .filter(|p| p.is_active())
            .cloned())
    }

    async fn find_proxy(&self, host: &str, port: i32) -> Result<Option<Proxy>> {
        Ok(self
            .tables
            .lock()
            .proxies
            .values()
            .find(|p| p.host == host && p.port == port)
            .cloned())
    }

    async fn restore_or_create_proxy(
        &self,
        host: &str,
        port: i32,
        source_id: i64,
    ) -> Result<Proxy> {
        let mut tables = self.tables.lock();
        let now = self.clock.now();

        let existing = tables
            .proxies
            .values()
            .find(|p| p.host == host && p.port == port)
            .map(|p| p.id);

        let id = match existing {
            Some(id) => id,
            None => {
                let id = tables.next_id();
                tables.proxies.insert(
                    id,
                    Proxy {
                        id,
                        host: host.to_string(),
                        port,
                        source_id: None,
                        deleted_at: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
                id
            }
        };

        let proxy = tables
            .proxies
            .get_mut(&id)
            .ok_or(ZartanError::ProxyNotFound { id })?;
        proxy.source_id = Some(source_id);
        proxy.deleted_at = None;
        proxy.updated_at = now;
        Ok(proxy.clone())
    }

    async fn soft_delete_proxy(&self, id: i64) -> Result<bool> {
        let mut tables = self.tables.lock();
        match tables.proxies.get_mut(&id) {
            Some(p) if p.is_active() => {
                p.deleted_at = Some(self.clock.now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_proxy_host_exists(&self, host: &str) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .proxies
            .values()
            .any(|p| p.is_active() && p.host == host))
    }

    async fn count_active_proxies(&self, source_id: i64) -> Result<i64> {
        Ok(self
            .tables
            .lock()
            .proxies
            .values()
            .filter(|p| p.is_active() && p.source_id == Some(source_id))
            .count() as i64)
    }

    async fn retrieve_unaffiliated(
        &self,
        source_id: i64,
        site_id: i64,
        limit: i64,
    ) -> Result<Vec<Proxy>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let tables = self.tables.lock();
        let mut proxies: Vec<Proxy> = tables
            .proxies
            .values()
            .filter(|p| p.is_active() && p.source_id == Some(source_id))
            .filter(|p| !tables.performances.contains_key(&(site_id, p.id)))
            .cloned()
            .collect();
        proxies.sort_by_key(|p| p.id);
        proxies.truncate(limit as usize);
        Ok(proxies)
    }

    async fn get_source(&self, id: i64) -> Result<Option<Source>> {
        Ok(self
            .tables
            .lock()
            .sources
            .get(&id)
            .filter(|s| s.is_active())
            .cloned())
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let tables = self.tables.lock();
        let mut sources: Vec<Source> = tables
            .sources
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        sources.sort_by_key(|s| s.id);
        Ok(sources)
    }

    async fn create_source(&self, new: NewSource) -> Result<Source> {
        let mut tables = self.tables.lock();
        let id = tables.next_id();
        let now = self.clock.now();
        let source = Source {
            id,
            name: new.name,
            source_type: new.source_type,
            reliability: new.reliability,
            max_proxies: new.max_proxies,
            config: Json(new.config),
            errors: Json(Vec::new()),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        tables.sources.insert(id, source.clone());
        Ok(source)
    }

    async fn update_source_config(&self, id: i64, config: &Value) -> Result<()> {
        let mut tables = self.tables.lock();
        let source = tables
            .sources
            .get_mut(&id)
            .ok_or(ZartanError::SourceNotFound { id })?;
        source.config = Json(config.clone());
        source.updated_at = self.clock.now();
        Ok(())
    }

    async fn append_source_error(&self, id: i64, message: &str, max_errors: usize) -> Result<()> {
        let mut tables = self.tables.lock();
        let source = tables
            .sources
            .get_mut(&id)
            .ok_or(ZartanError::SourceNotFound { id })?;
        let errors = &mut source.errors.0;
        errors.push(message.to_string());
        if errors.len() > max_errors {
            let overflow = errors.len() - max_errors;
            errors.drain(..overflow);
        }
        Ok(())
    }

    async fn get_site(&self, id: i64) -> Result<Option<Site>> {
        Ok(self
            .tables
            .lock()
            .sites
            .get(&id)
            .filter(|s| s.deleted_at.is_none())
            .cloned())
    }

    async fn find_or_create_site(&self, name: &str) -> Result<Site> {
        let mut tables = self.tables.lock();
        if let Some(site) = tables.sites.values_mut().find(|s| s.name == name) {
            site.deleted_at = None;
            return Ok(site.clone());
        }
        let id = tables.next_id();
        let now = self.clock.now();
        let site = Site {
            id,
            name: name.to_string(),
            min_proxies: DEFAULT_MIN_PROXIES,
            max_proxies: DEFAULT_MAX_PROXIES,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        tables.sites.insert(id, site.clone());
        Ok(site)
    }

    async fn list_sites(&self) -> Result<Vec<Site>> {
        let tables = self.tables.lock();
        let mut sites: Vec<Site> = tables
            .sites
            .values()
            .filter(|s| s.deleted_at.is_none())
            .cloned()
            .collect();
        sites.sort_by_key(|s| s.id);
        Ok(sites)
    }

    async fn get_active_performance(
        &self,
        site_id: i64,
        proxy_id: i64,
    ) -> Result<Option<ProxyPerformance>> {
        Ok(self
            .tables
            .lock()
            .performances
            .get(&(site_id, proxy_id))
            .filter(|p| p.is_active())
            .cloned())
    }

    async fn affiliate_proxies(
        &self,
        site_id: i64,
        proxy_ids: &[i64],
    ) -> Result<Vec<ProxyPerformance>> {
        let mut tables = self.tables.lock();
        let now = self.clock.now();
        let mut rows = Vec::with_capacity(proxy_ids.len());

        for &proxy_id in proxy_ids {
            let id = match tables.performances.get(&(site_id, proxy_id)) {
                Some(existing) => existing.id,
                None => tables.next_id(),
            };
            let row = tables
                .performances
                .entry((site_id, proxy_id))
                .or_insert_with(|| ProxyPerformance {
                    id,
                    proxy_id,
                    site_id,
                    times_succeeded: 0,
                    times_failed: 0,
                    reset_at: None,
                    deleted_at: None,
                    created_at: now,
                    updated_at: now,
                });
            row.deleted_at = None;
            row.times_succeeded = 0;
            row.times_failed = 0;
            row.reset_at = None;
            row.updated_at = now;
            rows.push(row.clone());
        }

        Ok(rows)
    }

    async fn soft_delete_performance(&self, site_id: i64, proxy_id: i64) -> Result<bool> {
        let mut tables = self.tables.lock();
        match tables.performances.get_mut(&(site_id, proxy_id)) {
            Some(p) if p.is_active() => {
                p.deleted_at = Some(self.clock.now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_performance(
        &self,
        site_id: i64,
        proxy_id: i64,
        succeeded: i64,
        failed: i64,
    ) -> Result<Option<ProxyPerformance>> {
        let mut tables = self.tables.lock();
        match tables.performances.get_mut(&(site_id, proxy_id)) {
            Some(p) if p.is_active() => {
                p.times_succeeded += succeeded;
                p.times_failed += failed;
                p.updated_at = self.clock.now();
                Ok(Some(p.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn active_performances(&self, site_id: i64) -> Result<Vec<ProxyPerformance>> {
        let tables = self.tables.lock();
        let mut perfs: Vec<ProxyPerformance> = tables
            .performances
            .values()
            .filter(|p| p.site_id == site_id && p.is_active())
            .filter(|p| {
                tables
                    .proxies
                    .get(&p.proxy_id)
                    .map(|proxy| proxy.is_active())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        perfs.sort_by_key(|p| p.proxy_id);
        Ok(perfs)
    }

    async fn count_active_affiliations(&self, proxy_id: i64) -> Result<i64> {
        Ok(self
            .tables
            .lock()
            .performances
            .values()
            .filter(|p| p.proxy_id == proxy_id && p.is_active())
            .count() as i64)
    }

    async fn source_site_totals(&self, source_id: i64, site_id: i64) -> Result<(i64, i64)> {
        let tables = self.tables.lock();
        Ok(tables
            .performances
            .values()
            .filter(|p| p.site_id == site_id)
            .filter(|p| {
                tables
                    .proxies
                    .get(&p.proxy_id)
                    .map(|proxy| proxy.source_id == Some(source_id))
                    .unwrap_or(false)
            })
            .fold((0, 0), |(s, f), p| (s + p.times_succeeded, f + p.times_failed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    fn store() -> (Arc<ManualClock>, MemoryDurableStore) {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
        (clock.clone(), MemoryDurableStore::new(clock))
    }

    fn new_source(name: &str) -> NewSource {
        NewSource {
            name: name.to_string(),
            source_type: "static".to_string(),
            reliability: 50.0,
            max_proxies: 0,
            config: json!({}),
        }
    }

    #[tokio::test]
    async fn test_restore_or_create_reuses_row() {
        let (_, store) = store();
        let source = store.create_source(new_source("list")).await.unwrap();

        let first = store
            .restore_or_create_proxy("10.0.0.1", 3128, source.id)
            .await
            .unwrap();
        store.soft_delete_proxy(first.id).await.unwrap();
        assert!(store.get_proxy(first.id).await.unwrap().is_none());

        let again = store
            .restore_or_create_proxy("10.0.0.1", 3128, source.id)
            .await
            .unwrap();
        assert_eq!(again.id, first.id);
        assert!(again.is_active());
    }

    #[tokio::test]
    async fn test_affiliation_restores_instead_of_duplicating() {
        let (_, store) = store();
        let source = store.create_source(new_source("list")).await.unwrap();
        let site = store.find_or_create_site("example.com").await.unwrap();
        let proxy = store
            .restore_or_create_proxy("10.0.0.1", 3128, source.id)
            .await
            .unwrap();

        let rows = store.affiliate_proxies(site.id, &[proxy.id]).await.unwrap();
        store
            .increment_performance(site.id, proxy.id, 4, 2)
            .await
            .unwrap();
        store.soft_delete_performance(site.id, proxy.id).await.unwrap();
        assert!(store
            .increment_performance(site.id, proxy.id, 1, 0)
            .await
            .unwrap()
            .is_none());

        let restored = store.affiliate_proxies(site.id, &[proxy.id]).await.unwrap();
        assert_eq!(restored[0].id, rows[0].id);
        assert_eq!(restored[0].total(), 0);
        assert!(restored[0].is_active());
    }

    #[tokio::test]
    async fn test_retrieve_excludes_joined_proxies() {
        let (_, store) = store();
        let source = store.create_source(new_source("list")).await.unwrap();
        let site = store.find_or_create_site("example.com").await.unwrap();
        let a = store
            .restore_or_create_proxy("10.0.0.1", 3128, source.id)
            .await
            .unwrap();
        let b = store
            .restore_or_create_proxy("10.0.0.2", 3128, source.id)
            .await
            .unwrap();
        store.affiliate_proxies(site.id, &[a.id]).await.unwrap();

        let free = store
            .retrieve_unaffiliated(source.id, site.id, 10)
            .await
            .unwrap();
        assert_eq!(free.iter().map(|p| p.id).collect::<Vec<_>>(), vec![b.id]);
        assert!(store
            .retrieve_unaffiliated(source.id, site.id, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_source_error_log_is_bounded_fifo() {
        let (_, store) = store();
        let source = store.create_source(new_source("list")).await.unwrap();

        for i in 0..5 {
            store
                .append_source_error(source.id, &format!("error {}", i), 3)
                .await
                .unwrap();
        }

        let errors = store.source_row(source.id).unwrap().errors.0;
        assert_eq!(errors, vec!["error 2", "error 3", "error 4"]);
    }

    #[tokio::test]
    async fn test_timestamps_follow_the_clock() {
        let (clock, store) = store();
        let source = store.create_source(new_source("list")).await.unwrap();
        let created_at = clock.now();

        let proxy = store
            .restore_or_create_proxy("10.0.0.1", 3128, source.id)
            .await
            .unwrap();
        assert_eq!(proxy.created_at, created_at);

        clock.advance(Duration::from_secs(90));
        store.soft_delete_proxy(proxy.id).await.unwrap();
        assert_eq!(
            store.proxy_row(proxy.id).unwrap().deleted_at,
            Some(created_at + chrono::Duration::seconds(90))
        );
    }
}
