//! Per-site proxy pool
//!
//! A sorted set of proxy id -> last used time (unix millis). Selection takes
//! the least recently used entry and always touches it, so a proxy that is
//! still cooling down is not handed to the next caller either. Every
//! multi-command section below runs under the site's pool lock.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Result, ZartanError};
use crate::fast_store::{AdvisoryLock, FastStore, Keys};
use crate::jobs::{Job, JobQueue};
use crate::models::ProxyResult;
use crate::store::DurableStore;

/// `older_than` value meaning any idle time is acceptable
pub const ANY_AGE: i64 = -1;

/// Longest cooldown honored; larger requests are clamped to it
pub const MAX_COOLDOWN_SECS: i64 = 7 * 24 * 60 * 60;

/// Outcome of a proxy use, as reported by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

#[derive(Clone)]
pub struct ProxyPool {
    durable: Arc<dyn DurableStore>,
    fast: Arc<dyn FastStore>,
    lock: AdvisoryLock,
    keys: Keys,
    clock: Arc<dyn Clock>,
    jobs: Arc<dyn JobQueue>,
}

impl ProxyPool {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        fast: Arc<dyn FastStore>,
        lock: AdvisoryLock,
        keys: Keys,
        clock: Arc<dyn Clock>,
        jobs: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            durable,
            fast,
            lock,
            keys,
            clock,
            jobs,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Pick the least recently used proxy of a site.
    ///
    /// `older_than` is the cooldown in seconds, capped at
    /// `MAX_COOLDOWN_SECS`; negative accepts any age. A busy lock yields
    /// `NoProxy` so the caller retries.
    pub async fn select_proxy(&self, site_id: i64, older_than: i64) -> Result<ProxyResult> {
        let lock_key = self.keys.proxy_pool_lock(site_id);
        let Some(guard) = self.lock.acquire(&lock_key).await? else {
            return Ok(ProxyResult::NoProxy);
        };
        let picked = self.take_least_recent(site_id).await;
        guard.release().await?;

        let Some((member, last_used)) = picked? else {
            debug!(site_id, "No proxy in pool");
            return Ok(ProxyResult::NoProxy);
        };
        let Ok(proxy_id) = member.parse::<i64>() else {
            warn!(site_id, member = %member, "Ignoring malformed pool entry");
            return Ok(ProxyResult::NoProxy);
        };

        if let Some(remaining) = self.remaining_cooldown(last_used as i64, older_than) {
            return Ok(ProxyResult::NotReady {
                proxy_id,
                timeout: remaining,
            });
        }

        match self.durable.get_proxy(proxy_id).await? {
            Some(proxy) => Ok(ProxyResult::Proxy(proxy)),
            None => {
                debug!(site_id, proxy_id, "Pool entry points at a missing proxy");
                Ok(ProxyResult::NoProxy)
            }
        }
    }

    fn remaining_cooldown(&self, last_used: i64, older_than: i64) -> Option<Duration> {
        if older_than < 0 {
            return None;
        }
        let cooldown_ms = older_than.min(MAX_COOLDOWN_SECS) * 1000;
        let threshold = self.clock.now_millis().saturating_sub(cooldown_ms);
        let wait = last_used.saturating_sub(threshold);
        (wait > 0).then(|| Duration::from_millis(wait.unsigned_abs()))
    }

    // Lock held: read the minimum entry and advance it to now.
    async fn take_least_recent(&self, site_id: i64) -> Result<Option<(String, f64)>> {
        let pool_key = self.keys.proxy_pool(site_id);
        let first = self.fast.zfirst(&pool_key).await?;
        if let Some((member, _)) = &first {
            self.fast
                .zadd(&pool_key, member, self.clock.now_millis() as f64)
                .await?;
        }
        Ok(first)
    }

    /// Put a proxy in the pool as immediately usable
    pub async fn enable_proxy(&self, site_id: i64, proxy_id: i64) -> Result<()> {
        self.enable_proxies(site_id, &[proxy_id]).await
    }

    /// Put proxies in the pool as immediately usable, under one lock
    pub async fn enable_proxies(&self, site_id: i64, proxy_ids: &[i64]) -> Result<()> {
        if proxy_ids.is_empty() {
            return Ok(());
        }
        let guard = self.acquire_or_fail(site_id).await?;

        let pool_key = self.keys.proxy_pool(site_id);
        let mut result = Ok(());
        for id in proxy_ids {
            result = self.fast.zadd(&pool_key, &id.to_string(), 0.0).await;
            if result.is_err() {
                break;
            }
        }
        guard.release().await?;
        result?;

        debug!(site_id, count = proxy_ids.len(), "Enabled proxies");
        Ok(())
    }

    /// Take a proxy off a site: pool entry and counters, then the durable
    /// affiliation, then queue its teardown.
    pub async fn disable_proxy(&self, site_id: i64, proxy_id: i64) -> Result<()> {
        let guard = self.acquire_or_fail(site_id).await?;
        let removed = self.remove_entries(site_id, proxy_id).await;
        guard.release().await?;
        removed?;

        self.durable
            .soft_delete_performance(site_id, proxy_id)
            .await?;
        self.jobs.enqueue(Job::DecommissionProxy { proxy_id }).await?;

        info!(site_id, proxy_id, "Disabled proxy");
        Ok(())
    }

    // Lock held.
    async fn remove_entries(&self, site_id: i64, proxy_id: i64) -> Result<()> {
        let member = proxy_id.to_string();
        self.fast
            .zrem(&self.keys.proxy_pool(site_id), &member)
            .await?;
        self.fast
            .hdel(&self.keys.proxy_successes(site_id), &member)
            .await?;
        self.fast
            .hdel(&self.keys.proxy_failures(site_id), &member)
            .await?;
        Ok(())
    }

    /// Mark a pooled proxy as just used; false if it is no longer pooled
    pub async fn touch_proxy(&self, site_id: i64, proxy_id: i64) -> Result<bool> {
        let guard = self.acquire_or_fail(site_id).await?;
        let touched = self.touch_if_pooled(site_id, proxy_id).await;
        guard.release().await?;
        touched
    }

    // Lock held.
    async fn touch_if_pooled(&self, site_id: i64, proxy_id: i64) -> Result<bool> {
        let pool_key = self.keys.proxy_pool(site_id);
        let member = proxy_id.to_string();
        if self.fast.zscore(&pool_key, &member).await?.is_none() {
            return Ok(false);
        }
        self.fast
            .zadd(&pool_key, &member, self.clock.now_millis() as f64)
            .await?;
        Ok(true)
    }

    /// Touch a proxy and bump its rolling counter for `outcome`.
    ///
    /// Returns the new counter value, or `None` when the lock was busy or the
    /// proxy has left the pool.
    pub async fn record_outcome(
        &self,
        site_id: i64,
        proxy_id: i64,
        outcome: Outcome,
    ) -> Result<Option<i64>> {
        let lock_key = self.keys.proxy_pool_lock(site_id);
        let Some(guard) = self.lock.acquire(&lock_key).await? else {
            warn!(site_id, proxy_id, ?outcome, "Dropping report, pool lock busy");
            return Ok(None);
        };
        let counted = self.touch_and_count(site_id, proxy_id, outcome).await;
        guard.release().await?;
        counted
    }

    // Lock held: the touch and the increment land together.
    async fn touch_and_count(
        &self,
        site_id: i64,
        proxy_id: i64,
        outcome: Outcome,
    ) -> Result<Option<i64>> {
        if !self.touch_if_pooled(site_id, proxy_id).await? {
            return Ok(None);
        }
        let counter = match outcome {
            Outcome::Succeeded => self.keys.proxy_successes(site_id),
            Outcome::Failed => self.keys.proxy_failures(site_id),
        };
        let value = self
            .fast
            .hincr(&counter, &proxy_id.to_string(), 1)
            .await?;
        Ok(Some(value))
    }

    /// Snapshot and zero the rolling counters of a proxy.
    ///
    /// `None` when the lock was busy; callers must skip, not assume zero.
    pub async fn take_counters(&self, site_id: i64, proxy_id: i64) -> Result<Option<(i64, i64)>> {
        let lock_key = self.keys.proxy_pool_lock(site_id);
        let Some(guard) = self.lock.acquire(&lock_key).await? else {
            return Ok(None);
        };
        let snapshot = self.snapshot_and_reset(site_id, proxy_id).await;
        guard.release().await?;
        snapshot.map(Some)
    }

    // Lock held: an increment lands either before the read or after the reset.
    async fn snapshot_and_reset(&self, site_id: i64, proxy_id: i64) -> Result<(i64, i64)> {
        let member = proxy_id.to_string();
        let successes_key = self.keys.proxy_successes(site_id);
        let failures_key = self.keys.proxy_failures(site_id);

        let succeeded = parse_counter(self.fast.hget(&successes_key, &member).await?);
        let failed = parse_counter(self.fast.hget(&failures_key, &member).await?);
        self.fast.hdel(&successes_key, &member).await?;
        self.fast.hdel(&failures_key, &member).await?;

        Ok((succeeded, failed))
    }

    /// Number of proxies currently pooled for a site
    pub async fn pool_size(&self, site_id: i64) -> Result<u64> {
        self.fast.zcard(&self.keys.proxy_pool(site_id)).await
    }

    /// Re-add every durably affiliated proxy missing from the pool.
    ///
    /// Rebuilds a site after fast store loss; returns how many were restored.
    pub async fn sync_with_durable(&self, site_id: i64) -> Result<usize> {
        let affiliated = self.durable.active_performances(site_id).await?;
        if affiliated.is_empty() {
            return Ok(0);
        }

        let pooled = self.fast.zmembers(&self.keys.proxy_pool(site_id)).await?;
        let missing: Vec<i64> = affiliated
            .iter()
            .map(|p| p.proxy_id)
            .filter(|id| !pooled.contains(&id.to_string()))
            .collect();

        if !missing.is_empty() {
            self.enable_proxies(site_id, &missing).await?;
            info!(site_id, count = missing.len(), "Restored pool entries from durable store");
        }
        Ok(missing.len())
    }

    async fn acquire_or_fail(&self, site_id: i64) -> Result<crate::fast_store::LockGuard> {
        let key = self.keys.proxy_pool_lock(site_id);
        self.lock
            .acquire(&key)
            .await?
            .ok_or(ZartanError::LockUnavailable { key })
    }
}

fn parse_counter(raw: Option<String>) -> i64 {
    raw.and_then(|v| v.parse().ok()).unwrap_or(0)
}
