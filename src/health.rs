//! Proxy health tracking
//!
//! Clients report every proxy use. Reports land in rolling counters in the
//! fast store; analysis passes fold them into the durable performance rows and
//! evict proxies whose success ratio falls below the threshold once enough
//! samples exist.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::Tunables;
use crate::error::{Result, ZartanError};
use crate::jobs::{Job, JobQueue};
use crate::pool::{Outcome, ProxyPool};
use crate::requestor::ProxyRequestor;
use crate::store::DurableStore;

const BASIS_POINTS: u64 = 10_000;

/// When a proxy has been seen enough to be judged, and what fails it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionPolicy {
    pub failure_threshold: u64,
    pub success_ratio_threshold: f64,
    pub min_sample_size: Option<u64>,
}

impl From<&Tunables> for EvictionPolicy {
    fn from(t: &Tunables) -> Self {
        Self {
            failure_threshold: t.failure_threshold,
            success_ratio_threshold: t.success_ratio_threshold,
            min_sample_size: t.min_sample_size,
        }
    }
}

impl EvictionPolicy {
    /// Fewest uses before a verdict is allowed.
    ///
    /// Defaults to `ceil(failure_threshold / (1 - success_ratio_threshold))`,
    /// the smallest sample in which `failure_threshold` failures can still
    /// leave the ratio at the threshold. Never below 2.
    ///
    /// The ratio is taken in basis points so that thresholds like 0.9 do not
    /// pick up a float error in the ceiling.
    pub fn min_sample(&self) -> u64 {
        let ratio_bp =
            (self.success_ratio_threshold.clamp(0.0, 1.0) * BASIS_POINTS as f64).round() as u64;
        let failing_bp = BASIS_POINTS - ratio_bp;
        let computed = if failing_bp == 0 {
            self.failure_threshold
        } else {
            self.failure_threshold
                .saturating_mul(BASIS_POINTS)
                .div_ceil(failing_bp)
        };
        self.min_sample_size.unwrap_or(computed).max(2)
    }

    pub fn should_evict(&self, succeeded: i64, failed: i64) -> bool {
        let total = succeeded + failed;
        if total <= 0 || (total as u64) < self.min_sample() {
            return false;
        }
        (succeeded as f64 / total as f64) < self.success_ratio_threshold
    }
}

/// Counters taken from the fast store for one analysis window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyReport {
    Report { succeeded: i64, failed: i64 },
    /// The pool lock was busy; try again later, this is not zero usage
    NoPerformanceReport,
}

#[derive(Clone)]
pub struct HealthTracker {
    pool: ProxyPool,
    durable: Arc<dyn DurableStore>,
    jobs: Arc<dyn JobQueue>,
    requestor: ProxyRequestor,
    policy: EvictionPolicy,
}

impl HealthTracker {
    pub fn new(
        pool: ProxyPool,
        durable: Arc<dyn DurableStore>,
        jobs: Arc<dyn JobQueue>,
        requestor: ProxyRequestor,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            pool,
            durable,
            jobs,
            requestor,
            policy,
        }
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    pub async fn proxy_succeeded(&self, site_id: i64, proxy_id: i64) -> Result<()> {
        if !self.is_affiliated(site_id, proxy_id).await? {
            return Ok(());
        }
        self.pool
            .record_outcome(site_id, proxy_id, Outcome::Succeeded)
            .await?;
        Ok(())
    }

    /// Count a failure; at `failure_threshold` a targeted analysis is queued
    pub async fn proxy_failed(&self, site_id: i64, proxy_id: i64) -> Result<()> {
        if !self.is_affiliated(site_id, proxy_id).await? {
            return Ok(());
        }
        let failures = self
            .pool
            .record_outcome(site_id, proxy_id, Outcome::Failed)
            .await?;

        if let Some(failures) = failures {
            if failures as u64 >= self.policy.failure_threshold {
                debug!(site_id, proxy_id, failures, "Failure threshold reached");
                self.jobs
                    .enqueue(Job::TargetedPerformanceAnalyzer { site_id, proxy_id })
                    .await?;
            }
        }
        Ok(())
    }

    async fn is_affiliated(&self, site_id: i64, proxy_id: i64) -> Result<bool> {
        let active = self
            .durable
            .get_active_performance(site_id, proxy_id)
            .await?
            .is_some();
        if !active {
            debug!(site_id, proxy_id, "Ignoring report for unaffiliated proxy");
        }
        Ok(active)
    }

    /// Snapshot and reset the rolling counters of a proxy
    pub async fn generate_proxy_report(&self, site_id: i64, proxy_id: i64) -> Result<ProxyReport> {
        Ok(match self.pool.take_counters(site_id, proxy_id).await? {
            Some((succeeded, failed)) => ProxyReport::Report { succeeded, failed },
            None => ProxyReport::NoPerformanceReport,
        })
    }

    /// Fold the current window into the durable row and evict if it fails.
    ///
    /// Returns whether the proxy was disabled.
    pub async fn disable_proxy_if_bad(&self, site_id: i64, proxy_id: i64) -> Result<bool> {
        let (succeeded, failed) = match self.generate_proxy_report(site_id, proxy_id).await? {
            ProxyReport::Report { succeeded, failed } => (succeeded, failed),
            ProxyReport::NoPerformanceReport => {
                debug!(site_id, proxy_id, "Pool busy, skipping proxy this cycle");
                return Ok(false);
            }
        };

        let Some(performance) = self
            .durable
            .increment_performance(site_id, proxy_id, succeeded, failed)
            .await?
        else {
            return Ok(false);
        };

        if !self
            .policy
            .should_evict(performance.times_succeeded, performance.times_failed)
        {
            return Ok(false);
        }

        match self.pool.disable_proxy(site_id, proxy_id).await {
            Ok(()) => {
                info!(
                    site_id,
                    proxy_id,
                    succeeded = performance.times_succeeded,
                    failed = performance.times_failed,
                    "Evicted failing proxy"
                );
                Ok(true)
            }
            Err(ZartanError::LockUnavailable { .. }) => {
                warn!(site_id, proxy_id, "Pool busy, eviction deferred");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Judge one proxy, then top the site back up
    #[instrument(skip(self))]
    pub async fn analyze_proxy(&self, site_id: i64, proxy_id: i64) -> Result<bool> {
        let disabled = self.disable_proxy_if_bad(site_id, proxy_id).await?;
        self.requestor.run_for(site_id).await?;
        Ok(disabled)
    }

    /// Rebuild the pool, judge every affiliated proxy, then top the site up.
    ///
    /// Returns how many proxies were evicted.
    #[instrument(skip(self))]
    pub async fn analyze_site(&self, site_id: i64) -> Result<usize> {
        if let Err(e) = self.pool.sync_with_durable(site_id).await {
            warn!(site_id, error = %e, "Pool rebuild failed, judging what is pooled");
        }

        let mut disabled = 0;
        for performance in self.durable.active_performances(site_id).await? {
            let proxy_id = performance.proxy_id;
            match self.disable_proxy_if_bad(site_id, proxy_id).await {
                Ok(true) => disabled += 1,
                Ok(false) => {}
                Err(e) => warn!(site_id, proxy_id, error = %e, "Proxy analysis failed"),
            }
        }

        self.requestor.run_for(site_id).await?;
        debug!(site_id, disabled, "Site analysis complete");
        Ok(disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fast_store::FastStore;
    use crate::models::Site;
    use crate::requestor::testing::requestor;
    use crate::sources::testing::SourceFixture;

    fn policy(failure_threshold: u64, ratio: f64) -> EvictionPolicy {
        EvictionPolicy {
            failure_threshold,
            success_ratio_threshold: ratio,
            min_sample_size: None,
        }
    }

    fn tracker(fx: &SourceFixture, policy: EvictionPolicy) -> HealthTracker {
        HealthTracker::new(
            fx.pool.clone(),
            fx.durable.clone(),
            fx.jobs.clone(),
            requestor(fx),
            policy,
        )
    }

    // A full site with `count` pooled proxies from a static list.
    async fn full_site(fx: &SourceFixture, count: usize) -> (Site, Vec<i64>) {
        let site = fx.durable.find_or_create_site("example.com").await.unwrap();
        let site = fx
            .durable
            .set_site_bounds(site.id, 1, count as i32)
            .unwrap();
        let list = fx.static_source("list", 1.0).await;
        let mut ids = Vec::new();
        for i in 0..count {
            let proxy = fx
                .manager
                .add_proxy(&list, &format!("10.6.0.{}", i), 8080, Some(site.id))
                .await
                .unwrap()
                .unwrap();
            ids.push(proxy.id);
        }
        (site, ids)
    }

    #[test]
    fn test_min_sample() {
        assert_eq!(policy(10, 0.5).min_sample(), 20);
        assert_eq!(policy(3, 0.9).min_sample(), 30);
        assert_eq!(policy(1, 0.0).min_sample(), 2);
        assert_eq!(policy(4, 1.0).min_sample(), 4);
        assert_eq!(policy(3, 0.7).min_sample(), 10);
        assert_eq!(policy(5, 0.8).min_sample(), 25);
        let overridden = EvictionPolicy {
            min_sample_size: Some(7),
            ..policy(10, 0.5)
        };
        assert_eq!(overridden.min_sample(), 7);
    }

    #[test]
    fn test_single_failure_never_evicts() {
        for p in [policy(1, 0.99), policy(0, 0.5), policy(1, 1.0)] {
            assert!(!p.should_evict(0, 1));
        }
    }

    #[test]
    fn test_evicts_only_with_enough_samples() {
        let p = policy(2, 0.5);
        assert!(!p.should_evict(0, 3));
        assert!(p.should_evict(1, 3));
        assert!(!p.should_evict(2, 2));
        assert!(!p.should_evict(10, 0));
    }

    #[tokio::test]
    async fn test_reports_for_unaffiliated_proxy_are_ignored() {
        let fx = SourceFixture::new();
        let (site, ids) = full_site(&fx, 1).await;
        let health = tracker(&fx, policy(1, 0.5));
        fx.durable.soft_delete_performance(site.id, ids[0]).await.unwrap();

        health.proxy_failed(site.id, ids[0]).await.unwrap();
        health.proxy_succeeded(site.id, ids[0]).await.unwrap();

        assert_eq!(
            health.generate_proxy_report(site.id, ids[0]).await.unwrap(),
            ProxyReport::Report {
                succeeded: 0,
                failed: 0
            }
        );
        assert!(fx.jobs.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_failure_threshold_queues_targeted_analysis() {
        let fx = SourceFixture::new();
        let (site, ids) = full_site(&fx, 1).await;
        let health = tracker(&fx, policy(3, 0.5));

        health.proxy_failed(site.id, ids[0]).await.unwrap();
        health.proxy_failed(site.id, ids[0]).await.unwrap();
        assert!(fx.jobs.jobs().is_empty());

        health.proxy_failed(site.id, ids[0]).await.unwrap();
        assert_eq!(
            fx.jobs.jobs(),
            vec![Job::TargetedPerformanceAnalyzer {
                site_id: site.id,
                proxy_id: ids[0]
            }]
        );
    }

    #[tokio::test]
    async fn test_busy_lock_is_no_report() {
        let fx = SourceFixture::new();
        let (site, ids) = full_site(&fx, 1).await;
        let health = tracker(&fx, policy(1, 0.5));
        health.proxy_failed(site.id, ids[0]).await.unwrap();

        let lock = crate::fast_store::AdvisoryLock::new(
            fx.fast.clone(),
            std::time::Duration::from_secs(60),
            std::time::Duration::from_millis(20),
        );
        let held = lock
            .acquire(&fx.keys.proxy_pool_lock(site.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            health.generate_proxy_report(site.id, ids[0]).await.unwrap(),
            ProxyReport::NoPerformanceReport
        );
        assert!(!health.disable_proxy_if_bad(site.id, ids[0]).await.unwrap());
        held.release().await.unwrap();

        // The failure was kept for the next window.
        assert_eq!(
            health.generate_proxy_report(site.id, ids[0]).await.unwrap(),
            ProxyReport::Report {
                succeeded: 0,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_history_accumulates_until_sample_is_large_enough() {
        let fx = SourceFixture::new();
        let (site, ids) = full_site(&fx, 2).await;
        let health = tracker(&fx, policy(2, 0.5));
        let proxy_id = ids[0];

        health.proxy_succeeded(site.id, proxy_id).await.unwrap();
        health.proxy_failed(site.id, proxy_id).await.unwrap();
        health.proxy_failed(site.id, proxy_id).await.unwrap();
        assert!(!health.disable_proxy_if_bad(site.id, proxy_id).await.unwrap());

        health.proxy_failed(site.id, proxy_id).await.unwrap();
        assert!(health.disable_proxy_if_bad(site.id, proxy_id).await.unwrap());

        let row = fx.durable.performance_row(site.id, proxy_id).unwrap();
        assert_eq!((row.times_succeeded, row.times_failed), (1, 3));
        assert!(!row.is_active());
        assert_eq!(fx.pool.pool_size(site.id).await.unwrap(), 1);
        assert!(fx
            .jobs
            .jobs()
            .contains(&Job::DecommissionProxy { proxy_id }));
    }

    #[tokio::test]
    async fn test_site_analysis_rebuilds_evicts_and_backfills() {
        let fx = SourceFixture::new();
        let (site, ids) = full_site(&fx, 3).await;
        let cloud = fx.cloud_source("cloud", 1.0, 20).await;
        let health = tracker(&fx, policy(1, 0.5));

        for _ in 0..2 {
            health.proxy_failed(site.id, ids[1]).await.unwrap();
        }
        for _ in 0..2 {
            health.proxy_succeeded(site.id, ids[2]).await.unwrap();
        }
        fx.jobs.take();
        fx.fast
            .zrem(&fx.keys.proxy_pool(site.id), &ids[0].to_string())
            .await
            .unwrap();

        assert_eq!(health.analyze_site(site.id).await.unwrap(), 1);

        assert_eq!(fx.pool.pool_size(site.id).await.unwrap(), 2);
        assert_eq!(
            fx.jobs.jobs(),
            vec![
                Job::DecommissionProxy { proxy_id: ids[1] },
                Job::ProvisionProxies {
                    site_id: Some(site.id),
                    source_id: cloud.id,
                    desired_total: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_site_analysis_backfills_after_failed_eviction() {
        let fx = SourceFixture::new();
        let (site, ids) = full_site(&fx, 3).await;
        let cloud = fx.cloud_source("cloud", 1.0, 20).await;
        let health = tracker(&fx, policy(1, 0.5));

        for id in &ids[..2] {
            health.proxy_failed(site.id, *id).await.unwrap();
            health.proxy_failed(site.id, *id).await.unwrap();
        }
        fx.jobs.take();
        fx.jobs.refuse("decommission_proxy");

        assert_eq!(health.analyze_site(site.id).await.unwrap(), 0);

        assert!(fx.jobs.jobs().iter().any(|job| matches!(
            job,
            Job::ProvisionProxies { site_id: Some(s), source_id, .. }
                if *s == site.id && *source_id == cloud.id
        )));
    }
}
