//! Demand-driven provisioning
//!
//! Fills a site's shortfall source by source, best success ratio first.
//! Each source's share is taken from its idle proxies before anything new is
//! provisioned. The apportionment is a greedy single pass: later sources split
//! whatever demand and ratio mass is left, so rounding can over- or
//! under-shoot by a little and the next cycle corrects it.

mod ranking;

pub use ranking::{rank_sources, success_ratio, RankedSource};

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{Result, ZartanError};
use crate::models::{Site, Source};
use crate::pool::ProxyPool;
use crate::sources::SourceManager;
use crate::store::DurableStore;

/// What one requestor pass did for a site
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestSummary {
    /// Shortfall at the start of the pass
    pub needed: i64,
    /// Idle proxies joined to the site
    pub reused: i64,
    /// Proxies handed to provisioning jobs
    pub requested: i64,
}

/// A source's part of the remaining demand.
///
/// Rounds half away from zero; with no ratio mass left the remainder is split
/// evenly across the remaining sources.
pub fn share_of(needed: i64, ratio: f64, ratio_sum: f64, remaining_sources: usize) -> i64 {
    if needed <= 0 {
        return 0;
    }
    let share = if ratio_sum > f64::EPSILON {
        needed as f64 * ratio / ratio_sum
    } else {
        needed as f64 / remaining_sources.max(1) as f64
    };
    (share.round() as i64).max(0)
}

#[derive(Clone)]
pub struct ProxyRequestor {
    durable: Arc<dyn DurableStore>,
    pool: ProxyPool,
    sources: SourceManager,
}

impl ProxyRequestor {
    pub fn new(durable: Arc<dyn DurableStore>, pool: ProxyPool, sources: SourceManager) -> Self {
        Self {
            durable,
            pool,
            sources,
        }
    }

    /// Run a pass for a site by id; `None` if the site is gone
    pub async fn run_for(&self, site_id: i64) -> Result<Option<RequestSummary>> {
        match self.durable.get_site(site_id).await? {
            Some(site) => self.run(&site).await.map(Some),
            None => Ok(None),
        }
    }

    /// Bring the site's pool up to `max_proxies`
    #[instrument(skip(self, site), fields(site_id = site.id))]
    pub async fn run(&self, site: &Site) -> Result<RequestSummary> {
        let pool_size = self.pool.pool_size(site.id).await?;
        let mut needed = site.proxies_needed(pool_size);
        let mut summary = RequestSummary {
            needed,
            ..Default::default()
        };
        if needed <= 0 {
            debug!(pool_size, "Site has enough proxies");
            return Ok(summary);
        }
        if site.below_minimum(pool_size) {
            warn!(pool_size, min = site.min_proxies, "Site is below its minimum");
        }

        let ranked = rank_sources(self.durable.as_ref(), site.id).await?;
        let mut ratio_sum: f64 = ranked.iter().map(|r| r.ratio).sum();
        let mut remaining = ranked.len();

        for RankedSource { source, ratio } in ranked {
            if needed <= 0 {
                break;
            }

            let share = share_of(needed, ratio, ratio_sum, remaining);
            let reused = self.reuse_idle(&source, site.id, share).await?;
            let requested = self
                .sources
                .enqueue_provision(&source, Some(site.id), share - reused)
                .await?;

            debug!(source_id = source.id, ratio, share, reused, requested, "Apportioned demand");

            needed -= reused + requested;
            summary.reused += reused;
            summary.requested += requested;
            ratio_sum = (ratio_sum - ratio).max(0.0);
            remaining -= 1;
        }

        info!(
            needed = summary.needed,
            reused = summary.reused,
            requested = summary.requested,
            "Requested proxies for site"
        );
        Ok(summary)
    }

    /// Join up to `share` idle proxies of `source` to the site.
    ///
    /// The durable rows are written in one batch first; if pooling them fails
    /// the next pool sync restores them.
    async fn reuse_idle(&self, source: &Source, site_id: i64, share: i64) -> Result<i64> {
        if share <= 0 {
            return Ok(0);
        }
        let idle = self
            .durable
            .retrieve_unaffiliated(source.id, site_id, share)
            .await?;
        if idle.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = idle.iter().map(|p| p.id).collect();
        self.durable.affiliate_proxies(site_id, &ids).await?;
        match self.pool.enable_proxies(site_id, &ids).await {
            Ok(()) => {}
            Err(ZartanError::LockUnavailable { .. }) => {
                warn!(site_id, count = ids.len(), "Pool busy, proxies will be pooled on next sync");
            }
            Err(e) => return Err(e),
        }
        Ok(ids.len() as i64)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::sources::testing::SourceFixture;

    pub fn requestor(fx: &SourceFixture) -> ProxyRequestor {
        ProxyRequestor::new(fx.durable.clone(), fx.pool.clone(), fx.manager.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::requestor;
    use super::*;
    use crate::jobs::Job;
    use crate::sources::testing::SourceFixture;

    #[test]
    fn test_share_of_rounding() {
        assert_eq!(share_of(10, 0.75, 1.0, 2), 8);
        assert_eq!(share_of(2, 0.25, 0.25, 1), 2);
        assert_eq!(share_of(5, 0.5, 1.0, 2), 3);
        assert_eq!(share_of(7, 0.0, 0.0, 2), 4);
        assert_eq!(share_of(0, 1.0, 1.0, 1), 0);
        assert_eq!(share_of(-3, 1.0, 1.0, 1), 0);
    }

    // Leave per-site history for a source without leaving usable proxies behind.
    async fn give_history(fx: &SourceFixture, source_id: i64, site_id: i64, host: &str, s: i64, f: i64) {
        let proxy = fx
            .durable
            .restore_or_create_proxy(host, 3128, source_id)
            .await
            .unwrap();
        fx.durable.affiliate_proxies(site_id, &[proxy.id]).await.unwrap();
        fx.durable
            .increment_performance(site_id, proxy.id, s, f)
            .await
            .unwrap();
        fx.durable.soft_delete_performance(site_id, proxy.id).await.unwrap();
        fx.durable.soft_delete_proxy(proxy.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_apportions_by_success_ratio() {
        let fx = SourceFixture::new();
        let site = fx.durable.find_or_create_site("example.com").await.unwrap();
        let good = fx.cloud_source("good", 5.0, 20).await;
        let poor = fx.linode_source("poor", 5.0, 20).await;
        give_history(&fx, good.id, site.id, "10.3.0.1", 3, 1).await;
        give_history(&fx, poor.id, site.id, "10.3.0.2", 1, 3).await;

        let summary = requestor(&fx).run(&site).await.unwrap();

        assert_eq!(
            summary,
            RequestSummary {
                needed: 10,
                reused: 0,
                requested: 10
            }
        );
        assert_eq!(
            fx.jobs.jobs(),
            vec![
                Job::ProvisionProxies {
                    site_id: Some(site.id),
                    source_id: good.id,
                    desired_total: 8
                },
                Job::ProvisionProxies {
                    site_id: Some(site.id),
                    source_id: poor.id,
                    desired_total: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_reuses_idle_proxies_before_provisioning() {
        let fx = SourceFixture::new();
        let site = fx.durable.find_or_create_site("example.com").await.unwrap();
        let list = fx.static_source("list", 1.0).await;
        for i in 0..3 {
            fx.durable
                .restore_or_create_proxy(&format!("10.4.0.{}", i), 8080, list.id)
                .await
                .unwrap();
        }
        let cloud = fx.cloud_source("cloud", 1.0, 20).await;

        let summary = requestor(&fx).run(&site).await.unwrap();

        assert_eq!(summary.reused, 3);
        assert_eq!(summary.requested, 7);
        assert_eq!(fx.pool.pool_size(site.id).await.unwrap(), 3);
        assert_eq!(fx.durable.active_performances(site.id).await.unwrap().len(), 3);
        assert_eq!(
            fx.jobs.jobs(),
            vec![Job::ProvisionProxies {
                site_id: Some(site.id),
                source_id: cloud.id,
                desired_total: 7
            }]
        );
    }

    #[tokio::test]
    async fn test_capped_source_passes_demand_on() {
        let fx = SourceFixture::new();
        let site = fx.durable.find_or_create_site("example.com").await.unwrap();
        let small = fx.cloud_source("small", 1.0, 2).await;
        let large = fx.linode_source("large", 1.0, 50).await;

        let summary = requestor(&fx).run(&site).await.unwrap();

        // small takes 2 of its 5, large is asked for the remaining 8
        assert_eq!(summary.requested, 10);
        assert_eq!(
            fx.jobs.jobs(),
            vec![
                Job::ProvisionProxies {
                    site_id: Some(site.id),
                    source_id: small.id,
                    desired_total: 2
                },
                Job::ProvisionProxies {
                    site_id: Some(site.id),
                    source_id: large.id,
                    desired_total: 8
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_full_site_is_left_alone() {
        let fx = SourceFixture::new();
        let site = fx.durable.find_or_create_site("example.com").await.unwrap();
        let site = fx.durable.set_site_bounds(site.id, 1, 2).unwrap();
        let list = fx.static_source("list", 1.0).await;
        for i in 0..2 {
            let proxy = fx
                .durable
                .restore_or_create_proxy(&format!("10.5.0.{}", i), 8080, list.id)
                .await
                .unwrap();
            fx.pool.enable_proxy(site.id, proxy.id).await.unwrap();
        }
        fx.cloud_source("cloud", 1.0, 20).await;

        let summary = requestor(&fx).run(&site).await.unwrap();

        assert_eq!(summary.needed, 0);
        assert!(fx.jobs.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_missing_site_is_skipped() {
        let fx = SourceFixture::new();
        assert_eq!(requestor(&fx).run_for(404).await.unwrap(), None);
    }
}
