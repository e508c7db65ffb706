use tracing::{info, warn};

use super::SourceManager;
use crate::error::{Result, ZartanError};
use crate::models::{Proxy, Source};

/// Whether another source keeps a contested proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceConflict {
    pub conflict_exists: bool,
}

impl SourceConflict {
    const NONE: SourceConflict = SourceConflict {
        conflict_exists: false,
    };
    const EXISTS: SourceConflict = SourceConflict {
        conflict_exists: true,
    };
}

impl SourceManager {
    /// Record `host:port` as a proxy of `source`, joining it to `site_id` if given.
    ///
    /// Returns `None` when a more reliable source already owns the address;
    /// `source` has then torn down its own copy. Safe to repeat.
    pub async fn add_proxy(
        &self,
        source: &Source,
        host: &str,
        port: i32,
        site_id: Option<i64>,
    ) -> Result<Option<Proxy>> {
        if let Some(existing) = self.durable.find_proxy(host, port).await? {
            if self.fix_source_conflicts(&existing, source).await?.conflict_exists {
                return Ok(None);
            }
        }

        let proxy = self
            .durable
            .restore_or_create_proxy(host, port, source.id)
            .await?;

        if let Some(site_id) = site_id {
            self.durable.affiliate_proxies(site_id, &[proxy.id]).await?;
            match self.pool.enable_proxy(site_id, proxy.id).await {
                Ok(()) => {}
                // The next site analysis re-syncs the pool from the durable row.
                Err(ZartanError::LockUnavailable { .. }) => {
                    warn!(site_id, proxy_id = proxy.id, "Pool busy, proxy will be pooled on next sync");
                }
                Err(e) => return Err(e),
            }
        }

        info!(source_id = source.id, proxy_id = proxy.id, address = %proxy.address(), ?site_id, "Added proxy");
        Ok(Some(proxy))
    }

    /// Settle ownership of `proxy` between its current owner and `source`.
    ///
    /// The less reliable side tears its copy down; on a tie the newcomer loses.
    pub async fn fix_source_conflicts(&self, proxy: &Proxy, source: &Source) -> Result<SourceConflict> {
        if !proxy.is_active() {
            return Ok(SourceConflict::NONE);
        }
        let Some(owner_id) = proxy.source_id.filter(|id| *id != source.id) else {
            return Ok(SourceConflict::NONE);
        };
        let Some(owner) = self.durable.get_source(owner_id).await? else {
            return Ok(SourceConflict::NONE);
        };

        if owner.reliability < source.reliability {
            info!(
                proxy_id = proxy.id,
                from = owner.id,
                to = source.id,
                "Taking proxy from less reliable source"
            );
            if !self.decommission(&owner, proxy).await? {
                warn!(proxy_id = proxy.id, source_id = owner.id, "Could not tear down displaced server");
            }
            Ok(SourceConflict::NONE)
        } else {
            info!(
                proxy_id = proxy.id,
                owner = owner.id,
                loser = source.id,
                "Proxy already owned by a more reliable source"
            );
            if !self.decommission(source, proxy).await? {
                warn!(proxy_id = proxy.id, source_id = source.id, "Could not tear down duplicate server");
            }
            Ok(SourceConflict::EXISTS)
        }
    }
}
