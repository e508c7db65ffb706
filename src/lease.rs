//! Clients and their proxy reservations
//!
//! When selection answers NotReady, the client keeps that proxy reserved for
//! the site and later polls are answered locally until it is ready, instead of
//! re-running selection and pushing back every other client's cooldown.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, ZartanError};
use crate::fast_store::{FastStore, Keys};
use crate::models::ProxyResult;
use crate::pool::ProxyPool;
use crate::store::DurableStore;

const KEEPALIVE_FIELD: &str = "keepalive";

/// An opaque bearer identity minted by `authenticate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: String,
}

#[derive(Clone)]
pub struct LeaseCache {
    pool: ProxyPool,
    durable: Arc<dyn DurableStore>,
    fast: Arc<dyn FastStore>,
    keys: Keys,
    clock: Arc<dyn Clock>,
    session_timeout: Duration,
}

impl LeaseCache {
    pub fn new(
        pool: ProxyPool,
        durable: Arc<dyn DurableStore>,
        fast: Arc<dyn FastStore>,
        keys: Keys,
        session_timeout: Duration,
    ) -> Self {
        let clock = pool.clock().clone();
        Self {
            pool,
            durable,
            fast,
            keys,
            clock,
            session_timeout,
        }
    }

    /// Mint a new client and start its session
    pub async fn authenticate(&self) -> Result<Client> {
        let client = Client {
            id: Uuid::new_v4().to_string(),
        };
        self.touch(&client.id).await?;
        debug!(client_id = %client.id, "Authenticated client");
        Ok(client)
    }

    /// A client is valid while both of its reservation keys exist
    pub async fn is_valid(&self, client_id: &str) -> Result<bool> {
        for key in self.client_keys(client_id) {
            if !self.fast.exists(&key).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Refresh the session TTL
    pub async fn touch(&self, client_id: &str) -> Result<()> {
        for key in self.client_keys(client_id) {
            self.fast.hset(&key, KEEPALIVE_FIELD, "true").await?;
            self.fast.expire(&key, self.session_timeout).await?;
        }
        Ok(())
    }

    /// Get a proxy for a client, honoring its reservation for the site
    pub async fn get_proxy(
        &self,
        client_id: &str,
        site_id: i64,
        older_than: i64,
    ) -> Result<ProxyResult> {
        let result = match self.reservation(client_id, site_id).await? {
            None => self.select_and_reserve(client_id, site_id, older_than).await?,
            Some((proxy_id, ready_at)) => {
                let now = self.clock.now_millis();
                if now < ready_at {
                    ProxyResult::NotReady {
                        proxy_id,
                        timeout: Duration::from_millis(ready_at.saturating_sub(now).unsigned_abs()),
                    }
                } else {
                    self.clear(client_id, site_id).await?;
                    self.claim_reserved(site_id, proxy_id).await?
                }
            }
        };

        self.touch(client_id).await?;
        Ok(result)
    }

    async fn select_and_reserve(
        &self,
        client_id: &str,
        site_id: i64,
        older_than: i64,
    ) -> Result<ProxyResult> {
        let result = self.pool.select_proxy(site_id, older_than).await?;
        if let ProxyResult::NotReady { proxy_id, timeout } = &result {
            let wait = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
            let ready_at = self.clock.now_millis().saturating_add(wait);
            self.reserve(client_id, site_id, *proxy_id, ready_at).await?;
        }
        Ok(result)
    }

    // Selection was skipped, so the pool still has to see the use.
    async fn claim_reserved(&self, site_id: i64, proxy_id: i64) -> Result<ProxyResult> {
        let Some(proxy) = self.durable.get_proxy(proxy_id).await? else {
            return Ok(ProxyResult::NoProxy);
        };
        match self.pool.touch_proxy(site_id, proxy_id).await {
            Ok(true) => Ok(ProxyResult::Proxy(proxy)),
            Ok(false) => {
                debug!(site_id, proxy_id, "Reserved proxy left the pool");
                Ok(ProxyResult::NoProxy)
            }
            Err(ZartanError::LockUnavailable { .. }) => Ok(ProxyResult::NoProxy),
            Err(e) => Err(e),
        }
    }

    async fn reservation(&self, client_id: &str, site_id: i64) -> Result<Option<(i64, i64)>> {
        let field = site_id.to_string();
        let ready_at = self
            .fast
            .hget(&self.keys.client_next_proxy_available(client_id), &field)
            .await?
            .and_then(|v| v.parse::<i64>().ok());
        let proxy_id = self
            .fast
            .hget(&self.keys.client_next_proxy(client_id), &field)
            .await?
            .and_then(|v| v.parse::<i64>().ok());

        match (proxy_id, ready_at) {
            (Some(proxy_id), Some(ready_at)) => Ok(Some((proxy_id, ready_at))),
            (None, None) => Ok(None),
            _ => {
                // Half a reservation is useless; drop it and select afresh.
                self.clear(client_id, site_id).await?;
                Ok(None)
            }
        }
    }

    async fn reserve(&self, client_id: &str, site_id: i64, proxy_id: i64, ready_at: i64) -> Result<()> {
        let field = site_id.to_string();
        self.fast
            .hset(&self.keys.client_next_proxy(client_id), &field, &proxy_id.to_string())
            .await?;
        self.fast
            .hset(
                &self.keys.client_next_proxy_available(client_id),
                &field,
                &ready_at.to_string(),
            )
            .await?;
        debug!(client_id, site_id, proxy_id, ready_at, "Reserved proxy");
        Ok(())
    }

    async fn clear(&self, client_id: &str, site_id: i64) -> Result<()> {
        let field = site_id.to_string();
        for key in self.client_keys(client_id) {
            self.fast.hdel(&key, &field).await?;
        }
        Ok(())
    }

    fn client_keys(&self, client_id: &str) -> [String; 2] {
        [
            self.keys.client_next_proxy(client_id),
            self.keys.client_next_proxy_available(client_id),
        ]
    }
}
