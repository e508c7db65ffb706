//! Fast store: hot, loss-tolerant state
//!
//! LRU scores, rolling success/failure counters, client leases and advisory
//! locks live here. Losing any of it only degrades rotation until the pools
//! are rebuilt from the durable store.

mod lock;
mod memory;
mod redis;

pub use self::lock::{AdvisoryLock, LockGuard};
pub use self::memory::MemoryFastStore;
pub use self::redis::RedisFastStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// The small command set the pool, lease and health code needs.
///
/// Individual commands are atomic; multi-command sequences are only atomic
/// while the caller holds the relevant `AdvisoryLock`.
#[async_trait]
pub trait FastStore: Send + Sync {
    // Sorted sets

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;

    /// Lowest scored member, ties broken by member order
    async fn zfirst(&self, key: &str) -> Result<Option<(String, f64)>>;

    async fn zcard(&self, key: &str) -> Result<u64>;

    async fn zmembers(&self, key: &str) -> Result<Vec<String>>;

    // Hashes

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    /// Atomic increment, returning the new value
    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64>;

    // Keys

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    // Lists

    /// Push to the head, keeping at most `max_len` entries
    async fn lpush_capped(&self, key: &str, value: &str, max_len: usize) -> Result<()>;

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>>;

    // Locks

    /// `SET key value NX PX ttl`; true when the key was set
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only while it still holds `value`
    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool>;
}

/// Key layout, prefixed with the configured namespace.
#[derive(Debug, Clone)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn key(&self, rest: String) -> String {
        if self.namespace.is_empty() {
            rest
        } else {
            format!("{}:{}", self.namespace, rest)
        }
    }

    /// Sorted set of proxy id -> last used (unix millis)
    pub fn proxy_pool(&self, site_id: i64) -> String {
        self.key(format!("site:{}:proxy_pool", site_id))
    }

    pub fn proxy_successes(&self, site_id: i64) -> String {
        self.key(format!("site:{}:proxy_successes", site_id))
    }

    pub fn proxy_failures(&self, site_id: i64) -> String {
        self.key(format!("site:{}:proxy_failures", site_id))
    }

    pub fn proxy_pool_lock(&self, site_id: i64) -> String {
        self.key(format!("site:{}:proxy_pool_lock", site_id))
    }

    /// Hash of site id -> reserved proxy id
    pub fn client_next_proxy(&self, client_id: &str) -> String {
        self.key(format!("client:{}:next_proxy", client_id))
    }

    /// Hash of site id -> reservation ready time (unix millis)
    pub fn client_next_proxy_available(&self, client_id: &str) -> String {
        self.key(format!("client:{}:next_proxy_available", client_id))
    }

    pub fn recent_decommissions(&self, source_id: i64) -> String {
        self.key(format!("source:{}:recent_decommissions", source_id))
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("zartan")
    }
}
