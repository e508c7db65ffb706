use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A leasable egress endpoint, identified by host and port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Proxy {
    pub id: i64,
    pub host: String,
    pub port: i32,
    /// Owning source; `None` only for rows created before a source claims them
    pub source_id: Option<i64>,
    #[serde(skip_serializing)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proxy {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Member name used for this proxy in the fast store
    pub fn member(&self) -> String {
        self.id.to_string()
    }
}

/// Outcome of asking for a proxy
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyResult {
    /// A proxy that is ready to use
    Proxy(Proxy),
    /// The least recently used proxy is still cooling down
    NotReady { proxy_id: i64, timeout: Duration },
    /// The pool is empty, locked, or pointed at a proxy that no longer exists
    NoProxy,
}

impl ProxyResult {
    pub fn is_proxy(&self) -> bool {
        matches!(self, ProxyResult::Proxy(_))
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        match self {
            ProxyResult::Proxy(p) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_proxy(id: i64) -> Proxy {
        Proxy {
            id,
            host: "10.0.0.1".to_string(),
            port: 3128,
            source_id: Some(1),
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_proxy_address_and_member() {
        let proxy = create_test_proxy(42);
        assert_eq!(proxy.address(), "10.0.0.1:3128");
        assert_eq!(proxy.member(), "42");
        assert!(proxy.is_active());
    }

    #[test]
    fn test_proxy_serialization_hides_deleted_at() {
        let mut proxy = create_test_proxy(7);
        proxy.deleted_at = Some(Utc::now());
        let json = serde_json::to_value(&proxy).unwrap();
        assert!(json.get("deleted_at").is_none());
        assert_eq!(json["host"], "10.0.0.1");
        assert_eq!(json["port"], 3128);
    }

    #[test]
    fn test_proxy_result_accessors() {
        let result = ProxyResult::Proxy(create_test_proxy(1));
        assert!(result.is_proxy());
        assert_eq!(result.proxy().map(|p| p.id), Some(1));

        let not_ready = ProxyResult::NotReady {
            proxy_id: 1,
            timeout: Duration::from_secs(3),
        };
        assert!(!not_ready.is_proxy());
        assert!(ProxyResult::NoProxy.proxy().is_none());
    }
}
