use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Long-term counters for one proxy on one site.
///
/// An active (non-deleted) row means the proxy is currently affiliated with
/// the site; its pool membership is the ephemeral mirror of that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ProxyPerformance {
    pub id: i64,
    pub proxy_id: i64,
    pub site_id: i64,
    pub times_succeeded: i64,
    pub times_failed: i64,
    pub reset_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProxyPerformance {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn total(&self) -> i64 {
        self.times_succeeded + self.times_failed
    }

    /// Success ratio, `None` when there is no history yet
    pub fn success_ratio(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.times_succeeded as f64 / total as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_ratio() {
        let mut perf = ProxyPerformance {
            id: 1,
            proxy_id: 1,
            site_id: 1,
            times_succeeded: 0,
            times_failed: 0,
            reset_at: None,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(perf.success_ratio(), None);

        perf.times_succeeded = 3;
        perf.times_failed = 1;
        assert_eq!(perf.total(), 4);
        assert_eq!(perf.success_ratio(), Some(0.75));
    }
}
