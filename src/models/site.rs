use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Default bounds for sites created on first use
pub const DEFAULT_MIN_PROXIES: i32 = 5;
pub const DEFAULT_MAX_PROXIES: i32 = 10;

/// A scraping target consuming a pool of proxies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub min_proxies: i32,
    pub max_proxies: i32,
    #[serde(skip_serializing)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    /// How many proxies must be added to reach `max_proxies`
    pub fn proxies_needed(&self, pool_size: u64) -> i64 {
        self.max_proxies as i64 - pool_size as i64
    }

    pub fn below_minimum(&self, pool_size: u64) -> bool {
        (pool_size as i64) < self.min_proxies as i64
    }

    /// Site names are used in URLs and may contain dots
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-')
            })
    }
}
