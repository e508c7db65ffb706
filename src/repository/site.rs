use crate::error::Result;
use crate::models::{Site, DEFAULT_MAX_PROXIES, DEFAULT_MIN_PROXIES};
use sqlx::PgPool;

const SITE_COLUMNS: &str = "id, name, min_proxies, max_proxies, deleted_at, created_at, updated_at";

/// Repository for site database operations
#[derive(Clone)]
pub struct SiteRepository {
    pool: PgPool,
}

impl SiteRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Site>> {
        let site = sqlx::query_as::<_, Site>(&format!(
            "SELECT {} FROM sites WHERE id = $1 AND deleted_at IS NULL",
            SITE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(site)
    }

    /// Look a site up by name, creating it with default bounds on first use
    pub async fn find_or_create(&self, name: &str) -> Result<Site> {
        let site = sqlx::query_as::<_, Site>(&format!(
            r#"
            INSERT INTO sites (name, min_proxies, max_proxies)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET deleted_at = NULL
            RETURNING {}
            "#,
            SITE_COLUMNS
        ))
        .bind(name)
        .bind(DEFAULT_MIN_PROXIES)
        .bind(DEFAULT_MAX_PROXIES)
        .fetch_one(&self.pool)
        .await?;

        Ok(site)
    }

    pub async fn get_all(&self) -> Result<Vec<Site>> {
        let sites = sqlx::query_as::<_, Site>(&format!(
            "SELECT {} FROM sites WHERE deleted_at IS NULL ORDER BY id",
            SITE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(sites)
    }
}
