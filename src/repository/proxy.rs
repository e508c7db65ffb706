use crate::error::Result;
use crate::models::Proxy;
use sqlx::PgPool;
use tracing::info;

const PROXY_COLUMNS: &str = "id, host, port, source_id, deleted_at, created_at, updated_at";

/// Repository for proxy database operations
#[derive(Clone)]
pub struct ProxyRepository {
    pool: PgPool,
}

impl ProxyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get an active proxy by ID
    pub async fn get_active(&self, id: i64) -> Result<Option<Proxy>> {
        let proxy = sqlx::query_as::<_, Proxy>(&format!(
            "SELECT {} FROM proxies WHERE id = $1 AND deleted_at IS NULL",
            PROXY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(proxy)
    }

    /// Find a proxy by address, including soft-deleted rows
    pub async fn find_by_address(&self, host: &str, port: i32) -> Result<Option<Proxy>> {
        let proxy = sqlx::query_as::<_, Proxy>(&format!(
            "SELECT {} FROM proxies WHERE host = $1 AND port = $2",
            PROXY_COLUMNS
        ))
        .bind(host)
        .bind(port)
        .fetch_optional(&self.pool)
        .await?;

        Ok(proxy)
    }

    /// Create the proxy, or restore the existing row, and hand it to `source_id`
    pub async fn restore_or_create(&self, host: &str, port: i32, source_id: i64) -> Result<Proxy> {
        let proxy = sqlx::query_as::<_, Proxy>(&format!(
            r#"
            INSERT INTO proxies (host, port, source_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (host, port)
            DO UPDATE SET source_id = EXCLUDED.source_id, deleted_at = NULL
            RETURNING {}
            "#,
            PROXY_COLUMNS
        ))
        .bind(host)
        .bind(port)
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;

        info!(id = proxy.id, address = %proxy.address(), source_id, "Restored proxy");
        Ok(proxy)
    }

    /// Mark a proxy as deleted
    pub async fn soft_delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE proxies SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Whether any active proxy runs on `host`
    pub async fn active_host_exists(&self, host: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM proxies WHERE host = $1 AND deleted_at IS NULL)",
        )
        .bind(host)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Count active proxies owned by a source
    pub async fn count_active_by_source(&self, source_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM proxies WHERE source_id = $1 AND deleted_at IS NULL",
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Active proxies of a source that have never been joined to `site_id`
    pub async fn retrieve_unaffiliated(
        &self,
        source_id: i64,
        site_id: i64,
        limit: i64,
    ) -> Result<Vec<Proxy>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let proxies = sqlx::query_as::<_, Proxy>(
            r#"
            SELECT p.id, p.host, p.port, p.source_id, p.deleted_at, p.created_at, p.updated_at
            FROM proxies p
            WHERE p.source_id = $1
              AND p.deleted_at IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM proxy_performances pp
                  WHERE pp.proxy_id = p.id AND pp.site_id = $2
              )
            ORDER BY p.id
            LIMIT $3
            "#,
        )
        .bind(source_id)
        .bind(site_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(proxies)
    }
}
