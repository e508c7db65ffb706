use crate::error::Result;
use crate::models::ProxyPerformance;
use sqlx::PgPool;
use tracing::info;

const PERFORMANCE_COLUMNS: &str = "id, proxy_id, site_id, times_succeeded, times_failed, reset_at, \
                                   deleted_at, created_at, updated_at";

/// Repository for proxy/site affiliation rows
#[derive(Clone)]
pub struct PerformanceRepository {
    pool: PgPool,
}

impl PerformanceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The active affiliation of a proxy with a site, if any
    pub async fn get_active(&self, site_id: i64, proxy_id: i64) -> Result<Option<ProxyPerformance>> {
        let perf = sqlx::query_as::<_, ProxyPerformance>(&format!(
            r#"
            SELECT {} FROM proxy_performances
            WHERE site_id = $1 AND proxy_id = $2 AND deleted_at IS NULL
            "#,
            PERFORMANCE_COLUMNS
        ))
        .bind(site_id)
        .bind(proxy_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(perf)
    }

    /// Restore or create one affiliation row per proxy, all in one transaction.
    ///
    /// Restoring zeroes the counters; the row is never duplicated.
    pub async fn restore_or_create_batch(
        &self,
        site_id: i64,
        proxy_ids: &[i64],
    ) -> Result<Vec<ProxyPerformance>> {
        if proxy_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut rows = Vec::with_capacity(proxy_ids.len());

        for &proxy_id in proxy_ids {
            let row = sqlx::query_as::<_, ProxyPerformance>(&format!(
                r#"
                INSERT INTO proxy_performances (proxy_id, site_id)
                VALUES ($1, $2)
                ON CONFLICT (proxy_id, site_id)
                DO UPDATE SET deleted_at = NULL, times_succeeded = 0, times_failed = 0,
                              reset_at = NULL
                RETURNING {}
                "#,
                PERFORMANCE_COLUMNS
            ))
            .bind(proxy_id)
            .bind(site_id)
            .fetch_one(&mut *tx)
            .await?;
            rows.push(row);
        }

        tx.commit().await?;

        info!(site_id, count = rows.len(), "Affiliated proxies with site");
        Ok(rows)
    }

    /// Mark the affiliation deleted; the row itself is kept for history
    pub async fn soft_delete(&self, site_id: i64, proxy_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE proxy_performances SET deleted_at = NOW()
            WHERE site_id = $1 AND proxy_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(site_id)
        .bind(proxy_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Add a report window to the long-term counters of an active affiliation
    pub async fn increment(
        &self,
        site_id: i64,
        proxy_id: i64,
        succeeded: i64,
        failed: i64,
    ) -> Result<Option<ProxyPerformance>> {
        let perf = sqlx::query_as::<_, ProxyPerformance>(&format!(
            r#"
            UPDATE proxy_performances
            SET times_succeeded = times_succeeded + $3,
                times_failed = times_failed + $4
            WHERE site_id = $1 AND proxy_id = $2 AND deleted_at IS NULL
            RETURNING {}
            "#,
            PERFORMANCE_COLUMNS
        ))
        .bind(site_id)
        .bind(proxy_id)
        .bind(succeeded)
        .bind(failed)
        .fetch_optional(&self.pool)
        .await?;

        Ok(perf)
    }

    /// Active affiliations of a site whose proxy is still active
    pub async fn get_active_by_site(&self, site_id: i64) -> Result<Vec<ProxyPerformance>> {
        let perfs = sqlx::query_as::<_, ProxyPerformance>(
            r#"
            SELECT pp.id, pp.proxy_id, pp.site_id, pp.times_succeeded, pp.times_failed,
                   pp.reset_at, pp.deleted_at, pp.created_at, pp.updated_at
            FROM proxy_performances pp
            JOIN proxies p ON p.id = pp.proxy_id
            WHERE pp.site_id = $1
              AND pp.deleted_at IS NULL
              AND p.deleted_at IS NULL
            ORDER BY pp.proxy_id
            "#,
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(perfs)
    }

    /// Number of sites a proxy is currently affiliated with
    pub async fn count_active_by_proxy(&self, proxy_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM proxy_performances WHERE proxy_id = $1 AND deleted_at IS NULL",
        )
        .bind(proxy_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Summed (succeeded, failed) over every proxy of a source on a site
    pub async fn totals_for_source(&self, source_id: i64, site_id: i64) -> Result<(i64, i64)> {
        let totals: (i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(pp.times_succeeded), 0)::BIGINT,
                   COALESCE(SUM(pp.times_failed), 0)::BIGINT
            FROM proxy_performances pp
            JOIN proxies p ON p.id = pp.proxy_id
            WHERE pp.site_id = $1 AND p.source_id = $2
            "#,
        )
        .bind(site_id)
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(totals)
    }
}
