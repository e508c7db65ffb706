use crate::error::Result;
use crate::models::Source;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;

const SOURCE_COLUMNS: &str = "id, name, source_type, reliability, max_proxies, config, errors, \
                              deleted_at, created_at, updated_at";

/// Fields needed to register a source
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub source_type: String,
    pub reliability: f64,
    pub max_proxies: i32,
    pub config: Value,
}

/// Repository for source database operations
#[derive(Clone)]
pub struct SourceRepository {
    pool: PgPool,
}

impl SourceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a source by ID (active only)
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Source>> {
        let source = sqlx::query_as::<_, Source>(&format!(
            "SELECT {} FROM sources WHERE id = $1 AND deleted_at IS NULL",
            SOURCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(source)
    }

    /// Get all active sources
    pub async fn get_all(&self) -> Result<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>(&format!(
            "SELECT {} FROM sources WHERE deleted_at IS NULL ORDER BY id",
            SOURCE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(sources)
    }

    /// Create a new source
    pub async fn create(&self, new: &NewSource) -> Result<Source> {
        let source = sqlx::query_as::<_, Source>(&format!(
            r#"
            INSERT INTO sources (name, source_type, reliability, max_proxies, config)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            SOURCE_COLUMNS
        ))
        .bind(&new.name)
        .bind(&new.source_type)
        .bind(new.reliability)
        .bind(new.max_proxies)
        .bind(Json(&new.config))
        .fetch_one(&self.pool)
        .await?;

        info!(id = source.id, name = %source.name, "Created source");
        Ok(source)
    }

    /// Replace a source's provider configuration
    pub async fn update_config(&self, id: i64, config: &Value) -> Result<()> {
        sqlx::query("UPDATE sources SET config = $2 WHERE id = $1")
            .bind(id)
            .bind(Json(config))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Append to the persistent error log, dropping the oldest entries past `max_errors`
    pub async fn append_error(&self, id: i64, message: &str, max_errors: usize) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sources
            SET errors = (
                SELECT COALESCE(jsonb_agg(e ORDER BY ord), '[]'::jsonb)
                FROM (
                    SELECT e, ord
                    FROM jsonb_array_elements(errors || jsonb_build_array($2::text))
                         WITH ORDINALITY AS t(e, ord)
                    ORDER BY ord DESC
                    LIMIT $3
                ) newest
            )
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(message)
        .bind(max_errors as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
