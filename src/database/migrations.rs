use crate::error::Result;
use sqlx::{Executor, PgPool};
use tracing::info;

/// Run all database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    // Create migrations table if not exists
    create_migrations_table(pool).await?;

    // Run each migration in order
    let migrations = get_migrations();

    for (version, name, sql) in migrations {
        if !is_migration_applied(pool, version).await? {
            info!(version = version, name = name, "Applying migration");

            // Plain &str runs over the simple query protocol, which allows
            // several statements per migration.
            pool.execute(sql).await?;

            // Record migration
            record_migration(pool, version, name).await?;

            info!(version = version, name = name, "Migration applied successfully");
        }
    }

    Ok(())
}

/// Create the migrations tracking table
async fn create_migrations_table(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Check if a migration has been applied
async fn is_migration_applied(pool: &PgPool, version: i32) -> Result<bool> {
    let result = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM schema_migrations WHERE version = $1",
    )
    .bind(version)
    .fetch_one(pool)
    .await?;

    Ok(result > 0)
}

/// Record a migration as applied
async fn record_migration(pool: &PgPool, version: i32, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
        .bind(version)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

/// Get all migrations in order
fn get_migrations() -> Vec<(i32, &'static str, &'static str)> {
    vec![
        (1, "initial_schema", MIGRATION_001_INITIAL_SCHEMA),
        (2, "sources_table", MIGRATION_002_SOURCES),
        (3, "sites_table", MIGRATION_003_SITES),
        (4, "proxies_table", MIGRATION_004_PROXIES),
        (5, "proxy_performances_table", MIGRATION_005_PROXY_PERFORMANCES),
    ]
}

// Migration 1: Shared trigger function
const MIGRATION_001_INITIAL_SCHEMA: &str = r#"
CREATE OR REPLACE FUNCTION update_updated_at_column()
RETURNS TRIGGER AS $$
BEGIN
    NEW.updated_at = NOW();
    RETURN NEW;
END;
$$ language 'plpgsql';
"#;

// Migration 2: Sources table
const MIGRATION_002_SOURCES: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id BIGSERIAL PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    source_type VARCHAR(50) NOT NULL,
    reliability DOUBLE PRECISION NOT NULL DEFAULT 50.0,
    max_proxies INTEGER NOT NULL DEFAULT 0,
    config JSONB NOT NULL DEFAULT '{}'::jsonb,
    errors JSONB NOT NULL DEFAULT '[]'::jsonb,
    deleted_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_sources_deleted_at ON sources(deleted_at);

DROP TRIGGER IF EXISTS update_sources_updated_at ON sources;
CREATE TRIGGER update_sources_updated_at
    BEFORE UPDATE ON sources
    FOR EACH ROW
    EXECUTE FUNCTION update_updated_at_column();
"#;

// Migration 3: Sites table
const MIGRATION_003_SITES: &str = r#"
CREATE TABLE IF NOT EXISTS sites (
    id BIGSERIAL PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    min_proxies INTEGER NOT NULL DEFAULT 5,
    max_proxies INTEGER NOT NULL DEFAULT 10,
    deleted_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT unique_site_name UNIQUE (name)
);

CREATE INDEX IF NOT EXISTS idx_sites_deleted_at ON sites(deleted_at);

DROP TRIGGER IF EXISTS update_sites_updated_at ON sites;
CREATE TRIGGER update_sites_updated_at
    BEFORE UPDATE ON sites
    FOR EACH ROW
    EXECUTE FUNCTION update_updated_at_column();
"#;

// Migration 4: Proxies table. Rows are restored rather than duplicated, so
// host/port is unique across deleted rows too.
const MIGRATION_004_PROXIES: &str = r#"
CREATE TABLE IF NOT EXISTS proxies (
    id BIGSERIAL PRIMARY KEY,
    host VARCHAR(255) NOT NULL,
    port INTEGER NOT NULL,
    source_id BIGINT REFERENCES sources(id) ON DELETE SET NULL,
    deleted_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT unique_proxy_host_port UNIQUE (host, port)
);

CREATE INDEX IF NOT EXISTS idx_proxies_source_id ON proxies(source_id);
CREATE INDEX IF NOT EXISTS idx_proxies_deleted_at ON proxies(deleted_at);
CREATE INDEX IF NOT EXISTS idx_proxies_host ON proxies(host);

DROP TRIGGER IF EXISTS update_proxies_updated_at ON proxies;
CREATE TRIGGER update_proxies_updated_at
    BEFORE UPDATE ON proxies
    FOR EACH ROW
    EXECUTE FUNCTION update_updated_at_column();
"#;

// Migration 5: Proxy performances (proxy x site join with long-term counters)
const MIGRATION_005_PROXY_PERFORMANCES: &str = r#"
CREATE TABLE IF NOT EXISTS proxy_performances (
    id BIGSERIAL PRIMARY KEY,
    proxy_id BIGINT NOT NULL REFERENCES proxies(id) ON DELETE CASCADE,
    site_id BIGINT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
    times_succeeded BIGINT NOT NULL DEFAULT 0,
    times_failed BIGINT NOT NULL DEFAULT 0,
    reset_at TIMESTAMPTZ,
    deleted_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT unique_proxy_site UNIQUE (proxy_id, site_id)
);

CREATE INDEX IF NOT EXISTS idx_proxy_performances_site_id ON proxy_performances(site_id);
CREATE INDEX IF NOT EXISTS idx_proxy_performances_deleted_at ON proxy_performances(deleted_at);

DROP TRIGGER IF EXISTS update_proxy_performances_updated_at ON proxy_performances;
CREATE TRIGGER update_proxy_performances_updated_at
    BEFORE UPDATE ON proxy_performances
    FOR EACH ROW
    EXECUTE FUNCTION update_updated_at_column();
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_unique() {
        let migrations = get_migrations();
        let versions: Vec<i32> = migrations.iter().map(|(v, _, _)| *v).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn test_tables_are_created_before_references() {
        let migrations = get_migrations();
        let position = |needle: &str| {
            migrations
                .iter()
                .position(|(_, _, sql)| sql.contains(needle))
                .unwrap()
        };
        assert!(position("CREATE TABLE IF NOT EXISTS sources") < position("REFERENCES sources"));
        assert!(position("CREATE TABLE IF NOT EXISTS proxies") < position("REFERENCES proxies"));
    }
}
