use crate::error::Result;
use sqlx::{Executor, PgPool};
use tracing::info;

/// Run all database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    create_migrations_table(pool).await?;

    for (version, name, sql) in get_migrations() {
        if !is_migration_applied(pool, version).await? {
            info!(version = version, name = name, "Applying migration");

            // Multi-statement scripts need the simple query protocol
            pool.execute(sql).await?;

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
        (1, "endpoints_table", MIGRATION_001_ENDPOINTS),
        (2, "removed_endpoints_table", MIGRATION_002_REMOVED_ENDPOINTS),
    ]
}

// Migration 1: configured endpoints and their last known state
const MIGRATION_001_ENDPOINTS: &str = r#"
CREATE TABLE IF NOT EXISTS endpoints (
    id VARCHAR(512) PRIMARY KEY,
    protocol VARCHAR(20) NOT NULL,
    host VARCHAR(255) NOT NULL,
    port INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
    username VARCHAR(255),
    password VARCHAR(255),
    state VARCHAR(20) NOT NULL DEFAULT 'candidate',
    score DOUBLE PRECISION NOT NULL DEFAULT 50,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_endpoints_state ON endpoints(state);
CREATE INDEX IF NOT EXISTS idx_endpoints_protocol ON endpoints(protocol);
"#;

// Migration 2: archive of endpoints removed after eviction
const MIGRATION_002_REMOVED_ENDPOINTS: &str = r#"
CREATE TABLE IF NOT EXISTS removed_endpoints (
    id VARCHAR(512) PRIMARY KEY,
    protocol VARCHAR(20) NOT NULL,
    host VARCHAR(255) NOT NULL,
    port INTEGER NOT NULL,
    username VARCHAR(255),
    last_state VARCHAR(20) NOT NULL,
    last_score DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    removed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_removed_endpoints_removed_at ON removed_endpoints(removed_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_versions_are_sequential() {
        let migrations = get_migrations();
        for (i, (version, _, _)) in migrations.iter().enumerate() {
            assert_eq!(*version, i as i32 + 1);
        }
    }

    #[test]
    fn test_removed_table_matches_archive_query() {
        assert!(MIGRATION_002_REMOVED_ENDPOINTS.contains("last_state"));
        assert!(MIGRATION_002_REMOVED_ENDPOINTS.contains("last_score"));
    }
}
