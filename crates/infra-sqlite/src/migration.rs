// Migration Runner

use crate::error::map_sqlx_error;
use bulkimport_core::error::Result;
use sqlx::SqlitePool;
use tracing::info;

/// Ordered schema migrations: (version, description, sql)
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "Task queue and sequence allocator",
        include_str!("../migrations/001_task_queue.sql"),
    ),
    (
        2,
        "Resource store",
        include_str!("../migrations/002_resource_store.sql"),
    ),
];

/// Run database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations...");

    let table_exists: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
    )
    .fetch_one(pool)
    .await
    .map_err(map_sqlx_error)?;

    let current_version: i64 = if table_exists > 0 {
        sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(version) FROM schema_version")
            .fetch_one(pool)
            .await
            .map_err(map_sqlx_error)?
            .unwrap_or(0)
    } else {
        0
    };

    info!(current_version, "Current schema version");

    for (version, description, sql) in MIGRATIONS {
        if current_version < *version {
            info!(version, "Applying migration: {}", description);
            apply_migration(pool, *version, sql).await?;
        }
    }

    info!("All migrations applied successfully");
    Ok(())
}

/// Apply a single migration and record its version in the same transaction
async fn apply_migration(pool: &SqlitePool, version: i64, sql: &str) -> Result<()> {
    let mut tx = pool.begin().await.map_err(map_sqlx_error)?;

    for statement in sql.split(';') {
        let clean_statement: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();

        if !clean_statement.is_empty() {
            sqlx::query(&clean_statement)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
    }

    sqlx::query(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, strftime('%s', 'now') * 1000)",
    )
    .bind(version)
    .execute(&mut *tx)
    .await
    .map_err(map_sqlx_error)?;

    tx.commit().await.map_err(map_sqlx_error)?;
    Ok(())
}
