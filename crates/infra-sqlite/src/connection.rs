// SQLite Connection Pool Setup

use crate::error::map_sqlx_error;
use bulkimport_core::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

const MAX_CONNECTIONS: u32 = 10;

/// Create SQLite connection pool with WAL mode and a busy timeout.
///
/// In-memory databases are per connection, so they get a single-connection pool.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(map_sqlx_error)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);

    let max_connections = if database_url.contains(":memory:") {
        1
    } else {
        MAX_CONNECTIONS
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(map_sqlx_error)?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_pool() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        tokio_test::assert_ok!(pool.acquire().await);
    }

    #[tokio::test]
    async fn test_create_pool_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("import.db");
        let url = format!("sqlite://{}", path.display());

        let pool = create_pool(&url).await.unwrap();
        sqlx::query("SELECT 1").execute(&pool).await.unwrap();
        assert!(path.exists());
    }
}
