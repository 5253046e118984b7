// SQLite Sequence Identity Generator
//
// Ranges come from a single counter row; the bump is one UPDATE ... RETURNING,
// so concurrent reservations across connections and processes never overlap.

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use bulkimport_core::error::{AppError, Result};
use bulkimport_core::port::{SequenceIdGenerator, SequenceRange};
use sqlx::SqlitePool;

pub const RESOURCE_SURROGATE_SEQUENCE: &str = "resource_surrogate_id";

pub struct SqliteSequenceIdGenerator {
    pool: SqlitePool,
    name: String,
}

impl SqliteSequenceIdGenerator {
    pub fn new(pool: SqlitePool) -> Self {
        Self::named(pool, RESOURCE_SURROGATE_SEQUENCE)
    }

    pub fn named(pool: SqlitePool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }
}

#[async_trait]
impl SequenceIdGenerator for SqliteSequenceIdGenerator {
    async fn reserve(&self, count: u64) -> Result<SequenceRange> {
        let count = i64::try_from(count)
            .map_err(|_| AppError::Validation(format!("Cannot reserve {} ids", count)))?;

        let end: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE sequence_allocator
            SET next_value = next_value + ?
            WHERE name = ?
            RETURNING next_value
            "#,
        )
        .bind(count)
        .bind(&self.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let end =
            end.ok_or_else(|| AppError::NotFound(format!("Sequence {} not found", self.name)))?;
        Ok(SequenceRange {
            begin: end - count,
            end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reserve_is_contiguous_from_one() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let generator = SqliteSequenceIdGenerator::new(pool);

        let a = generator.reserve(100).await.unwrap();
        let b = generator.reserve(1).await.unwrap();
        assert_eq!(a, SequenceRange { begin: 1, end: 101 });
        assert_eq!(b, SequenceRange { begin: 101, end: 102 });
    }

    #[tokio::test]
    async fn test_unknown_sequence() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let generator = SqliteSequenceIdGenerator::named(pool, "nope");

        let err = generator.reserve(1).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("seq.db").display());
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let generator = Arc::new(SqliteSequenceIdGenerator::new(pool));

        let mut handles = Vec::new();
        for i in 1..=16u64 {
            let generator = generator.clone();
            handles.push(tokio::spawn(async move {
                let mut ranges = Vec::new();
                for _ in 0..5 {
                    ranges.push(generator.reserve(i).await.unwrap());
                }
                ranges
            }));
        }

        let mut ranges = Vec::new();
        for handle in handles {
            ranges.extend(handle.await.unwrap());
        }
        ranges.sort_by_key(|r| r.begin);

        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].begin, "ranges must tile without overlap");
        }
        let total: u64 = ranges.iter().map(|r| r.len()).sum();
        assert_eq!(total, 5 * (1..=16u64).sum::<u64>());
    }
}
