// SQLite Bulk Loader with secondary index suspension

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use bulkimport_core::domain::{ImportResource, IndexDescriptor, IndexScope, SearchParam};
use bulkimport_core::error::Result;
use bulkimport_core::port::{BulkImportOperation, TimeProvider};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tables written by the bulk loader
pub const RESOURCE_TABLES: &[&str] = &[
    "resource",
    "token_search_param",
    "string_search_param",
    "reference_search_param",
    "date_time_search_param",
];

/// Version of `UNCLUSTERED_INDEXES`; bump together with the resource store migration
pub const UNCLUSTERED_INDEX_SET_VERSION: u32 = 2;

/// Secondary indexes dropped during an import: (table, index, definition).
/// Must list every index the migrations create on `RESOURCE_TABLES`.
pub const UNCLUSTERED_INDEXES: &[(&str, &str, &str)] = &[
    (
        "resource",
        "ix_resource_type_id",
        "CREATE INDEX IF NOT EXISTS ix_resource_type_id ON resource(resource_type, resource_id)",
    ),
    (
        "resource",
        "ix_resource_last_updated",
        "CREATE INDEX IF NOT EXISTS ix_resource_last_updated ON resource(resource_type, last_updated)",
    ),
    (
        "token_search_param",
        "ix_token_search_param_code",
        "CREATE INDEX IF NOT EXISTS ix_token_search_param_code ON token_search_param(name, code, system)",
    ),
    (
        "token_search_param",
        "ix_token_search_param_surrogate_id",
        "CREATE INDEX IF NOT EXISTS ix_token_search_param_surrogate_id ON token_search_param(surrogate_id)",
    ),
    (
        "string_search_param",
        "ix_string_search_param_value",
        "CREATE INDEX IF NOT EXISTS ix_string_search_param_value ON string_search_param(name, value)",
    ),
    (
        "string_search_param",
        "ix_string_search_param_surrogate_id",
        "CREATE INDEX IF NOT EXISTS ix_string_search_param_surrogate_id ON string_search_param(surrogate_id)",
    ),
    (
        "reference_search_param",
        "ix_reference_search_param_target",
        "CREATE INDEX IF NOT EXISTS ix_reference_search_param_target ON reference_search_param(name, reference_type, reference_id)",
    ),
    (
        "reference_search_param",
        "ix_reference_search_param_surrogate_id",
        "CREATE INDEX IF NOT EXISTS ix_reference_search_param_surrogate_id ON reference_search_param(surrogate_id)",
    ),
    (
        "date_time_search_param",
        "ix_date_time_search_param_range",
        "CREATE INDEX IF NOT EXISTS ix_date_time_search_param_range ON date_time_search_param(name, start_date_time, end_date_time)",
    ),
    (
        "date_time_search_param",
        "ix_date_time_search_param_surrogate_id",
        "CREATE INDEX IF NOT EXISTS ix_date_time_search_param_surrogate_id ON date_time_search_param(surrogate_id)",
    ),
];

pub fn unclustered_indexes() -> Vec<IndexDescriptor> {
    UNCLUSTERED_INDEXES
        .iter()
        .map(|(table, index, definition)| IndexDescriptor::new(*table, *index, *definition))
        .collect()
}

pub struct SqliteBulkImporter {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteBulkImporter {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    /// Explicit indexes on resource tables, as the live schema reports them
    pub async fn live_indexes(&self) -> Result<Vec<(String, String)>> {
        let placeholders = vec!["?"; RESOURCE_TABLES.len()].join(", ");
        let sql = format!(
            "SELECT tbl_name, name FROM sqlite_master \
             WHERE type = 'index' AND sql IS NOT NULL AND tbl_name IN ({}) \
             ORDER BY tbl_name, name",
            placeholders
        );
        let mut query = sqlx::query_as::<_, (String, String)>(&sql);
        for table in RESOURCE_TABLES {
            query = query.bind(*table);
        }
        query.fetch_all(&self.pool).await.map_err(map_sqlx_error)
    }

    /// Live indexes missing from `UNCLUSTERED_INDEXES`; they stay in place during imports
    pub async fn untracked_indexes(&self) -> Result<Vec<String>> {
        let known: HashSet<&str> = UNCLUSTERED_INDEXES.iter().map(|(_, name, _)| *name).collect();
        Ok(self
            .live_indexes()
            .await?
            .into_iter()
            .map(|(_, name)| name)
            .filter(|name| !known.contains(name.as_str()))
            .collect())
    }

    async fn insert_resource(
        tx: &mut Transaction<'_, Sqlite>,
        resource: &ImportResource,
    ) -> Result<()> {
        let parsed = &resource.resource;
        sqlx::query(
            r#"
            INSERT INTO resource (
                surrogate_id, resource_type, resource_id, last_updated, line_index, raw_resource
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(resource.surrogate_id)
        .bind(&parsed.resource_type)
        .bind(&parsed.resource_id)
        .bind(&parsed.last_updated)
        .bind(resource.line_index as i64)
        .bind(&parsed.raw)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        for param in &parsed.search_params {
            let query = match param {
                SearchParam::Token { name, system, code } => sqlx::query(
                    "INSERT INTO token_search_param (surrogate_id, name, system, code) VALUES (?, ?, ?, ?)",
                )
                .bind(resource.surrogate_id)
                .bind(name)
                .bind(system)
                .bind(code),
                SearchParam::String { name, value } => sqlx::query(
                    "INSERT INTO string_search_param (surrogate_id, name, value) VALUES (?, ?, ?)",
                )
                .bind(resource.surrogate_id)
                .bind(name)
                .bind(value),
                SearchParam::Reference {
                    name,
                    reference_type,
                    reference_id,
                } => sqlx::query(
                    "INSERT INTO reference_search_param (surrogate_id, name, reference_type, reference_id) VALUES (?, ?, ?, ?)",
                )
                .bind(resource.surrogate_id)
                .bind(name)
                .bind(reference_type)
                .bind(reference_id),
                SearchParam::DateTime { name, start, end } => sqlx::query(
                    "INSERT INTO date_time_search_param (surrogate_id, name, start_date_time, end_date_time) VALUES (?, ?, ?, ?)",
                )
                .bind(resource.surrogate_id)
                .bind(name)
                .bind(start)
                .bind(end),
            };
            query.execute(&mut **tx).await.map_err(map_sqlx_error)?;
        }

        Ok(())
    }
}

#[async_trait]
impl BulkImportOperation for SqliteBulkImporter {
    async fn suspend_indexes(&self, scope: &IndexScope) -> Result<Vec<IndexDescriptor>> {
        for name in self.untracked_indexes().await? {
            warn!(
                job_id = %scope.job_id,
                index = %name,
                version = UNCLUSTERED_INDEX_SET_VERSION,
                "Index is not in the suspension set and will be maintained during the import"
            );
        }

        let now = self.time_provider.now_millis();
        let descriptors = unclustered_indexes();
        for descriptor in &descriptors {
            // Record before dropping, in one transaction, so a drop is never forgotten
            let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO suspended_index (job_id, table_name, index_name, definition, suspended_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&scope.job_id)
            .bind(&descriptor.table_name)
            .bind(&descriptor.index_name)
            .bind(&descriptor.definition)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            sqlx::query(&format!("DROP INDEX IF EXISTS {}", descriptor.index_name))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

            tx.commit().await.map_err(map_sqlx_error)?;
            debug!(job_id = %scope.job_id, index = %descriptor.index_name, "Index suspended");
        }

        info!(
            job_id = %scope.job_id,
            count = descriptors.len(),
            "Suspended secondary indexes"
        );
        Ok(descriptors)
    }

    async fn load_batch(&self, resources: &[ImportResource]) -> Result<u64> {
        if resources.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        for resource in resources {
            Self::insert_resource(&mut tx, resource).await?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(resources.len() as u64)
    }

    async fn clean_range(&self, begin: i64, end: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // Search tables first, resource last: its count is the one reported
        let mut removed = 0;
        for table in RESOURCE_TABLES.iter().rev() {
            let result = sqlx::query(&format!(
                "DELETE FROM {} WHERE surrogate_id >= ? AND surrogate_id < ?",
                table
            ))
            .bind(begin)
            .bind(end)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            removed = result.rows_affected();
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        if removed > 0 {
            info!(begin, end, removed, "Removed resources left by an interrupted run");
        }
        Ok(removed)
    }

    async fn restore_indexes(&self, scope: &IndexScope) -> Result<Vec<IndexDescriptor>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT table_name, index_name, definition FROM suspended_index
            WHERE job_id = ?
            ORDER BY table_name, index_name
            "#,
        )
        .bind(&scope.job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut restored = Vec::with_capacity(rows.len());
        for (table_name, index_name, definition) in rows {
            let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
            sqlx::query(&definition)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            sqlx::query("DELETE FROM suspended_index WHERE job_id = ? AND index_name = ?")
                .bind(&scope.job_id)
                .bind(&index_name)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            tx.commit().await.map_err(map_sqlx_error)?;

            debug!(job_id = %scope.job_id, index = %index_name, "Index rebuilt");
            restored.push(IndexDescriptor::new(table_name, index_name, definition));
        }

        if !restored.is_empty() {
            info!(job_id = %scope.job_id, count = restored.len(), "Restored secondary indexes");
        }
        Ok(restored)
    }
}
