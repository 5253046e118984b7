// SQLite TaskManager Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use bulkimport_core::domain::{NewTask, TaskId, TaskRecord, TaskResult, TaskStatus};
use bulkimport_core::error::{AppError, Result};
use bulkimport_core::port::{IdProvider, TaskManager, TimeProvider};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SqliteTaskManager {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
    id_provider: Arc<dyn IdProvider>,
}

impl SqliteTaskManager {
    pub fn new(
        pool: SqlitePool,
        time_provider: Arc<dyn TimeProvider>,
        id_provider: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            pool,
            time_provider,
            id_provider,
        }
    }

    async fn fetch(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM task_info WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(TaskRow::into_record).transpose()
    }

    /// Explain why an owned-row update touched nothing
    async fn ownership_error(&self, task_id: &str, run_id: &str) -> AppError {
        match self.fetch(task_id).await {
            Ok(None) => AppError::NotFound(format!("Task {} not found", task_id)),
            Ok(Some(task)) => {
                warn!(
                    task_id = %task_id,
                    run_id = %run_id,
                    current_run_id = %task.run_id,
                    status = %task.status,
                    "Rejected write from a run that no longer owns the task"
                );
                AppError::Conflict(format!("Task {} is not owned by run {}", task_id, run_id))
            }
            Err(e) => e,
        }
    }
}

#[async_trait]
impl TaskManager for SqliteTaskManager {
    async fn create_task(&self, task: NewTask) -> Result<TaskRecord> {
        let record = TaskRecord::new(
            self.id_provider.generate_id(),
            self.id_provider.generate_id(),
            self.time_provider.now_millis(),
            task,
        );

        // NULL keys never conflict, so unkeyed tasks always insert
        let result = sqlx::query(
            r#"
            INSERT INTO task_info (
                task_id, queue_id, task_type_id, run_id, idempotency_key, parent_task_id,
                status, is_canceled, retry_count, max_retry_count,
                input_data, context, result, created_at, heartbeat_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?, NULL, NULL, ?, NULL, NULL)
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(&record.task_id)
        .bind(&record.queue_id)
        .bind(record.task_type_id)
        .bind(&record.run_id)
        .bind(&record.idempotency_key)
        .bind(&record.parent_task_id)
        .bind(record.status.to_string())
        .bind(record.max_retry_count)
        .bind(&record.input_data)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            let key = record.idempotency_key.as_deref().unwrap_or_default();
            debug!(idempotency_key = %key, "Task already exists, returning existing record");
            return self.find_by_idempotency_key(key).await?.ok_or_else(|| {
                AppError::Internal(format!("Task with idempotency key {} vanished", key))
            });
        }

        Ok(record)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.fetch(task_id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<TaskRecord>> {
        let row =
            sqlx::query_as::<_, TaskRow>("SELECT * FROM task_info WHERE idempotency_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        row.map(TaskRow::into_record).transpose()
    }

    async fn get_tasks(&self, task_ids: &[TaskId]) -> Result<Vec<TaskRecord>> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; task_ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM task_info WHERE task_id IN ({}) ORDER BY created_at ASC, rowid ASC",
            placeholders
        );
        let mut query = sqlx::query_as::<_, TaskRow>(&sql);
        for task_id in task_ids {
            query = query.bind(task_id);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    async fn lease_next(&self, queue_id: &str) -> Result<Option<TaskRecord>> {
        let run_id = self.id_provider.generate_id();
        let now = self.time_provider.now_millis();

        // Single statement: two workers can never lease the same row
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE task_info
            SET status = 'RUNNING', run_id = ?, heartbeat_at = ?
            WHERE task_id = (
                SELECT task_id FROM task_info
                WHERE queue_id = ? AND status = 'QUEUED'
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(&run_id)
        .bind(now)
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(TaskRow::into_record).transpose()
    }

    async fn keep_alive(&self, task_id: &str, run_id: &str) -> Result<TaskRecord> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE task_info
            SET heartbeat_at = ?
            WHERE task_id = ? AND run_id = ? AND status = 'RUNNING'
            RETURNING *
            "#,
        )
        .bind(self.time_provider.now_millis())
        .bind(task_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => row.into_record(),
            None => Err(self.ownership_error(task_id, run_id).await),
        }
    }

    async fn update_context(&self, task_id: &str, run_id: &str, context: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE task_info
            SET context = ?
            WHERE task_id = ? AND run_id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(context)
        .bind(task_id)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(self.ownership_error(task_id, run_id).await);
        }
        Ok(())
    }

    async fn complete_task(&self, task_id: &str, run_id: &str, result: &TaskResult) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE task_info
            SET status = ?, result = ?, finished_at = ?
            WHERE task_id = ? AND run_id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(result.outcome.status().to_string())
        .bind(&result.result_data)
        .bind(self.time_provider.now_millis())
        .bind(task_id)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if updated.rows_affected() == 0 {
            return Err(self.ownership_error(task_id, run_id).await);
        }
        Ok(())
    }

    async fn requeue_task(&self, task_id: &str, run_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE task_info
            SET status = 'QUEUED', retry_count = retry_count + 1, heartbeat_at = NULL
            WHERE task_id = ? AND run_id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(task_id)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(self.ownership_error(task_id, run_id).await);
        }
        Ok(())
    }

    async fn cancel_task(&self, task_id: &str) -> Result<TaskRecord> {
        // SET expressions see the pre-update row, so both CASEs test the old status
        sqlx::query(
            r#"
            UPDATE task_info
            SET is_canceled = 1,
                status = CASE WHEN status = 'QUEUED' THEN 'CANCELED' ELSE status END,
                finished_at = CASE WHEN status = 'QUEUED' THEN ? ELSE finished_at END
            WHERE task_id = ? AND status IN ('QUEUED', 'RUNNING')
            "#,
        )
        .bind(self.time_provider.now_millis())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        self.fetch(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))
    }

    async fn find_stale_running(&self, heartbeat_before: i64) -> Result<Vec<TaskRecord>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT * FROM task_info
            WHERE status = 'RUNNING'
              AND (heartbeat_at IS NULL OR heartbeat_at < ?)
            ORDER BY created_at ASC
            "#,
        )
        .bind(heartbeat_before)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(TaskRow::into_record).collect()
    }

    async fn reset_to_queued(&self, task_id: &str) -> Result<()> {
        // A fresh run id fences the orphaned run even before the task is leased again
        sqlx::query(
            r#"
            UPDATE task_info
            SET status = 'QUEUED', run_id = ?, heartbeat_at = NULL
            WHERE task_id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(self.id_provider.generate_id())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }
}

/// SQLite row representation
#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    queue_id: String,
    task_type_id: i32,
    run_id: String,
    idempotency_key: Option<String>,
    parent_task_id: Option<String>,
    status: String,
    is_canceled: bool,
    retry_count: i32,
    max_retry_count: i32,
    input_data: String,
    context: Option<String>,
    result: Option<String>,
    created_at: i64,
    heartbeat_at: Option<i64>,
    finished_at: Option<i64>,
}

impl TaskRow {
    fn into_record(self) -> Result<TaskRecord> {
        let status: TaskStatus = self.status.parse()?;
        Ok(TaskRecord {
            task_id: self.task_id,
            queue_id: self.queue_id,
            task_type_id: self.task_type_id,
            run_id: self.run_id,
            idempotency_key: self.idempotency_key,
            parent_task_id: self.parent_task_id,
            status,
            is_canceled: self.is_canceled,
            retry_count: self.retry_count,
            max_retry_count: self.max_retry_count,
            input_data: self.input_data,
            context: self.context,
            result: self.result,
            created_at: self.created_at,
            heartbeat_at: self.heartbeat_at,
            finished_at: self.finished_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use bulkimport_core::domain::PROCESSING_TASK_TYPE_ID;
    use bulkimport_core::port::id_provider::mocks::SequentialIdProvider;
    use bulkimport_core::port::time_provider::mocks::ManualClock;

    async fn setup() -> (SqliteTaskManager, Arc<ManualClock>) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let manager = SqliteTaskManager::new(
            pool,
            clock.clone(),
            Arc::new(SequentialIdProvider::new("id")),
        );
        (manager, clock)
    }

    fn new_task(queue: &str) -> NewTask {
        NewTask::new(queue, PROCESSING_TASK_TYPE_ID, r#"{"k":1}"#)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (manager, _) = setup().await;
        let created = manager
            .create_task(new_task("q").with_parent("parent-1"))
            .await
            .unwrap();

        let found = manager.get_task(&created.task_id).await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Queued);
        assert_eq!(found.parent_task_id.as_deref(), Some("parent-1"));
        assert_eq!(found.input_data, r#"{"k":1}"#);
        assert!(!found.is_canceled);
        assert!(manager.get_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_is_idempotent_on_key() {
        let (manager, _) = setup().await;
        let first = manager
            .create_task(new_task("q").with_idempotency_key("job-1:0"))
            .await
            .unwrap();
        let second = manager
            .create_task(new_task("q").with_idempotency_key("job-1:0"))
            .await
            .unwrap();

        assert_eq!(first.task_id, second.task_id);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_info")
            .fetch_one(&manager.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        // Unkeyed tasks never collide
        manager.create_task(new_task("q")).await.unwrap();
        manager.create_task(new_task("q")).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_info")
            .fetch_one(&manager.pool)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_lease_is_fifo_per_queue_and_rotates_run_id() {
        let (manager, clock) = setup().await;
        let first = manager.create_task(new_task("q")).await.unwrap();
        clock.advance(10);
        let second = manager.create_task(new_task("q")).await.unwrap();
        manager.create_task(new_task("other")).await.unwrap();

        let leased = manager.lease_next("q").await.unwrap().unwrap();
        assert_eq!(leased.task_id, first.task_id);
        assert_eq!(leased.status, TaskStatus::Running);
        assert_ne!(leased.run_id, first.run_id);
        assert_eq!(leased.heartbeat_at, Some(1_000));

        let next = manager.lease_next("q").await.unwrap().unwrap();
        assert_eq!(next.task_id, second.task_id);
        assert!(manager.lease_next("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_run_is_fenced() {
        let (manager, _) = setup().await;
        let task = manager.create_task(new_task("q")).await.unwrap();
        let leased = manager.lease_next("q").await.unwrap().unwrap();

        manager
            .update_context(&task.task_id, &leased.run_id, "{\"n\":1}")
            .await
            .unwrap();

        let err = manager
            .update_context(&task.task_id, "stale-run", "{\"n\":2}")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let err = manager
            .complete_task(&task.task_id, "stale-run", &TaskResult::succeeded("{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let err = manager
            .keep_alive("missing", &leased.run_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let found = manager.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(found.context.as_deref(), Some("{\"n\":1}"));
    }

    #[tokio::test]
    async fn test_complete_and_requeue() {
        let (manager, clock) = setup().await;
        let task = manager.create_task(new_task("q")).await.unwrap();
        let leased = manager.lease_next("q").await.unwrap().unwrap();

        manager.requeue_task(&task.task_id, &leased.run_id).await.unwrap();
        let requeued = manager.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert_eq!(requeued.retry_count, 1);

        let leased = manager.lease_next("q").await.unwrap().unwrap();
        clock.advance(500);
        manager
            .complete_task(&task.task_id, &leased.run_id, &TaskResult::failed("{\"error\":\"x\"}"))
            .await
            .unwrap();

        let done = manager.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.result.as_deref(), Some("{\"error\":\"x\"}"));
        assert_eq!(done.finished_at, Some(1_500));

        // Terminal tasks are not owned by any run
        let err = manager
            .requeue_task(&task.task_id, &leased.run_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let (manager, _) = setup().await;
        let running = manager.create_task(new_task("q")).await.unwrap();
        let queued = manager.create_task(new_task("q")).await.unwrap();
        let leased = manager.lease_next("q").await.unwrap().unwrap();
        assert_eq!(leased.task_id, running.task_id);

        let canceled = manager.cancel_task(&queued.task_id).await.unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
        assert!(canceled.is_canceled);
        assert!(canceled.finished_at.is_some());

        let flagged = manager.cancel_task(&running.task_id).await.unwrap();
        assert_eq!(flagged.status, TaskStatus::Running);
        assert!(flagged.is_canceled);
        assert!(flagged.finished_at.is_none());

        let alive = manager
            .keep_alive(&running.task_id, &leased.run_id)
            .await
            .unwrap();
        assert!(alive.is_canceled);

        let err = manager.cancel_task("missing").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_tasks_skips_missing() {
        let (manager, _) = setup().await;
        let a = manager.create_task(new_task("q")).await.unwrap();
        let b = manager.create_task(new_task("q")).await.unwrap();

        let found = manager
            .get_tasks(&[b.task_id.clone(), "missing".to_string(), a.task_id.clone()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(manager.get_tasks(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_running_reset_fences_old_run() {
        let (manager, clock) = setup().await;
        let task = manager.create_task(new_task("q")).await.unwrap();
        let leased = manager.lease_next("q").await.unwrap().unwrap();

        clock.advance(60_000);
        let stale = manager.find_stale_running(clock.now_millis() - 1_000).await.unwrap();
        assert_eq!(stale.len(), 1);

        manager.reset_to_queued(&task.task_id).await.unwrap();
        let reset = manager.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(reset.status, TaskStatus::Queued);
        assert_ne!(reset.run_id, leased.run_id);

        let err = manager
            .update_context(&task.task_id, &leased.run_id, "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_concurrent_leases_never_share_a_task() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let manager = Arc::new(SqliteTaskManager::new(
            pool,
            Arc::new(ManualClock::new(0)),
            Arc::new(bulkimport_core::port::UuidProvider),
        ));

        for _ in 0..20 {
            manager.create_task(new_task("q")).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let mut leased = Vec::new();
                while let Some(task) = manager.lease_next("q").await.unwrap() {
                    leased.push(task.task_id);
                }
                leased
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20);
    }
}
