// Task Queue Port (Interface)
//
// The queue's persistence and leasing are owned by an adapter; import tasks
// only create children, poll them and forward cancellation.

use crate::domain::{NewTask, TaskId, TaskRecord, TaskResult};
use crate::error::Result;
use async_trait::async_trait;

/// Repository interface for task records
#[async_trait]
pub trait TaskManager: Send + Sync {
    /// Create a task. Idempotent on `idempotency_key`: if a task with the same
    /// key exists, that record is returned and nothing is inserted.
    async fn create_task(&self, task: NewTask) -> Result<TaskRecord>;

    /// Find task by ID
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    /// Find the task created with `idempotency_key`
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<TaskRecord>>;

    /// Find several tasks by ID (missing ids are skipped)
    async fn get_tasks(&self, task_ids: &[TaskId]) -> Result<Vec<TaskRecord>>;

    /// Atomically lease the oldest queued task: QUEUED -> RUNNING with a fresh run id
    async fn lease_next(&self, queue_id: &str) -> Result<Option<TaskRecord>>;

    /// Refresh the heartbeat of a leased task and return its current record
    async fn keep_alive(&self, task_id: &str, run_id: &str) -> Result<TaskRecord>;

    /// Persist a checkpoint. Fails with `Conflict` if `run_id` no longer owns the task.
    async fn update_context(&self, task_id: &str, run_id: &str, context: &str) -> Result<()>;

    /// Record the terminal outcome of a run
    async fn complete_task(&self, task_id: &str, run_id: &str, result: &TaskResult) -> Result<()>;

    /// Put a running task back in the queue (task-level retry)
    async fn requeue_task(&self, task_id: &str, run_id: &str) -> Result<()>;

    /// Request cancellation. A queued task is canceled immediately.
    async fn cancel_task(&self, task_id: &str) -> Result<TaskRecord>;

    /// Running tasks whose heartbeat is older than `heartbeat_before` (epoch ms)
    async fn find_stale_running(&self, heartbeat_before: i64) -> Result<Vec<TaskRecord>>;

    /// Reset an orphaned running task to QUEUED (crash recovery)
    async fn reset_to_queued(&self, task_id: &str) -> Result<()>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::TaskStatus;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// In-memory task queue with the same contract as the SQLite adapter
    #[derive(Default)]
    pub struct InMemoryTaskManager {
        tasks: Mutex<Vec<TaskRecord>>,
        counter: AtomicU64,
        inserts: AtomicU64,
    }

    impl InMemoryTaskManager {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of records actually inserted (idempotent hits excluded)
        pub fn insert_count(&self) -> u64 {
            self.inserts.load(Ordering::SeqCst)
        }

        pub fn all(&self) -> Vec<TaskRecord> {
            self.tasks.lock().unwrap().clone()
        }

        fn next_id(&self, prefix: &str) -> String {
            format!("{}-{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn now(&self) -> i64 {
            self.counter.load(Ordering::SeqCst) as i64
        }

        fn with_owned<T>(
            &self,
            task_id: &str,
            run_id: &str,
            f: impl FnOnce(&mut TaskRecord) -> Result<T>,
        ) -> Result<T> {
            let mut tasks = self.tasks.lock().unwrap();
            let task = tasks
                .iter_mut()
                .find(|t| t.task_id == task_id)
                .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;
            if task.run_id != run_id || task.status != TaskStatus::Running {
                return Err(AppError::Conflict(format!(
                    "Task {} is not owned by run {}",
                    task_id, run_id
                )));
            }
            f(task)
        }
    }

    #[async_trait]
    impl TaskManager for InMemoryTaskManager {
        async fn create_task(&self, task: NewTask) -> Result<TaskRecord> {
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(key) = &task.idempotency_key {
                if let Some(existing) = tasks
                    .iter()
                    .find(|t| t.idempotency_key.as_deref() == Some(key.as_str()))
                {
                    return Ok(existing.clone());
                }
            }
            let record = TaskRecord::new(self.next_id("task"), self.next_id("run"), self.now(), task);
            tasks.push(record.clone());
            self.inserts.fetch_add(1, Ordering::SeqCst);
            Ok(record)
        }

        async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
            let tasks = self.tasks.lock().unwrap();
            Ok(tasks.iter().find(|t| t.task_id == task_id).cloned())
        }

        async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<TaskRecord>> {
            let tasks = self.tasks.lock().unwrap();
            Ok(tasks
                .iter()
                .find(|t| t.idempotency_key.as_deref() == Some(key))
                .cloned())
        }

        async fn get_tasks(&self, task_ids: &[TaskId]) -> Result<Vec<TaskRecord>> {
            let tasks = self.tasks.lock().unwrap();
            Ok(tasks
                .iter()
                .filter(|t| task_ids.contains(&t.task_id))
                .cloned()
                .collect())
        }

        async fn lease_next(&self, queue_id: &str) -> Result<Option<TaskRecord>> {
            let run_id = self.next_id("run");
            let now = self.now();
            let mut tasks = self.tasks.lock().unwrap();
            match tasks
                .iter_mut()
                .find(|t| t.queue_id == queue_id && t.status == TaskStatus::Queued)
            {
                Some(task) => {
                    task.start(run_id, now)?;
                    Ok(Some(task.clone()))
                }
                None => Ok(None),
            }
        }

        async fn keep_alive(&self, task_id: &str, run_id: &str) -> Result<TaskRecord> {
            let now = self.now();
            self.with_owned(task_id, run_id, |task| {
                task.heartbeat_at = Some(now);
                Ok(task.clone())
            })
        }

        async fn update_context(&self, task_id: &str, run_id: &str, context: &str) -> Result<()> {
            self.with_owned(task_id, run_id, |task| {
                task.context = Some(context.to_string());
                Ok(())
            })
        }

        async fn complete_task(&self, task_id: &str, run_id: &str, result: &TaskResult) -> Result<()> {
            let now = self.now();
            self.with_owned(task_id, run_id, |task| Ok(task.complete(result, now)?))
        }

        async fn requeue_task(&self, task_id: &str, run_id: &str) -> Result<()> {
            self.with_owned(task_id, run_id, |task| Ok(task.requeue()?))
        }

        async fn cancel_task(&self, task_id: &str) -> Result<TaskRecord> {
            let now = self.now();
            let mut tasks = self.tasks.lock().unwrap();
            let task = tasks
                .iter_mut()
                .find(|t| t.task_id == task_id)
                .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;
            task.request_cancel(now);
            Ok(task.clone())
        }

        async fn find_stale_running(&self, heartbeat_before: i64) -> Result<Vec<TaskRecord>> {
            let tasks = self.tasks.lock().unwrap();
            Ok(tasks
                .iter()
                .filter(|t| {
                    t.status == TaskStatus::Running
                        && t.heartbeat_at.map_or(true, |h| h < heartbeat_before)
                })
                .cloned()
                .collect())
        }

        async fn reset_to_queued(&self, task_id: &str) -> Result<()> {
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(task) = tasks
                .iter_mut()
                .find(|t| t.task_id == task_id && t.status == TaskStatus::Running)
            {
                task.status = TaskStatus::Queued;
                task.heartbeat_at = None;
            }
            Ok(())
        }
    }
}
