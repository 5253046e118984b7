// Context Updater Port
//
// A running task persists its checkpoint only through an updater bound to
// its own task id and run id. Writes from a superseded run are rejected by
// the queue with `AppError::Conflict`.

use crate::domain::{RunId, TaskId};
use crate::error::Result;
use crate::port::TaskManager;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait ContextUpdater: Send + Sync {
    /// Durably replace the task's context. Returns only after the write is committed.
    async fn update_context(&self, context: &str) -> Result<()>;
}

pub trait ContextUpdaterFactory: Send + Sync {
    fn create_context_updater(&self, task_id: &str, run_id: &str) -> Arc<dyn ContextUpdater>;
}

/// Updater writing through the task queue
pub struct TaskContextUpdater {
    task_manager: Arc<dyn TaskManager>,
    task_id: TaskId,
    run_id: RunId,
}

#[async_trait]
impl ContextUpdater for TaskContextUpdater {
    async fn update_context(&self, context: &str) -> Result<()> {
        self.task_manager
            .update_context(&self.task_id, &self.run_id, context)
            .await
    }
}

pub struct TaskContextUpdaterFactory {
    task_manager: Arc<dyn TaskManager>,
}

impl TaskContextUpdaterFactory {
    pub fn new(task_manager: Arc<dyn TaskManager>) -> Self {
        Self { task_manager }
    }
}

impl ContextUpdaterFactory for TaskContextUpdaterFactory {
    fn create_context_updater(&self, task_id: &str, run_id: &str) -> Arc<dyn ContextUpdater> {
        Arc::new(TaskContextUpdater {
            task_manager: Arc::clone(&self.task_manager),
            task_id: task_id.to_string(),
            run_id: run_id.to_string(),
        })
    }
}

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::sync::Mutex;

    /// Records every checkpoint; can be told to fail the n-th write (1-based)
    #[derive(Default)]
    pub struct RecordingContextUpdater {
        writes: Mutex<Vec<String>>,
        fail_on_write: Mutex<Option<usize>>,
    }

    impl RecordingContextUpdater {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_on(write_number: usize) -> Self {
            let updater = Self::default();
            *updater.fail_on_write.lock().unwrap() = Some(write_number);
            updater
        }

        pub fn writes(&self) -> Vec<String> {
            self.writes.lock().unwrap().clone()
        }

        pub fn last(&self) -> Option<String> {
            self.writes.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl ContextUpdater for RecordingContextUpdater {
        async fn update_context(&self, context: &str) -> Result<()> {
            let mut writes = self.writes.lock().unwrap();
            let attempt = writes.len() + 1;
            let mut fail_on = self.fail_on_write.lock().unwrap();
            if *fail_on == Some(attempt) {
                *fail_on = None;
                return Err(AppError::Database("injected context write failure".to_string()));
            }
            writes.push(context.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, PROCESSING_TASK_TYPE_ID};
    use crate::error::AppError;
    use crate::port::task_manager::mocks::InMemoryTaskManager;

    #[tokio::test]
    async fn test_updater_writes_only_for_owning_run() {
        let manager = Arc::new(InMemoryTaskManager::new());
        manager
            .create_task(NewTask::new("q", PROCESSING_TASK_TYPE_ID, "{}"))
            .await
            .unwrap();
        let leased = manager.lease_next("q").await.unwrap().unwrap();

        let factory = TaskContextUpdaterFactory::new(manager.clone());
        let current = factory.create_context_updater(&leased.task_id, &leased.run_id);
        let stale = factory.create_context_updater(&leased.task_id, "previous-run");

        current.update_context("{\"a\":1}").await.unwrap();
        let err = stale.update_context("{\"a\":2}").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let stored = manager.get_task(&leased.task_id).await.unwrap().unwrap();
        assert_eq!(stored.context.as_deref(), Some("{\"a\":1}"));
    }
}
