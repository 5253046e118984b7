// Task Dispatcher: task type id -> constructor closed over shared collaborators

use crate::application::import::{ImportDependencies, OrchestratorTask, ProcessingTask};
use crate::application::task::Task;
use crate::domain::{TaskRecord, TaskTypeId, ORCHESTRATOR_TASK_TYPE_ID, PROCESSING_TASK_TYPE_ID};
use crate::error::Result;
use crate::port::ContextUpdater;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds a runnable task from a record. Fails with `AppError::Deserialization`
/// when the record's payloads are malformed.
pub type TaskBuilder =
    Box<dyn Fn(&TaskRecord, Arc<dyn ContextUpdater>) -> Result<Box<dyn Task>> + Send + Sync>;

pub struct TaskFactory {
    builders: HashMap<TaskTypeId, TaskBuilder>,
}

impl TaskFactory {
    /// Factory that knows no task types
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Factory for the two import task kinds
    pub fn for_import(deps: ImportDependencies) -> Self {
        let deps = Arc::new(deps);
        let mut factory = Self::empty();

        let processing_deps = Arc::clone(&deps);
        factory.register(
            PROCESSING_TASK_TYPE_ID,
            Box::new(move |record: &TaskRecord, updater: Arc<dyn ContextUpdater>| {
                let task = ProcessingTask::from_record(record, Arc::clone(&processing_deps), updater)?;
                Ok(Box::new(task) as Box<dyn Task>)
            }),
        );

        let orchestrator_deps = Arc::clone(&deps);
        factory.register(
            ORCHESTRATOR_TASK_TYPE_ID,
            Box::new(move |record: &TaskRecord, updater: Arc<dyn ContextUpdater>| {
                let task =
                    OrchestratorTask::from_record(record, Arc::clone(&orchestrator_deps), updater)?;
                Ok(Box::new(task) as Box<dyn Task>)
            }),
        );

        factory
    }

    pub fn register(&mut self, task_type_id: TaskTypeId, builder: TaskBuilder) {
        self.builders.insert(task_type_id, builder);
    }

    /// `Ok(None)` for an unknown type id (configuration error, not a crash)
    pub fn create(
        &self,
        record: &TaskRecord,
        context_updater: Arc<dyn ContextUpdater>,
    ) -> Result<Option<Box<dyn Task>>> {
        match self.builders.get(&record.task_type_id) {
            Some(build) => {
                debug!(task_id = %record.task_id, task_type_id = %record.task_type_id, "Building task");
                build(record, context_updater).map(Some)
            }
            None => Ok(None),
        }
    }
}
