// Runnable task abstraction

use crate::application::cancellation::CancellationToken;
use crate::domain::{TaskResult, TaskTypeId};
use crate::error::Result;
use async_trait::async_trait;

/// A task reconstructed from its persisted record.
///
/// `execute` may be invoked again for the same record after a crash or a
/// requeue; implementations resume from the checkpoint they were built with.
#[async_trait]
pub trait Task: Send + Sync {
    fn task_type_id(&self) -> TaskTypeId;

    /// Run to a terminal outcome. `Err` means the run did not reach one: the
    /// worker requeues `AppError::Retriable` and fails the task otherwise.
    async fn execute(&self, cancel: CancellationToken) -> Result<TaskResult>;
}
