// Task Record Domain Model
//
// The record is owned by the task queue; import code only reads and writes
// `input_data` and `context` through typed views (see `codec`).

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Task ID (UUID v4)
pub type TaskId = String;

/// Queue identifier
pub type QueueId = String;

/// Lease token, regenerated every time a worker picks the task up
pub type RunId = String;

/// Task kind discriminator stored with every record
pub type TaskTypeId = i32;

pub const PROCESSING_TASK_TYPE_ID: TaskTypeId = 1;
pub const ORCHESTRATOR_TASK_TYPE_ID: TaskTypeId = 2;

/// Task Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "QUEUED"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Succeeded => write!(f, "SUCCEEDED"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUEUED" => Ok(TaskStatus::Queued),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCEEDED" => Ok(TaskStatus::Succeeded),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELED" => Ok(TaskStatus::Canceled),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Terminal outcome reported by a task run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    Canceled,
}

impl TaskOutcome {
    pub fn status(self) -> TaskStatus {
        match self {
            TaskOutcome::Succeeded => TaskStatus::Succeeded,
            TaskOutcome::Failed => TaskStatus::Failed,
            TaskOutcome::Canceled => TaskStatus::Canceled,
        }
    }
}

/// Result of one task run: outcome plus an opaque serialized payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub outcome: TaskOutcome,
    pub result_data: String,
}

impl TaskResult {
    pub fn succeeded(result_data: impl Into<String>) -> Self {
        Self {
            outcome: TaskOutcome::Succeeded,
            result_data: result_data.into(),
        }
    }

    pub fn failed(result_data: impl Into<String>) -> Self {
        Self {
            outcome: TaskOutcome::Failed,
            result_data: result_data.into(),
        }
    }

    pub fn canceled(result_data: impl Into<String>) -> Self {
        Self {
            outcome: TaskOutcome::Canceled,
            result_data: result_data.into(),
        }
    }
}

/// Creation request for a task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub queue_id: QueueId,
    pub task_type_id: TaskTypeId,
    pub input_data: String,
    /// Creation is idempotent on this key: a second create returns the first record
    pub idempotency_key: Option<String>,
    pub parent_task_id: Option<TaskId>,
    pub max_retry_count: i32,
}

impl NewTask {
    pub fn new(
        queue_id: impl Into<String>,
        task_type_id: TaskTypeId,
        input_data: impl Into<String>,
    ) -> Self {
        Self {
            queue_id: queue_id.into(),
            task_type_id,
            input_data: input_data.into(),
            idempotency_key: None,
            parent_task_id: None,
            max_retry_count: 3,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_parent(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }
}

/// Task Record Entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub queue_id: QueueId,
    pub task_type_id: TaskTypeId,
    pub run_id: RunId,
    pub idempotency_key: Option<String>,
    pub parent_task_id: Option<TaskId>,

    pub status: TaskStatus,
    /// Cancel request flag, observed cooperatively by the running task
    pub is_canceled: bool,

    pub retry_count: i32,
    pub max_retry_count: i32,

    pub input_data: String,
    pub context: Option<String>,
    pub result: Option<String>,

    pub created_at: i64, // epoch ms
    pub heartbeat_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl TaskRecord {
    /// Create a new queued record
    ///
    /// # Arguments
    ///
    /// * `task_id` - Unique task ID (injected, not generated)
    /// * `run_id` - Initial run id (injected)
    /// * `created_at` - Creation timestamp in epoch ms (injected, not system time)
    /// * `new_task` - Creation request
    pub fn new(
        task_id: impl Into<String>,
        run_id: impl Into<String>,
        created_at: i64,
        new_task: NewTask,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            queue_id: new_task.queue_id,
            task_type_id: new_task.task_type_id,
            run_id: run_id.into(),
            idempotency_key: new_task.idempotency_key,
            parent_task_id: new_task.parent_task_id,
            status: TaskStatus::Queued,
            is_canceled: false,
            retry_count: 0,
            max_retry_count: new_task.max_retry_count,
            input_data: new_task.input_data,
            context: None,
            result: None,
            created_at,
            heartbeat_at: None,
            finished_at: None,
        }
    }

    /// Create a test record with deterministic ID and timestamp.
    ///
    /// **Note**: This method should only be used in tests. For production code,
    /// always inject ID and time via providers.
    pub fn new_test(task_type_id: TaskTypeId, input_data: impl Into<String>) -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        Self::new(
            format!("test-{}", counter),
            format!("run-{}", counter),
            (counter * 1000) as i64,
            NewTask::new("test_queue", task_type_id, input_data),
        )
    }

    /// Lease the task: QUEUED -> RUNNING with a fresh run id
    pub fn start(&mut self, run_id: impl Into<String>, now_millis: i64) -> Result<()> {
        if self.status != TaskStatus::Queued {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }
        self.status = TaskStatus::Running;
        self.run_id = run_id.into();
        self.heartbeat_at = Some(now_millis);
        Ok(())
    }

    /// Record a terminal outcome: RUNNING -> SUCCEEDED | FAILED | CANCELED
    pub fn complete(&mut self, result: &TaskResult, now_millis: i64) -> Result<()> {
        let to = result.outcome.status();
        if self.status != TaskStatus::Running {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.result = Some(result.result_data.clone());
        self.finished_at = Some(now_millis);
        Ok(())
    }

    /// Put a running task back in the queue for another attempt
    pub fn requeue(&mut self) -> Result<()> {
        if self.status != TaskStatus::Running {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: TaskStatus::Queued.to_string(),
            });
        }
        self.status = TaskStatus::Queued;
        self.retry_count += 1;
        self.heartbeat_at = None;
        Ok(())
    }

    /// Flag the task as canceled. A task that never started ends immediately.
    pub fn request_cancel(&mut self, now_millis: i64) {
        if self.status.is_terminal() {
            return;
        }
        self.is_canceled = true;
        if self.status == TaskStatus::Queued {
            self.status = TaskStatus::Canceled;
            self.finished_at = Some(now_millis);
        }
    }
}
