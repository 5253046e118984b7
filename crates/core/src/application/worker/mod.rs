// Worker - Task execution loop

pub mod constants;

use constants::*;

use crate::application::cancellation::{cancellation_pair, CancellationToken};
use crate::application::task::Task;
use crate::application::task_factory::TaskFactory;
use crate::domain::{TaskRecord, TaskResult};
use crate::error::{AppError, Result};
use crate::port::{ContextUpdaterFactory, TaskManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Worker leases tasks from one queue and runs them one at a time
pub struct Worker {
    queue: String,
    task_manager: Arc<dyn TaskManager>,
    factory: Arc<TaskFactory>,
    context_updaters: Arc<dyn ContextUpdaterFactory>,
    heartbeat_interval: Duration,
}

impl Worker {
    pub fn new(
        queue: impl Into<String>,
        task_manager: Arc<dyn TaskManager>,
        factory: Arc<TaskFactory>,
        context_updaters: Arc<dyn ContextUpdaterFactory>,
    ) -> Self {
        Self {
            queue: queue.into(),
            task_manager,
            factory,
            context_updaters,
            heartbeat_interval: DEFAULT_CANCEL_POLL_INTERVAL,
        }
    }

    /// How often the running task's heartbeat is refreshed and its cancel flag re-read
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Run worker loop with graceful shutdown support
    pub async fn run(&self, mut shutdown: CancellationToken) -> Result<()> {
        info!("Worker started for queue: {}", self.queue);
        loop {
            if shutdown.is_canceled() {
                info!("Worker shutting down for queue: {}", self.queue);
                break;
            }
            match self.process_next_task().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = sleep(IDLE_SLEEP_DURATION) => {},
                        _ = shutdown.canceled() => {
                            info!("Worker interrupted during idle");
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!("Worker error: {}", e);
                    tokio::select! {
                        _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {},
                        _ = shutdown.canceled() => {
                            info!("Worker interrupted during error recovery");
                            break;
                        }
                    }
                }
            }
        }
        info!("Worker stopped for queue: {}", self.queue);
        Ok(())
    }

    /// Process next task from queue (returns true if a task was processed)
    pub async fn process_next_task(&self) -> Result<bool> {
        // Leased atomically: already RUNNING with a fresh run id
        let task = match self.task_manager.lease_next(&self.queue).await? {
            Some(t) => t,
            None => return Ok(false),
        };
        info!(
            task_id = %task.task_id,
            task_type_id = %task.task_type_id,
            attempt = %(task.retry_count + 1),
            "Processing task"
        );

        let updater = self
            .context_updaters
            .create_context_updater(&task.task_id, &task.run_id);
        let runnable = match self.factory.create(&task, updater) {
            Ok(Some(runnable)) => runnable,
            Ok(None) => {
                error!(task_id = %task.task_id, task_type_id = %task.task_type_id, "Unknown task type");
                let message = format!("Unknown task type id {}", task.task_type_id);
                self.finish(&task, TaskResult::failed(error_payload(&message))).await?;
                return Ok(true);
            }
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "Task could not be built");
                self.finish(&task, TaskResult::failed(error_payload(&e.to_string()))).await?;
                return Ok(true);
            }
        };

        self.run_leased(&task, runnable).await?;
        Ok(true)
    }

    async fn run_leased(&self, task: &TaskRecord, runnable: Box<dyn Task>) -> Result<()> {
        let (cancel_source, cancel_token) = cancellation_pair();
        if task.is_canceled {
            cancel_source.cancel();
        }

        // Spawned so a panic inside the task cannot take the worker down
        let mut handle = tokio::task::spawn(async move { runnable.execute(cancel_token).await });

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;
        let joined = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                _ = heartbeat.tick() => {
                    match self.task_manager.keep_alive(&task.task_id, &task.run_id).await {
                        Ok(current) => {
                            if current.is_canceled && !cancel_source.is_canceled() {
                                info!(task_id = %task.task_id, "Cancel requested, forwarding to task");
                                cancel_source.cancel();
                            }
                        }
                        Err(AppError::Conflict(msg)) => {
                            warn!(task_id = %task.task_id, reason = %msg, "Lease lost, aborting run");
                            handle.abort();
                        }
                        Err(e) => warn!(task_id = %task.task_id, error = %e, "Heartbeat failed"),
                    }
                }
            }
        };

        match joined {
            Ok(Ok(result)) => {
                info!(task_id = %task.task_id, outcome = ?result.outcome, "Task finished");
                self.finish(task, result).await
            }
            Ok(Err(e)) if e.is_retriable() && task.retry_count < task.max_retry_count => {
                warn!(
                    task_id = %task.task_id,
                    retry_count = %task.retry_count,
                    max_retry_count = %task.max_retry_count,
                    error = %e,
                    "Retriable failure, requeueing task"
                );
                match self.task_manager.requeue_task(&task.task_id, &task.run_id).await {
                    Err(AppError::Conflict(msg)) => {
                        warn!(task_id = %task.task_id, reason = %msg, "Requeue skipped, lease lost");
                        Ok(())
                    }
                    other => other,
                }
            }
            Ok(Err(e)) => {
                error!(task_id = %task.task_id, error = %e, "Task failed");
                self.finish(task, TaskResult::failed(error_payload(&e.to_string()))).await
            }
            Err(join_err) if join_err.is_panic() => {
                error!(task_id = %task.task_id, "Task panicked: {:?}", join_err);
                self.finish(task, TaskResult::failed(error_payload("Task panicked"))).await
            }
            Err(_) => {
                warn!(task_id = %task.task_id, "Run aborted, leaving the task to its new owner");
                Ok(())
            }
        }
    }

    /// Complete the run; a superseded run only logs
    async fn finish(&self, task: &TaskRecord, result: TaskResult) -> Result<()> {
        match self
            .task_manager
            .complete_task(&task.task_id, &task.run_id, &result)
            .await
        {
            Err(AppError::Conflict(msg)) => {
                warn!(task_id = %task.task_id, reason = %msg, "Completion rejected, lease lost");
                Ok(())
            }
            other => other,
        }
    }
}

fn error_payload(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}
