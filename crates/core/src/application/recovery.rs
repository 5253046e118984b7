// Crash recovery: requeue tasks orphaned by a dead worker
use crate::port::{TaskManager, TimeProvider};
use std::sync::Arc;
use tracing::info;

use crate::application::worker::constants::DEFAULT_RECOVERY_WINDOW_MS;

/// On daemon startup, returns RUNNING tasks with a stale heartbeat to the queue.
///
/// Import tasks resume from their persisted checkpoint, so requeueing is
/// always safe.
pub struct RecoveryService {
    task_manager: Arc<dyn TaskManager>,
    time_provider: Arc<dyn TimeProvider>,
    recovery_window_ms: i64,
}

impl RecoveryService {
    /// # Arguments
    /// * `recovery_window_ms` - Optional custom recovery window (default: 5 minutes)
    pub fn new(
        task_manager: Arc<dyn TaskManager>,
        time_provider: Arc<dyn TimeProvider>,
        recovery_window_ms: Option<i64>,
    ) -> Self {
        Self {
            task_manager,
            time_provider,
            recovery_window_ms: recovery_window_ms.unwrap_or(DEFAULT_RECOVERY_WINDOW_MS),
        }
    }

    /// Returns the number of tasks requeued
    pub async fn recover_orphaned_tasks(&self) -> crate::error::Result<usize> {
        let now = self.time_provider.now_millis();
        let cutoff = now - self.recovery_window_ms;

        info!(
            cutoff_time = %cutoff,
            recovery_window_ms = %self.recovery_window_ms,
            "Starting orphaned task recovery"
        );

        let stale = self.task_manager.find_stale_running(cutoff).await?;
        for task in &stale {
            info!(
                task_id = %task.task_id,
                heartbeat_at = ?task.heartbeat_at,
                "Requeueing orphaned task"
            );
            self.task_manager.reset_to_queued(&task.task_id).await?;
        }

        info!(recovered_count = %stale.len(), "Orphaned task recovery complete");
        Ok(stale.len())
    }
}
