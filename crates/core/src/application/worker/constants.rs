// Worker and import constants (no magic values)
use std::time::Duration;

/// Sleep duration when no tasks are available (100ms)
pub const IDLE_SLEEP_DURATION: Duration = Duration::from_millis(100);

/// Sleep duration after worker error before retry (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// How often a worker refreshes the heartbeat and re-reads the cancel flag
pub const DEFAULT_CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default recovery window for orphaned tasks (5 minutes)
pub const DEFAULT_RECOVERY_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Queue polled by orchestrator workers
pub const ORCHESTRATOR_QUEUE: &str = "import-orchestrator";

/// Queue polled by processing workers
pub const PROCESSING_QUEUE: &str = "import-processing";

/// Records per bulk-load batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Orchestrator child polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_MAX_CONCURRENT_PROCESSING_TASKS: usize = 8;

pub const DEFAULT_ERROR_CONTAINER: &str = "import-errors";

/// Retries after the first attempt for prepare / upload / commit / get-properties
pub const STORE_OPERATION_MAX_RETRIES: u32 = 3;

/// Retries after the first attempt for append-commit
pub const APPEND_COMMIT_MAX_RETRIES: u32 = 2;

/// Linear backoff step (delay before retry k is step * (k - 1))
pub const RETRY_DELAY_STEP: Duration = Duration::from_secs(5);
