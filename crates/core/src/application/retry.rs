// Bounded linear retry for remote and storage calls
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::application::worker::constants::{
    APPEND_COMMIT_MAX_RETRIES, RETRY_DELAY_STEP, STORE_OPERATION_MAX_RETRIES,
};

/// Linear backoff policy.
///
/// An operation gets `1 + max_retries` attempts. The delay before retry `k`
/// (1-based) is `delay_step * (k - 1)`, so the first retry is immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    delay_step: Duration,
}

impl RetryPolicy {
    pub fn linear(max_retries: u32, delay_step: Duration) -> Self {
        Self {
            max_retries,
            delay_step,
        }
    }

    /// prepare / upload / commit / get-properties / batch loads
    pub fn store_operation() -> Self {
        Self::linear(STORE_OPERATION_MAX_RETRIES, RETRY_DELAY_STEP)
    }

    pub fn append_commit() -> Self {
        Self::linear(APPEND_COMMIT_MAX_RETRIES, RETRY_DELAY_STEP)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        self.delay_step * retry.saturating_sub(1)
    }

    /// Run `attempt` until it succeeds, fails with a non-transient error, or
    /// the retry budget is spent. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        is_transient: impl Fn(&E) -> bool,
        mut attempt: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut retry = 0;
        loop {
            match attempt().await {
                Ok(value) => {
                    if retry > 0 {
                        info!(operation = %operation, retries = %retry, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if retry < self.max_retries && is_transient(&e) => {
                    retry += 1;
                    let delay = self.delay_before_retry(retry);
                    warn!(
                        operation = %operation,
                        retry = %retry,
                        max_retries = %self.max_retries,
                        delay_ms = %delay.as_millis(),
                        error = %e,
                        "Transient failure, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
