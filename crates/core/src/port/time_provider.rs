// Time Provider Port (for testability)

/// Time provider interface (heartbeats, staleness checks, finished_at)
pub trait TimeProvider: Send + Sync {
    /// Get current time in milliseconds since epoch
    fn now_millis(&self) -> i64;
}

/// System time provider (production)
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Manually advanced clock
    pub struct ManualClock {
        now: AtomicI64,
    }

    impl ManualClock {
        pub fn new(start_millis: i64) -> Self {
            Self {
                now: AtomicI64::new(start_millis),
            }
        }

        pub fn advance(&self, millis: i64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl TimeProvider for ManualClock {
        fn now_millis(&self) -> i64 {
            self.now.load(Ordering::SeqCst)
        }
    }
}
