// ID Provider Port (task ids, run ids, block ids)

/// ID provider interface (allows deterministic IDs in tests)
pub trait IdProvider: Send + Sync {
    fn generate_id(&self) -> String;
}

/// UUID v4 provider (production)
pub struct UuidProvider;

impl IdProvider for UuidProvider {
    fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// `<prefix>-1`, `<prefix>-2`, ...
    pub struct SequentialIdProvider {
        prefix: String,
        next: AtomicU64,
    }

    impl SequentialIdProvider {
        pub fn new(prefix: impl Into<String>) -> Self {
            Self {
                prefix: prefix.into(),
                next: AtomicU64::new(1),
            }
        }
    }

    impl IdProvider for SequentialIdProvider {
        fn generate_id(&self) -> String {
            format!("{}-{}", self.prefix, self.next.fetch_add(1, Ordering::SeqCst))
        }
    }
}
