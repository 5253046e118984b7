// Sequence Identity Generator Port
//
// Hands out contiguous, never-reused ranges of resource surrogate ids.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Half-open range `[begin, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub begin: i64,
    pub end: i64,
}

impl SequenceRange {
    pub fn len(&self) -> u64 {
        (self.end - self.begin).max(0) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    pub fn contains(&self, id: i64) -> bool {
        id >= self.begin && id < self.end
    }
}

#[async_trait]
pub trait SequenceIdGenerator: Send + Sync {
    /// Atomically reserve `count` ids. Ranges returned to concurrent callers never overlap.
    async fn reserve(&self, count: u64) -> Result<SequenceRange>;
}

/// Process-local generator (single daemon without a shared store, tests)
pub struct AtomicSequenceIdGenerator {
    next: AtomicI64,
}

impl AtomicSequenceIdGenerator {
    pub fn new(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }
}

impl Default for AtomicSequenceIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl SequenceIdGenerator for AtomicSequenceIdGenerator {
    async fn reserve(&self, count: u64) -> Result<SequenceRange> {
        let count = i64::try_from(count)
            .map_err(|_| AppError::Validation(format!("Cannot reserve {} ids", count)))?;
        let begin = self.next.fetch_add(count, Ordering::SeqCst);
        Ok(SequenceRange {
            begin,
            end: begin + count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ranges_are_contiguous() {
        let generator = AtomicSequenceIdGenerator::new(100);
        let a = generator.reserve(10).await.unwrap();
        let b = generator.reserve(5).await.unwrap();
        assert_eq!(a, SequenceRange { begin: 100, end: 110 });
        assert_eq!(b, SequenceRange { begin: 110, end: 115 });
        assert_eq!(b.len(), 5);
        assert!(b.contains(114));
        assert!(!b.contains(115));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_do_not_overlap() {
        let generator = Arc::new(AtomicSequenceIdGenerator::default());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let generator = Arc::clone(&generator);
            handles.push(tokio::spawn(async move { generator.reserve(7).await.unwrap() }));
        }

        let mut ranges = Vec::new();
        for handle in handles {
            ranges.push(handle.await.unwrap());
        }
        ranges.sort_by_key(|r| r.begin);
        for pair in ranges.windows(2) {
            assert!(pair[0].end <= pair[1].begin);
        }
        assert_eq!(ranges.iter().map(|r| r.len()).sum::<u64>(), 16 * 7);
    }
}
