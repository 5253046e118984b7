// Bulk Loader Port (Interface)

use crate::domain::{ImportResource, IndexDescriptor, IndexScope};
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait BulkImportOperation: Send + Sync {
    /// Drop the secondary indexes of the resource tables, recording each one
    /// against `scope` so it can be rebuilt later. Idempotent.
    async fn suspend_indexes(&self, scope: &IndexScope) -> Result<Vec<IndexDescriptor>>;

    /// Insert a batch in one transaction. Returns the number of resources written.
    async fn load_batch(&self, resources: &[ImportResource]) -> Result<u64>;

    /// Delete everything written with a surrogate id in `[begin, end)`
    async fn clean_range(&self, begin: i64, end: i64) -> Result<u64>;

    /// Rebuild the indexes recorded for `scope`. Safe to call when nothing is suspended.
    async fn restore_indexes(&self, scope: &IndexScope) -> Result<Vec<IndexDescriptor>>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        rows: BTreeMap<i64, ImportResource>,
        suspended: BTreeMap<String, Vec<IndexDescriptor>>,
        suspend_calls: usize,
        restore_calls: usize,
        fail_from_batch: Option<usize>,
    }

    /// Keeps loaded resources in a map keyed by surrogate id
    pub struct InMemoryBulkImporter {
        state: Mutex<State>,
        batches: AtomicUsize,
        indexes: Vec<IndexDescriptor>,
    }

    impl Default for InMemoryBulkImporter {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryBulkImporter {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(State::default()),
                batches: AtomicUsize::new(0),
                indexes: vec![
                    IndexDescriptor::new("resource", "ix_resource_type_id", "CREATE INDEX ..."),
                    IndexDescriptor::new("token_search_param", "ix_token_code", "CREATE INDEX ..."),
                ],
            }
        }

        /// Every `load_batch` call from the n-th (1-based) on fails with a storage error
        pub fn failing_from_batch(self, n: usize) -> Self {
            self.state.lock().unwrap().fail_from_batch = Some(n);
            self
        }

        pub fn heal(&self) {
            self.state.lock().unwrap().fail_from_batch = None;
        }

        pub fn surrogate_ids(&self) -> Vec<i64> {
            self.state.lock().unwrap().rows.keys().copied().collect()
        }

        pub fn line_indexes(&self) -> Vec<u64> {
            let mut lines: Vec<u64> = self
                .state
                .lock()
                .unwrap()
                .rows
                .values()
                .map(|r| r.line_index)
                .collect();
            lines.sort_unstable();
            lines
        }

        pub fn row_count(&self) -> usize {
            self.state.lock().unwrap().rows.len()
        }

        pub fn suspend_calls(&self) -> usize {
            self.state.lock().unwrap().suspend_calls
        }

        pub fn restore_calls(&self) -> usize {
            self.state.lock().unwrap().restore_calls
        }

        pub fn is_suspended(&self, job_id: &str) -> bool {
            self.state.lock().unwrap().suspended.contains_key(job_id)
        }
    }

    #[async_trait]
    impl BulkImportOperation for InMemoryBulkImporter {
        async fn suspend_indexes(&self, scope: &IndexScope) -> Result<Vec<IndexDescriptor>> {
            let mut state = self.state.lock().unwrap();
            state.suspend_calls += 1;
            state
                .suspended
                .entry(scope.job_id.clone())
                .or_insert_with(|| self.indexes.clone());
            Ok(self.indexes.clone())
        }

        async fn load_batch(&self, resources: &[ImportResource]) -> Result<u64> {
            let batch = self.batches.fetch_add(1, Ordering::SeqCst) + 1;
            let mut state = self.state.lock().unwrap();
            if matches!(state.fail_from_batch, Some(n) if batch >= n) {
                return Err(AppError::Database("injected load failure".to_string()));
            }
            if let Some(dup) = resources.iter().find(|r| state.rows.contains_key(&r.surrogate_id)) {
                return Err(AppError::Constraint(format!(
                    "UNIQUE constraint failed: resource.surrogate_id ({})",
                    dup.surrogate_id
                )));
            }
            for resource in resources {
                state.rows.insert(resource.surrogate_id, resource.clone());
            }
            Ok(resources.len() as u64)
        }

        async fn clean_range(&self, begin: i64, end: i64) -> Result<u64> {
            let mut state = self.state.lock().unwrap();
            let doomed: Vec<i64> = state.rows.range(begin..end).map(|(id, _)| *id).collect();
            for id in &doomed {
                state.rows.remove(id);
            }
            Ok(doomed.len() as u64)
        }

        async fn restore_indexes(&self, scope: &IndexScope) -> Result<Vec<IndexDescriptor>> {
            let mut state = self.state.lock().unwrap();
            state.restore_calls += 1;
            Ok(state.suspended.remove(&scope.job_id).unwrap_or_default())
        }
    }
}
