// Bulk import: orchestrator and processing tasks plus their collaborators

mod error_store;
mod job_service;
mod orchestrator;
mod parser;
mod processing;

pub use error_store::{BlobImportErrorStore, BlobImportErrorStoreFactory};
pub use job_service::{
    CancelImportResponse, GetImportResponse, ImportJobService, ImportOptions, ImportProgress,
    ImportRequest, STATUS_ACCEPTED, STATUS_CONFLICT, STATUS_NOT_FOUND, STATUS_OK,
};
pub use orchestrator::OrchestratorTask;
pub use parser::NdjsonResourceParser;
pub use processing::ProcessingTask;

use crate::application::retry::RetryPolicy;
use crate::application::worker::constants::{DEFAULT_BATCH_SIZE, DEFAULT_POLL_INTERVAL};
use crate::error::AppError;
use crate::port::{
    BulkImportOperation, ImportErrorStoreFactory, IntegrationDataStoreClient,
    IntegrationDataStoreError, ResourceParser, SequenceIdGenerator, TaskManager,
};
use std::sync::Arc;
use std::time::Duration;

/// Tunables shared by both import task kinds
#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Applied to bulk-loader calls
    pub load_retry: RetryPolicy,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            load_retry: RetryPolicy::store_operation(),
        }
    }
}

/// Shared collaborators wired into every import task by reference
#[derive(Clone)]
pub struct ImportDependencies {
    pub task_manager: Arc<dyn TaskManager>,
    pub store: Arc<dyn IntegrationDataStoreClient>,
    pub bulk_import: Arc<dyn BulkImportOperation>,
    pub sequence: Arc<dyn SequenceIdGenerator>,
    pub error_stores: Arc<dyn ImportErrorStoreFactory>,
    pub parser: Arc<dyn ResourceParser>,
    pub settings: ImportSettings,
}

/// Transient store failures become retriable task errors so the worker can
/// requeue the task and resume from its checkpoint.
pub(crate) fn store_error(err: IntegrationDataStoreError) -> AppError {
    if err.is_transient() {
        AppError::Retriable(err.to_string())
    } else {
        AppError::Integration(err)
    }
}

/// Storage-engine errors worth another attempt; constraint violations are not
pub(crate) fn is_transient_load_error(err: &AppError) -> bool {
    matches!(err, AppError::Database(_) | AppError::Retriable(_))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::port::bulk_import::mocks::InMemoryBulkImporter;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::integration_store::mocks::InMemoryIntegrationStore;
    use crate::port::task_manager::mocks::InMemoryTaskManager;
    use crate::port::AtomicSequenceIdGenerator;

    pub struct Harness {
        pub deps: ImportDependencies,
        pub task_manager: Arc<InMemoryTaskManager>,
        pub store: Arc<InMemoryIntegrationStore>,
        pub bulk: Arc<InMemoryBulkImporter>,
    }

    pub fn dependencies() -> Harness {
        with_bulk(InMemoryBulkImporter::new())
    }

    pub fn with_bulk(bulk: InMemoryBulkImporter) -> Harness {
        let task_manager = Arc::new(InMemoryTaskManager::new());
        let store = Arc::new(InMemoryIntegrationStore::with_chunk_size(7));
        let bulk = Arc::new(bulk);
        let deps = ImportDependencies {
            task_manager: task_manager.clone(),
            store: store.clone(),
            bulk_import: bulk.clone(),
            sequence: Arc::new(AtomicSequenceIdGenerator::new(1000)),
            error_stores: Arc::new(BlobImportErrorStoreFactory::new(
                store.clone(),
                Arc::new(SequentialIdProvider::new("block")),
            )),
            parser: Arc::new(NdjsonResourceParser),
            settings: ImportSettings {
                batch_size: 10,
                poll_interval: Duration::from_millis(10),
                load_retry: RetryPolicy::linear(1, Duration::from_millis(1)),
            },
        };
        Harness {
            deps,
            task_manager,
            store,
            bulk,
        }
    }

    pub fn patient_line(id: usize) -> String {
        format!(
            r#"{{"resourceType":"Patient","id":"p{}","identifier":[{{"system":"urn:mrn","value":"{}"}}],"name":[{{"family":"Doe{}"}}]}}"#,
            id, id, id
        )
    }

    /// `count` patient lines; the 1-based lines in `malformed` are broken JSON
    pub fn patient_file(count: usize, malformed: &[usize]) -> String {
        let mut out = String::new();
        for i in 1..=count {
            if malformed.contains(&i) {
                out.push_str("{\"resourceType\":\"Patient\",");
            } else {
                out.push_str(&patient_line(i));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_violations_are_not_replayed() {
        assert!(!is_transient_load_error(&AppError::Constraint(
            "UNIQUE constraint failed: resource.surrogate_id".to_string()
        )));
        assert!(!is_transient_load_error(&AppError::Conflict("stale run".to_string())));
        assert!(is_transient_load_error(&AppError::Retriable("database is locked".to_string())));
        assert!(is_transient_load_error(&AppError::Database("disk I/O error".to_string())));
    }

    #[test]
    fn test_store_errors_split_on_status() {
        let throttled = store_error(IntegrationDataStoreError::new("slow down", 503));
        assert!(throttled.is_retriable());
        let missing = store_error(IntegrationDataStoreError::new("gone", 404));
        assert!(matches!(missing, AppError::Integration(_)));
    }
}
