// Port Layer - Interfaces for external dependencies

pub mod bulk_import;
pub mod context_updater;
pub mod error_store;
pub mod id_provider; // For deterministic testing
pub mod integration_store;
pub mod resource_parser;
pub mod sequence_id;
pub mod task_manager;
pub mod time_provider;

// Re-exports
pub use bulk_import::BulkImportOperation;
pub use context_updater::{
    ContextUpdater, ContextUpdaterFactory, TaskContextUpdater, TaskContextUpdaterFactory,
};
pub use error_store::{ImportErrorStore, ImportErrorStoreFactory};
pub use id_provider::{IdProvider, UuidProvider};
pub use integration_store::{
    BlobProperties, ByteStream, IntegrationDataStoreClient, IntegrationDataStoreError,
    StoreResult,
};
pub use resource_parser::ResourceParser;
pub use sequence_id::{AtomicSequenceIdGenerator, SequenceIdGenerator, SequenceRange};
pub use task_manager::TaskManager;
pub use time_provider::{SystemTimeProvider, TimeProvider};
