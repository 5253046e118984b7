// Application Layer - Use Cases and Import Tasks

pub mod cancellation;
pub mod import;
pub mod recovery;
pub mod retry;
pub mod task;
pub mod task_factory;
pub mod worker;

// Re-exports
pub use cancellation::{cancellation_pair, CancellationSource, CancellationToken};
pub use import::{
    BlobImportErrorStoreFactory, ImportDependencies, ImportJobService, ImportSettings,
    NdjsonResourceParser,
};
pub use recovery::RecoveryService;
pub use retry::RetryPolicy;
pub use task::Task;
pub use task_factory::TaskFactory;
pub use worker::Worker;
