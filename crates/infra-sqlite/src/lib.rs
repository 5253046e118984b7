// Bulk Import Infrastructure - SQLite Adapter
// Implements: TaskManager, SequenceIdGenerator, BulkImportOperation

mod bulk_import;
mod connection;
mod error;
mod migration;
mod sequence;
mod task_manager;

pub use bulk_import::{
    unclustered_indexes, SqliteBulkImporter, RESOURCE_TABLES, UNCLUSTERED_INDEXES,
    UNCLUSTERED_INDEX_SET_VERSION,
};
pub use connection::create_pool;
pub use migration::run_migrations;
pub use sequence::{SqliteSequenceIdGenerator, RESOURCE_SURROGATE_SEQUENCE};
pub use task_manager::SqliteTaskManager;
