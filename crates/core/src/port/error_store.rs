// Import Error Store Port

use crate::domain::ImportErrorRecord;
use crate::error::Result;
use async_trait::async_trait;

/// Append-only error log for one source file
#[async_trait]
pub trait ImportErrorStore: Send + Sync {
    /// Append records as NDJSON. Empty input is a no-op.
    async fn upload_errors(&self, records: &[ImportErrorRecord]) -> Result<()>;

    /// URI of the error file
    fn error_file_location(&self) -> &str;
}

#[async_trait]
pub trait ImportErrorStoreFactory: Send + Sync {
    /// Prepare the error file `file_name` inside `container`
    async fn initialize(&self, container: &str, file_name: &str) -> Result<Box<dyn ImportErrorStore>>;
}
