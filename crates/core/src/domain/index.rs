// Secondary index descriptors for the suspension protocol

use serde::{Deserialize, Serialize};

/// A secondary index eligible for suspension during bulk writes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub table_name: String,
    pub index_name: String,
    /// Statement that recreates the index; must be idempotent
    pub definition: String,
}

impl IndexDescriptor {
    pub fn new(
        table_name: impl Into<String>,
        index_name: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            index_name: index_name.into(),
            definition: definition.into(),
        }
    }
}

/// Suspension scope. Suspended indexes are tracked per job so that
/// restoring is idempotent and only touches what the job suspended.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexScope {
    pub job_id: String,
}

impl IndexScope {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
        }
    }
}
