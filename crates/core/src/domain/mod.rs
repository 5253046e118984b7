// Domain Layer - Pure business logic and entities

pub mod codec;
pub mod error;
pub mod import;
pub mod index;
pub mod resource;
pub mod task;

// Re-exports
pub use codec::{decode, decode_or_default, encode, Versioned, SCHEMA_VERSION};
pub use error::DomainError;
pub use import::{
    FailedTaskEntry, FailurePolicy, ImportErrorEntry, ImportErrorRecord, ImportJobResult,
    ImportJobStatus, ImportOutputEntry, ManifestEntry, OrchestratorContext, OrchestratorInput,
    OrchestratorStage, ProcessingInput, ProcessingProgress, ProcessingResult,
};
pub use index::{IndexDescriptor, IndexScope};
pub use resource::{ImportResource, ParsedResource, SearchParam};
pub use task::{
    NewTask, QueueId, RunId, TaskId, TaskOutcome, TaskRecord, TaskResult, TaskStatus,
    TaskTypeId, ORCHESTRATOR_TASK_TYPE_ID, PROCESSING_TASK_TYPE_ID,
};
