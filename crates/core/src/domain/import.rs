// Import Domain Model: manifest, task payloads, checkpoints and results

use crate::domain::codec::{Versioned, SCHEMA_VERSION};
use crate::domain::task::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One source file of a job. Immutable once the job is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub resource_type: String,
    pub source_uri: String,
}

impl ManifestEntry {
    pub fn new(resource_type: impl Into<String>, source_uri: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            source_uri: source_uri.into(),
        }
    }
}

/// Job-level policy deciding the terminal status from child outcomes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Succeed and report per-record / per-file errors
    #[default]
    PartialSuccess,
    /// Fail the job if any processing task failed
    FailOnAnyTaskFailure,
    /// Fail the job if failed records / all records exceeds `rate`
    MaxRecordErrorRate { rate: f64 },
}

impl FailurePolicy {
    pub fn evaluate(&self, succeeded: u64, failed_records: u64, failed_tasks: usize) -> ImportJobStatus {
        match self {
            FailurePolicy::PartialSuccess => ImportJobStatus::Succeeded,
            FailurePolicy::FailOnAnyTaskFailure if failed_tasks > 0 => ImportJobStatus::Failed,
            FailurePolicy::FailOnAnyTaskFailure => ImportJobStatus::Succeeded,
            FailurePolicy::MaxRecordErrorRate { rate } => {
                let total = succeeded + failed_records;
                if total == 0 {
                    return ImportJobStatus::Succeeded;
                }
                let observed = failed_records as f64 / total as f64;
                if observed > *rate {
                    ImportJobStatus::Failed
                } else {
                    ImportJobStatus::Succeeded
                }
            }
        }
    }
}

/// Orchestrator task input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorInput {
    pub schema_version: u32,
    pub job_id: String,
    pub manifest: Vec<ManifestEntry>,
    pub max_concurrent_processing_tasks: usize,
    pub error_container: String,
    pub processing_queue: String,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Versioned for OrchestratorInput {
    const KIND: &'static str = "OrchestratorInput";

    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

/// Orchestrator state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorStage {
    #[default]
    Planning,
    Dispatching,
    Monitoring,
    Finalizing,
}

/// Orchestrator checkpoint: resumable cursor over the manifest plus child bookkeeping.
///
/// Invariant: every manifest index maps to at most one created child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorContext {
    pub schema_version: u32,
    pub stage: OrchestratorStage,
    pub indexes_suspended: bool,
    pub next_manifest_index: usize,
    pub created_tasks: BTreeMap<usize, TaskId>,
    pub completed_task_ids: BTreeSet<TaskId>,
    pub failed_task_ids: BTreeSet<TaskId>,
    pub child_results: BTreeMap<TaskId, ProcessingResult>,
    pub child_errors: BTreeMap<TaskId, String>,
}

impl Default for OrchestratorContext {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            stage: OrchestratorStage::Planning,
            indexes_suspended: false,
            next_manifest_index: 0,
            created_tasks: BTreeMap::new(),
            completed_task_ids: BTreeSet::new(),
            failed_task_ids: BTreeSet::new(),
            child_results: BTreeMap::new(),
            child_errors: BTreeMap::new(),
        }
    }
}

impl Versioned for OrchestratorContext {
    const KIND: &'static str = "OrchestratorContext";

    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

impl OrchestratorContext {
    /// Created children that have not reached a terminal state yet
    pub fn pending_task_ids(&self) -> Vec<TaskId> {
        self.created_tasks
            .values()
            .filter(|id| !self.completed_task_ids.contains(*id) && !self.failed_task_ids.contains(*id))
            .cloned()
            .collect()
    }

    pub fn all_created(&self, manifest_len: usize) -> bool {
        self.created_tasks.len() >= manifest_len
    }

    pub fn manifest_index_of(&self, task_id: &str) -> Option<usize> {
        self.created_tasks
            .iter()
            .find(|(_, id)| id.as_str() == task_id)
            .map(|(index, _)| *index)
    }
}

/// Processing task input. Immutable once the task is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingInput {
    pub schema_version: u32,
    pub job_id: String,
    pub manifest_index: usize,
    pub resource_type: String,
    pub source_uri: String,
    /// First surrogate id reserved for this task
    pub begin_sequence_id: i64,
    /// Exclusive end of the reserved range
    pub end_sequence_id: i64,
    pub error_container: String,
}

impl Versioned for ProcessingInput {
    const KIND: &'static str = "ProcessingInput";

    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

impl ProcessingInput {
    /// Deterministic error file name, so a resumed run appends to the same object
    pub fn error_file_name(&self) -> String {
        format!(
            "{}/{}_{}.ndjson",
            self.job_id, self.manifest_index, self.resource_type
        )
    }
}

/// Processing checkpoint, persisted after every committed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingProgress {
    pub schema_version: u32,
    pub bytes_consumed: u64,
    pub lines_consumed: u64,
    pub succeeded_count: u64,
    pub failed_count: u64,
    /// Next surrogate id to hand out; 0 before the first batch
    pub next_sequence_id: i64,
    pub error_log_location: Option<String>,
}

impl Default for ProcessingProgress {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            bytes_consumed: 0,
            lines_consumed: 0,
            succeeded_count: 0,
            failed_count: 0,
            next_sequence_id: 0,
            error_log_location: None,
        }
    }
}

impl Versioned for ProcessingProgress {
    const KIND: &'static str = "ProcessingProgress";

    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

/// Per-file outcome reported by a processing task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub resource_type: String,
    pub source_uri: String,
    pub succeeded_count: u64,
    pub failed_count: u64,
    pub error_log_location: Option<String>,
}

/// One entry of an error file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportErrorRecord {
    pub index: u64,
    pub reason: String,
}

impl ImportErrorRecord {
    pub fn new(index: u64, reason: impl Into<String>) -> Self {
        Self {
            index,
            reason: reason.into(),
        }
    }
}

/// Terminal job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportJobStatus {
    Succeeded,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOutputEntry {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub count: u64,
    pub input_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportErrorEntry {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub count: u64,
    pub input_url: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTaskEntry {
    pub input_url: String,
    pub reason: String,
}

/// Final job result. Exposes counts and error file locations, never retry internals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportJobResult {
    pub job_id: String,
    pub status: ImportJobStatus,
    pub output: Vec<ImportOutputEntry>,
    pub error: Vec<ImportErrorEntry>,
    pub failed_tasks: Vec<FailedTaskEntry>,
}

impl ImportJobResult {
    pub fn total_succeeded(&self) -> u64 {
        self.output.iter().map(|o| o.count).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.error.iter().map(|e| e.count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_tolerates_failures() {
        let policy = FailurePolicy::default();
        assert_eq!(policy.evaluate(10, 90, 3), ImportJobStatus::Succeeded);
    }

    #[test]
    fn test_fail_on_any_task_failure() {
        let policy = FailurePolicy::FailOnAnyTaskFailure;
        assert_eq!(policy.evaluate(10, 0, 0), ImportJobStatus::Succeeded);
        assert_eq!(policy.evaluate(10, 0, 1), ImportJobStatus::Failed);
    }

    #[test]
    fn test_error_rate_threshold() {
        let policy = FailurePolicy::MaxRecordErrorRate { rate: 0.1 };
        assert_eq!(policy.evaluate(95, 5, 0), ImportJobStatus::Succeeded);
        assert_eq!(policy.evaluate(80, 20, 0), ImportJobStatus::Failed);
        assert_eq!(policy.evaluate(0, 0, 0), ImportJobStatus::Succeeded);
    }

    #[test]
    fn test_policy_serde_shape() {
        let policy: FailurePolicy =
            serde_json::from_str(r#"{"kind":"max_record_error_rate","rate":0.25}"#).unwrap();
        assert_eq!(policy, FailurePolicy::MaxRecordErrorRate { rate: 0.25 });
    }

    #[test]
    fn test_pending_excludes_terminal_children() {
        let mut ctx = OrchestratorContext::default();
        ctx.created_tasks.insert(0, "a".to_string());
        ctx.created_tasks.insert(1, "b".to_string());
        ctx.created_tasks.insert(2, "c".to_string());
        ctx.completed_task_ids.insert("a".to_string());
        ctx.failed_task_ids.insert("c".to_string());

        assert_eq!(ctx.pending_task_ids(), vec!["b".to_string()]);
        assert_eq!(ctx.manifest_index_of("c"), Some(2));
        assert!(ctx.all_created(3));
        assert!(!ctx.all_created(4));
    }

    #[test]
    fn test_context_map_keys_survive_json() {
        let mut ctx = OrchestratorContext::default();
        ctx.created_tasks.insert(7, "task-7".to_string());
        let raw = serde_json::to_string(&ctx).unwrap();
        let back: OrchestratorContext = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn test_manifest_entry_uses_camel_case() {
        let entry: ManifestEntry =
            serde_json::from_str(r#"{"resourceType":"Patient","sourceUri":"memory:///a.ndjson"}"#)
                .unwrap();
        assert_eq!(entry, ManifestEntry::new("Patient", "memory:///a.ndjson"));
    }
}
