// Import Job Service: submit / status / cancel on top of the task queue

use crate::application::worker::constants::{
    DEFAULT_ERROR_CONTAINER, DEFAULT_MAX_CONCURRENT_PROCESSING_TASKS, ORCHESTRATOR_QUEUE,
    PROCESSING_QUEUE,
};
use crate::domain::{
    decode_or_default, encode, FailurePolicy, ImportJobResult, ManifestEntry, NewTask,
    OrchestratorContext, OrchestratorInput, TaskRecord, TaskStatus, ORCHESTRATOR_TASK_TYPE_ID,
    SCHEMA_VERSION,
};
use crate::error::{AppError, Result};
use crate::port::{IdProvider, TaskManager};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub const STATUS_OK: u16 = 200;
pub const STATUS_ACCEPTED: u16 = 202;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_CONFLICT: u16 = 409;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOptions {
    pub max_concurrent_processing_tasks: Option<usize>,
    pub error_container: Option<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    /// Caller-chosen job id; resubmitting the same id returns the existing job
    pub job_id: Option<String>,
    pub manifest: Vec<ManifestEntry>,
    #[serde(default)]
    pub options: ImportOptions,
}

/// Progress visible while a job is running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportProgress {
    pub files: usize,
    pub tasks_created: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetImportResponse {
    pub status_code: u16,
    pub job_status: Option<TaskStatus>,
    pub progress: Option<ImportProgress>,
    pub result: Option<ImportJobResult>,
    /// Set when the orchestrator itself failed before producing a result
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelImportResponse {
    pub status_code: u16,
}

pub struct ImportJobService {
    task_manager: Arc<dyn TaskManager>,
    ids: Arc<dyn IdProvider>,
    orchestrator_queue: String,
    processing_queue: String,
    default_max_concurrent: usize,
    default_error_container: String,
}

impl ImportJobService {
    pub fn new(task_manager: Arc<dyn TaskManager>, ids: Arc<dyn IdProvider>) -> Self {
        Self {
            task_manager,
            ids,
            orchestrator_queue: ORCHESTRATOR_QUEUE.to_string(),
            processing_queue: PROCESSING_QUEUE.to_string(),
            default_max_concurrent: DEFAULT_MAX_CONCURRENT_PROCESSING_TASKS,
            default_error_container: DEFAULT_ERROR_CONTAINER.to_string(),
        }
    }

    pub fn with_defaults(mut self, max_concurrent: usize, error_container: impl Into<String>) -> Self {
        self.default_max_concurrent = max_concurrent;
        self.default_error_container = error_container.into();
        self
    }

    fn job_key(job_id: &str) -> String {
        format!("import:{}", job_id)
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<TaskRecord>> {
        self.task_manager
            .find_by_idempotency_key(&Self::job_key(job_id))
            .await
    }

    /// Accept a job and queue its orchestrator
    pub async fn submit(&self, request: ImportRequest) -> Result<String> {
        if request.manifest.is_empty() {
            return Err(AppError::Validation("Manifest must not be empty".to_string()));
        }
        if let Some(entry) = request
            .manifest
            .iter()
            .find(|e| e.resource_type.trim().is_empty() || e.source_uri.trim().is_empty())
        {
            return Err(AppError::Validation(format!(
                "Manifest entry {:?} needs a resource type and a source uri",
                entry
            )));
        }
        let max_concurrent = request
            .options
            .max_concurrent_processing_tasks
            .unwrap_or(self.default_max_concurrent);
        if max_concurrent == 0 {
            return Err(AppError::Validation(
                "max_concurrent_processing_tasks must be positive".to_string(),
            ));
        }
        if let FailurePolicy::MaxRecordErrorRate { rate } = request.options.failure_policy {
            if !(0.0..=1.0).contains(&rate) {
                return Err(AppError::Validation(format!("Error rate {} outside [0, 1]", rate)));
            }
        }

        let job_id = request.job_id.unwrap_or_else(|| self.ids.generate_id());
        let input = OrchestratorInput {
            schema_version: SCHEMA_VERSION,
            job_id: job_id.clone(),
            manifest: request.manifest,
            max_concurrent_processing_tasks: max_concurrent,
            error_container: request
                .options
                .error_container
                .unwrap_or_else(|| self.default_error_container.clone()),
            processing_queue: self.processing_queue.clone(),
            failure_policy: request.options.failure_policy,
        };
        let task = NewTask::new(
            self.orchestrator_queue.clone(),
            ORCHESTRATOR_TASK_TYPE_ID,
            encode(&input)?,
        )
        .with_idempotency_key(Self::job_key(&job_id));

        let record = self.task_manager.create_task(task).await?;
        info!(
            job_id = %job_id,
            task_id = %record.task_id,
            files = %input.manifest.len(),
            "Import job submitted"
        );
        Ok(job_id)
    }

    pub async fn get_status(&self, job_id: &str) -> Result<GetImportResponse> {
        let Some(record) = self.find_job(job_id).await? else {
            return Ok(GetImportResponse {
                status_code: STATUS_NOT_FOUND,
                job_status: None,
                progress: None,
                result: None,
                error: None,
            });
        };

        if !record.status.is_terminal() {
            return Ok(GetImportResponse {
                status_code: STATUS_ACCEPTED,
                job_status: Some(record.status),
                progress: Some(progress_of(&record)),
                result: None,
                error: None,
            });
        }

        let raw = record.result.as_deref().unwrap_or_default();
        let (result, error) = match serde_json::from_str::<ImportJobResult>(raw) {
            Ok(result) => (Some(result), None),
            Err(_) => (None, Some(error_message(raw, record.status))),
        };
        Ok(GetImportResponse {
            status_code: STATUS_OK,
            job_status: Some(record.status),
            progress: Some(progress_of(&record)),
            result,
            error,
        })
    }

    pub async fn cancel(&self, job_id: &str) -> Result<CancelImportResponse> {
        let Some(record) = self.find_job(job_id).await? else {
            return Ok(CancelImportResponse {
                status_code: STATUS_NOT_FOUND,
            });
        };
        if record.status.is_terminal() {
            return Ok(CancelImportResponse {
                status_code: STATUS_CONFLICT,
            });
        }

        self.task_manager.cancel_task(&record.task_id).await?;
        info!(job_id = %job_id, task_id = %record.task_id, "Import job cancel requested");
        Ok(CancelImportResponse {
            status_code: STATUS_ACCEPTED,
        })
    }
}

fn progress_of(record: &TaskRecord) -> ImportProgress {
    let ctx: OrchestratorContext = decode_or_default(record.context.as_deref()).unwrap_or_default();
    let files = serde_json::from_str::<OrchestratorInput>(&record.input_data)
        .map(|input| input.manifest.len())
        .unwrap_or_default();
    ImportProgress {
        files,
        tasks_created: ctx.created_tasks.len(),
        tasks_completed: ctx.completed_task_ids.len(),
        tasks_failed: ctx.failed_task_ids.len(),
    }
}

fn error_message(raw: &str, status: TaskStatus) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| format!("Import job {}", status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ImportJobStatus, TaskResult};
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::task_manager::mocks::InMemoryTaskManager;

    fn service() -> (ImportJobService, Arc<InMemoryTaskManager>) {
        let tasks = Arc::new(InMemoryTaskManager::new());
        let service = ImportJobService::new(tasks.clone(), Arc::new(SequentialIdProvider::new("job")));
        (service, tasks)
    }

    fn request(job_id: Option<&str>) -> ImportRequest {
        ImportRequest {
            job_id: job_id.map(str::to_string),
            manifest: vec![ManifestEntry::new("Patient", "memory:///in/a.ndjson")],
            options: ImportOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_submit_queues_one_orchestrator_per_job_id() {
        let (service, tasks) = service();
        let first = service.submit(request(Some("job-a"))).await.unwrap();
        let again = service.submit(request(Some("job-a"))).await.unwrap();
        let generated = service.submit(request(None)).await.unwrap();

        assert_eq!(first, "job-a");
        assert_eq!(again, "job-a");
        assert_eq!(generated, "job-1");
        assert_eq!(tasks.insert_count(), 2);

        let record = tasks.all().remove(0);
        assert_eq!(record.queue_id, ORCHESTRATOR_QUEUE);
        let input: OrchestratorInput = crate::domain::decode(&record.input_data).unwrap();
        assert_eq!(input.processing_queue, PROCESSING_QUEUE);
        assert_eq!(input.max_concurrent_processing_tasks, DEFAULT_MAX_CONCURRENT_PROCESSING_TASKS);
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_requests() {
        let (service, _) = service();
        let mut empty = request(None);
        empty.manifest.clear();
        assert!(matches!(service.submit(empty).await, Err(AppError::Validation(_))));

        let mut zero = request(None);
        zero.options.max_concurrent_processing_tasks = Some(0);
        assert!(matches!(service.submit(zero).await, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_status_codes_follow_the_job_lifecycle() {
        let (service, tasks) = service();
        assert_eq!(service.get_status("nope").await.unwrap().status_code, STATUS_NOT_FOUND);

        service.submit(request(Some("job-a"))).await.unwrap();
        let running = service.get_status("job-a").await.unwrap();
        assert_eq!(running.status_code, STATUS_ACCEPTED);
        assert_eq!(running.progress.unwrap().files, 1);

        let leased = tasks.lease_next(ORCHESTRATOR_QUEUE).await.unwrap().unwrap();
        let result = ImportJobResult {
            job_id: "job-a".to_string(),
            status: ImportJobStatus::Succeeded,
            output: vec![],
            error: vec![],
            failed_tasks: vec![],
        };
        tasks
            .complete_task(
                &leased.task_id,
                &leased.run_id,
                &TaskResult::succeeded(serde_json::to_string(&result).unwrap()),
            )
            .await
            .unwrap();

        let done = service.get_status("job-a").await.unwrap();
        assert_eq!(done.status_code, STATUS_OK);
        assert_eq!(done.result.unwrap(), result);
        assert_eq!(service.cancel("job-a").await.unwrap().status_code, STATUS_CONFLICT);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let (service, _) = service();
        assert_eq!(service.cancel("nope").await.unwrap().status_code, STATUS_NOT_FOUND);

        service.submit(request(Some("job-a"))).await.unwrap();
        assert_eq!(service.cancel("job-a").await.unwrap().status_code, STATUS_ACCEPTED);

        let status = service.get_status("job-a").await.unwrap();
        assert_eq!(status.job_status, Some(TaskStatus::Canceled));
        assert_eq!(status.error.as_deref(), Some("Import job CANCELED"));
    }

    #[tokio::test]
    async fn test_failed_orchestrator_exposes_error_message() {
        let (service, tasks) = service();
        service.submit(request(Some("job-a"))).await.unwrap();
        let leased = tasks.lease_next(ORCHESTRATOR_QUEUE).await.unwrap().unwrap();
        tasks
            .complete_task(&leased.task_id, &leased.run_id, &TaskResult::failed(r#"{"error":"boom"}"#))
            .await
            .unwrap();

        let status = service.get_status("job-a").await.unwrap();
        assert_eq!(status.status_code, STATUS_OK);
        assert!(status.result.is_none());
        assert_eq!(status.error.as_deref(), Some("boom"));
    }
}
