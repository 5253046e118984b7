// Orchestrator Task: plans one processing task per manifest entry and supervises them
//
// Planning -> Dispatching -> Monitoring -> Finalizing
//
// Children are created through the task queue with an idempotency key derived
// from (job id, manifest index), so re-planning after a crash finds the child
// created by the previous run instead of creating a second one.

use crate::application::cancellation::CancellationToken;
use crate::application::import::{is_transient_load_error, store_error, ImportDependencies};
use crate::application::task::Task;
use crate::domain::{
    decode, decode_or_default, encode, FailedTaskEntry, ImportErrorEntry, ImportJobResult,
    ImportJobStatus, ImportOutputEntry, IndexScope, NewTask, OrchestratorContext,
    OrchestratorInput, OrchestratorStage, ProcessingInput, ProcessingProgress, ProcessingResult,
    TaskId, TaskRecord, TaskResult, TaskStatus, TaskTypeId, ORCHESTRATOR_TASK_TYPE_ID,
    PROCESSING_TASK_TYPE_ID, SCHEMA_VERSION,
};
use crate::error::Result;
use crate::port::ContextUpdater;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct OrchestratorTask {
    task_id: TaskId,
    input: OrchestratorInput,
    context: OrchestratorContext,
    deps: Arc<ImportDependencies>,
    context_updater: Arc<dyn ContextUpdater>,
    /// No requeue follows this run, whatever the error
    final_attempt: bool,
}

enum Supervision {
    AllChildrenTerminal,
    Canceled,
}

impl OrchestratorTask {
    pub fn from_record(
        record: &TaskRecord,
        deps: Arc<ImportDependencies>,
        context_updater: Arc<dyn ContextUpdater>,
    ) -> Result<Self> {
        let input: OrchestratorInput = decode(&record.input_data)?;
        let context: OrchestratorContext = decode_or_default(record.context.as_deref())?;
        Ok(Self {
            task_id: record.task_id.clone(),
            input,
            context,
            deps,
            context_updater,
            final_attempt: record.retry_count >= record.max_retry_count,
        })
    }

    fn scope(&self) -> IndexScope {
        IndexScope::for_job(&self.input.job_id)
    }

    async fn persist(&self, ctx: &OrchestratorContext) -> Result<()> {
        self.context_updater.update_context(&encode(ctx)?).await
    }

    async fn set_stage(&self, ctx: &mut OrchestratorContext, stage: OrchestratorStage) -> Result<()> {
        if ctx.stage != stage {
            info!(job_id = %self.input.job_id, from = ?ctx.stage, to = ?stage, "Orchestrator stage change");
            ctx.stage = stage;
            self.persist(ctx).await?;
        }
        Ok(())
    }

    async fn supervise(
        &self,
        ctx: &mut OrchestratorContext,
        cancel: &mut CancellationToken,
    ) -> Result<Supervision> {
        if !ctx.indexes_suspended {
            let suspended = self.deps.bulk_import.suspend_indexes(&self.scope()).await?;
            info!(job_id = %self.input.job_id, count = %suspended.len(), "Secondary indexes suspended");
            ctx.indexes_suspended = true;
            self.persist(ctx).await?;
        }

        let manifest_len = self.input.manifest.len();
        let max_concurrent = self.input.max_concurrent_processing_tasks.max(1);
        loop {
            if cancel.is_canceled() {
                self.cancel_children(ctx).await?;
                return Ok(Supervision::Canceled);
            }

            while !ctx.all_created(manifest_len) && ctx.pending_task_ids().len() < max_concurrent {
                self.set_stage(ctx, OrchestratorStage::Dispatching).await?;
                self.create_child(ctx).await?;
            }
            if ctx.all_created(manifest_len) {
                self.set_stage(ctx, OrchestratorStage::Monitoring).await?;
            }

            self.poll_children(ctx).await?;
            if ctx.all_created(manifest_len) && ctx.pending_task_ids().is_empty() {
                return Ok(Supervision::AllChildrenTerminal);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.deps.settings.poll_interval) => {}
                _ = cancel.canceled() => {}
            }
        }
    }

    /// Create (or find) the child for the next manifest entry and record it
    async fn create_child(&self, ctx: &mut OrchestratorContext) -> Result<()> {
        let index = ctx.next_manifest_index;
        if ctx.created_tasks.contains_key(&index) {
            ctx.next_manifest_index += 1;
            return Ok(());
        }
        let entry = &self.input.manifest[index];

        // Every record takes at least one byte, so length + 1 ids always suffice
        let length = match self.deps.store.get_properties(&entry.source_uri).await {
            Ok(properties) => properties.length,
            Err(e) if e.is_transient() => return Err(store_error(e)),
            Err(e) => {
                // The child fails on open and reports the file as a failed task
                warn!(job_id = %self.input.job_id, source_uri = %entry.source_uri, error = %e, "Source file not readable");
                0
            }
        };
        let range = self.deps.sequence.reserve(length + 1).await?;

        let input = ProcessingInput {
            schema_version: SCHEMA_VERSION,
            job_id: self.input.job_id.clone(),
            manifest_index: index,
            resource_type: entry.resource_type.clone(),
            source_uri: entry.source_uri.clone(),
            begin_sequence_id: range.begin,
            end_sequence_id: range.end,
            error_container: self.input.error_container.clone(),
        };
        let new_task = NewTask::new(
            self.input.processing_queue.clone(),
            PROCESSING_TASK_TYPE_ID,
            encode(&input)?,
        )
        .with_idempotency_key(format!("{}:{}", self.input.job_id, index))
        .with_parent(self.task_id.clone());

        let child = self.deps.task_manager.create_task(new_task).await?;
        info!(
            job_id = %self.input.job_id,
            manifest_index = %index,
            child_task_id = %child.task_id,
            begin = %range.begin,
            end = %range.end,
            "Processing task created"
        );

        ctx.created_tasks.insert(index, child.task_id);
        ctx.next_manifest_index = index + 1;
        self.persist(ctx).await
    }

    /// Move terminal children out of the pending set
    async fn poll_children(&self, ctx: &mut OrchestratorContext) -> Result<()> {
        let pending = ctx.pending_task_ids();
        if pending.is_empty() {
            return Ok(());
        }
        let children = self.deps.task_manager.get_tasks(&pending).await?;

        let mut changed = false;
        for child_id in &pending {
            let Some(child) = children.iter().find(|c| &c.task_id == child_id) else {
                warn!(job_id = %self.input.job_id, child_task_id = %child_id, "Child task record missing");
                ctx.failed_task_ids.insert(child_id.clone());
                ctx.child_errors
                    .insert(child_id.clone(), "Task record missing".to_string());
                changed = true;
                continue;
            };
            if !child.status.is_terminal() {
                continue;
            }

            if let Some(result) = self.child_result(child) {
                ctx.child_results.insert(child.task_id.clone(), result);
            }
            if child.status == TaskStatus::Succeeded {
                ctx.completed_task_ids.insert(child.task_id.clone());
            } else {
                let reason = failure_reason(child);
                warn!(
                    job_id = %self.input.job_id,
                    child_task_id = %child.task_id,
                    status = %child.status,
                    reason = %reason,
                    "Processing task did not succeed"
                );
                ctx.failed_task_ids.insert(child.task_id.clone());
                ctx.child_errors.insert(child.task_id.clone(), reason);
            }
            changed = true;
        }

        if changed {
            self.persist(ctx).await?;
        }
        Ok(())
    }

    /// The child's reported result, or counts recovered from its last checkpoint
    fn child_result(&self, child: &TaskRecord) -> Option<ProcessingResult> {
        if let Some(result) = child
            .result
            .as_deref()
            .and_then(|raw| serde_json::from_str::<ProcessingResult>(raw).ok())
        {
            return Some(result);
        }
        let progress: ProcessingProgress = decode(child.context.as_deref()?).ok()?;
        let input: ProcessingInput = decode(&child.input_data).ok()?;
        Some(ProcessingResult {
            resource_type: input.resource_type,
            source_uri: input.source_uri,
            succeeded_count: progress.succeeded_count,
            failed_count: progress.failed_count,
            error_log_location: progress.error_log_location,
        })
    }

    async fn cancel_children(&self, ctx: &mut OrchestratorContext) -> Result<()> {
        let pending = ctx.pending_task_ids();
        info!(job_id = %self.input.job_id, pending = %pending.len(), "Canceling processing tasks");
        for child_id in &pending {
            self.deps.task_manager.cancel_task(child_id).await?;
        }

        // Running children stop at their next batch boundary
        loop {
            self.poll_children(ctx).await?;
            if ctx.pending_task_ids().is_empty() {
                return Ok(());
            }
            tokio::time::sleep(self.deps.settings.poll_interval).await;
        }
    }

    async fn restore_indexes(&self, ctx: &mut OrchestratorContext) -> Result<()> {
        let bulk = &self.deps.bulk_import;
        let scope = self.scope();
        let restored = self
            .deps
            .settings
            .load_retry
            .run("restore_indexes", is_transient_load_error, || bulk.restore_indexes(&scope))
            .await?;
        info!(job_id = %self.input.job_id, count = %restored.len(), "Secondary indexes restored");
        if ctx.indexes_suspended {
            ctx.indexes_suspended = false;
            self.persist(ctx).await?;
        }
        Ok(())
    }

    /// The job fails for good: stop the children, then bring the indexes back.
    /// Both steps are best effort so the original error is what gets reported.
    async fn abandon(&self, ctx: &mut OrchestratorContext) {
        if let Err(e) = self.cancel_children(ctx).await {
            error!(job_id = %self.input.job_id, error = %e, "Canceling processing tasks after failure failed");
        }
        // Suspension may have dropped indexes before it could be recorded
        if let Err(e) = self.restore_indexes(ctx).await {
            error!(job_id = %self.input.job_id, error = %e, "Index restore after failure failed");
        }
    }

    async fn finalize(&self, ctx: &mut OrchestratorContext, canceled: bool) -> Result<TaskResult> {
        self.set_stage(ctx, OrchestratorStage::Finalizing).await?;
        self.restore_indexes(ctx).await?;

        let mut result = self.aggregate(ctx);
        if !canceled {
            result.status = self.input.failure_policy.evaluate(
                result.total_succeeded(),
                result.total_failed(),
                result.failed_tasks.len(),
            );
        }
        info!(
            job_id = %self.input.job_id,
            status = ?result.status,
            succeeded = %result.total_succeeded(),
            failed = %result.total_failed(),
            failed_tasks = %result.failed_tasks.len(),
            "Import job finished"
        );

        let data = serde_json::to_string(&result)?;
        Ok(match result.status {
            ImportJobStatus::Succeeded => TaskResult::succeeded(data),
            ImportJobStatus::Failed => TaskResult::failed(data),
            ImportJobStatus::Canceled => TaskResult::canceled(data),
        })
    }

    fn aggregate(&self, ctx: &OrchestratorContext) -> ImportJobResult {
        let mut result = ImportJobResult {
            job_id: self.input.job_id.clone(),
            status: ImportJobStatus::Canceled,
            output: Vec::new(),
            error: Vec::new(),
            failed_tasks: Vec::new(),
        };

        for (index, task_id) in &ctx.created_tasks {
            let Some(entry) = self.input.manifest.get(*index) else {
                continue;
            };
            if let Some(child) = ctx.child_results.get(task_id) {
                result.output.push(ImportOutputEntry {
                    resource_type: entry.resource_type.clone(),
                    count: child.succeeded_count,
                    input_url: entry.source_uri.clone(),
                });
                if child.failed_count > 0 {
                    result.error.push(ImportErrorEntry {
                        resource_type: entry.resource_type.clone(),
                        count: child.failed_count,
                        input_url: entry.source_uri.clone(),
                        url: child.error_log_location.clone(),
                    });
                }
            }
            if ctx.failed_task_ids.contains(task_id) {
                result.failed_tasks.push(FailedTaskEntry {
                    input_url: entry.source_uri.clone(),
                    reason: ctx
                        .child_errors
                        .get(task_id)
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string()),
                });
            }
        }
        result
    }
}

/// `{"error": "..."}` written by the worker, else the status itself
fn failure_reason(child: &TaskRecord) -> String {
    child
        .result
        .as_deref()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| child.status.to_string())
}

#[async_trait]
impl Task for OrchestratorTask {
    fn task_type_id(&self) -> TaskTypeId {
        ORCHESTRATOR_TASK_TYPE_ID
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<TaskResult> {
        let mut cancel = cancel;
        let mut ctx = self.context.clone();
        info!(
            job_id = %self.input.job_id,
            files = %self.input.manifest.len(),
            stage = ?ctx.stage,
            "Orchestrating import job"
        );

        match self.supervise(&mut ctx, &mut cancel).await {
            Ok(Supervision::AllChildrenTerminal) => self.finalize(&mut ctx, false).await,
            Ok(Supervision::Canceled) => self.finalize(&mut ctx, true).await,
            // The requeued run resumes the same job, indexes stay suspended meanwhile
            Err(e) if e.is_retriable() && !self.final_attempt => Err(e),
            Err(e) => {
                warn!(job_id = %self.input.job_id, error = %e, "Import job failed, cleaning up");
                self.abandon(&mut ctx).await;
                Err(e)
            }
        }
    }
}
