// Processing Task: streams one source file into the bulk loader
//
// Resuming -> Streaming -> Committing (loop) -> Finalizing
//
// The checkpoint is written only after a batch and its error records are
// committed, so a crash can only lose an uncommitted tail. A batch that
// committed without its checkpoint is removed on resume via `clean_range`
// and loaded again under the same surrogate ids.

use crate::application::cancellation::CancellationToken;
use crate::application::import::{is_transient_load_error, store_error, ImportDependencies};
use crate::application::task::Task;
use crate::domain::{
    decode, decode_or_default, encode, DomainError, ImportErrorRecord, ImportResource,
    ProcessingInput, ProcessingProgress, ProcessingResult, TaskId, TaskOutcome, TaskRecord,
    TaskResult, TaskTypeId, PROCESSING_TASK_TYPE_ID,
};
use crate::error::Result;
use crate::port::{ContextUpdater, ImportErrorStore};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ProcessingTask {
    task_id: TaskId,
    input: ProcessingInput,
    progress: ProcessingProgress,
    deps: Arc<ImportDependencies>,
    context_updater: Arc<dyn ContextUpdater>,
}

/// Work accumulated since the last checkpoint
struct PendingBatch {
    resources: Vec<ImportResource>,
    errors: Vec<ImportErrorRecord>,
    bytes: u64,
    lines: u64,
    next_sequence_id: i64,
}

impl PendingBatch {
    fn new(next_sequence_id: i64) -> Self {
        Self {
            resources: Vec::new(),
            errors: Vec::new(),
            bytes: 0,
            lines: 0,
            next_sequence_id,
        }
    }

    fn is_full(&self, batch_size: usize) -> bool {
        self.resources.len() >= batch_size || self.errors.len() >= batch_size
    }

    fn clear(&mut self) {
        self.resources.clear();
        self.errors.clear();
        self.bytes = 0;
        self.lines = 0;
    }
}

impl ProcessingTask {
    pub fn from_record(
        record: &TaskRecord,
        deps: Arc<ImportDependencies>,
        context_updater: Arc<dyn ContextUpdater>,
    ) -> Result<Self> {
        let input: ProcessingInput = decode(&record.input_data)?;
        let progress: ProcessingProgress = decode_or_default(record.context.as_deref())?;
        Ok(Self {
            task_id: record.task_id.clone(),
            input,
            progress,
            deps,
            context_updater,
        })
    }

    /// Remove rows written past the checkpoint by a run that died before persisting it
    async fn discard_uncommitted(&self, cursor: i64) -> Result<()> {
        let bulk = &self.deps.bulk_import;
        let end = self.input.end_sequence_id;
        let removed = self
            .deps
            .settings
            .load_retry
            .run("clean_range", is_transient_load_error, || bulk.clean_range(cursor, end))
            .await?;
        if removed > 0 {
            warn!(
                task_id = %self.task_id,
                removed = %removed,
                begin = %cursor,
                end = %end,
                "Removed rows committed after the last checkpoint"
            );
        }
        Ok(())
    }

    fn accept_line(
        &self,
        raw: &[u8],
        byte_len: u64,
        progress: &ProcessingProgress,
        pending: &mut PendingBatch,
    ) -> Result<()> {
        pending.bytes += byte_len;
        pending.lines += 1;
        let index = progress.lines_consumed + pending.lines;

        let text = match std::str::from_utf8(raw) {
            Ok(text) => text.trim(),
            Err(e) => {
                pending
                    .errors
                    .push(ImportErrorRecord::new(index, format!("Invalid UTF-8: {}", e)));
                return Ok(());
            }
        };
        if text.is_empty() {
            return Ok(());
        }

        match self.deps.parser.parse(&self.input.resource_type, text) {
            Ok(resource) => {
                if pending.next_sequence_id >= self.input.end_sequence_id {
                    return Err(DomainError::SequenceRangeExhausted {
                        begin: self.input.begin_sequence_id,
                        end: self.input.end_sequence_id,
                        next: pending.next_sequence_id,
                    }
                    .into());
                }
                pending.resources.push(ImportResource {
                    surrogate_id: pending.next_sequence_id,
                    line_index: index,
                    resource,
                });
                pending.next_sequence_id += 1;
            }
            Err(reason) => pending.errors.push(ImportErrorRecord::new(index, reason)),
        }
        Ok(())
    }

    /// Load, record errors, then checkpoint. The order is what makes resume safe.
    async fn commit(
        &self,
        progress: &mut ProcessingProgress,
        pending: &mut PendingBatch,
        errors: &dyn ImportErrorStore,
    ) -> Result<()> {
        let loaded = if pending.resources.is_empty() {
            0
        } else {
            let bulk = &self.deps.bulk_import;
            let batch = &pending.resources;
            self.deps
                .settings
                .load_retry
                .run("load_batch", is_transient_load_error, || bulk.load_batch(batch))
                .await?
        };
        errors.upload_errors(&pending.errors).await?;

        progress.bytes_consumed += pending.bytes;
        progress.lines_consumed += pending.lines;
        progress.succeeded_count += loaded;
        progress.failed_count += pending.errors.len() as u64;
        progress.next_sequence_id = pending.next_sequence_id;
        self.context_updater.update_context(&encode(progress)?).await?;

        debug!(
            task_id = %self.task_id,
            lines = %progress.lines_consumed,
            succeeded = %progress.succeeded_count,
            failed = %progress.failed_count,
            "Batch committed"
        );
        pending.clear();
        Ok(())
    }

    fn finish(&self, outcome: TaskOutcome, progress: &ProcessingProgress) -> Result<TaskResult> {
        let result = ProcessingResult {
            resource_type: self.input.resource_type.clone(),
            source_uri: self.input.source_uri.clone(),
            succeeded_count: progress.succeeded_count,
            failed_count: progress.failed_count,
            error_log_location: progress.error_log_location.clone(),
        };
        Ok(TaskResult {
            outcome,
            result_data: serde_json::to_string(&result)?,
        })
    }
}

#[async_trait]
impl Task for ProcessingTask {
    fn task_type_id(&self) -> TaskTypeId {
        PROCESSING_TASK_TYPE_ID
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<TaskResult> {
        let mut progress = self.progress.clone();
        let cursor = progress.next_sequence_id.max(self.input.begin_sequence_id);
        if cursor > self.input.end_sequence_id {
            return Err(DomainError::SequenceRangeExhausted {
                begin: self.input.begin_sequence_id,
                end: self.input.end_sequence_id,
                next: cursor,
            }
            .into());
        }

        self.discard_uncommitted(cursor).await?;
        if cancel.is_canceled() {
            info!(task_id = %self.task_id, "Canceled before streaming");
            return self.finish(TaskOutcome::Canceled, &progress);
        }

        let errors = self
            .deps
            .error_stores
            .initialize(&self.input.error_container, &self.input.error_file_name())
            .await?;
        progress.error_log_location = Some(errors.error_file_location().to_string());

        info!(
            task_id = %self.task_id,
            source_uri = %self.input.source_uri,
            offset = %progress.bytes_consumed,
            lines = %progress.lines_consumed,
            "Streaming source file"
        );
        let mut stream = self
            .deps
            .store
            .download(&self.input.source_uri, progress.bytes_consumed)
            .await
            .map_err(store_error)?;

        let batch_size = self.deps.settings.batch_size.max(1);
        let mut pending = PendingBatch::new(cursor);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(store_error)?;
            buffer.extend_from_slice(&chunk);

            let mut start = 0;
            while let Some(pos) = buffer[start..].iter().position(|b| *b == b'\n') {
                let end = start + pos;
                self.accept_line(&buffer[start..end], (pos + 1) as u64, &progress, &mut pending)?;
                start = end + 1;

                if pending.is_full(batch_size) {
                    self.commit(&mut progress, &mut pending, errors.as_ref()).await?;
                    if cancel.is_canceled() {
                        info!(
                            task_id = %self.task_id,
                            lines = %progress.lines_consumed,
                            "Canceled at batch boundary"
                        );
                        return self.finish(TaskOutcome::Canceled, &progress);
                    }
                }
            }
            buffer.drain(..start);
        }

        // Last line without a trailing newline
        if !buffer.is_empty() {
            self.accept_line(&buffer, buffer.len() as u64, &progress, &mut pending)?;
        }
        if pending.lines > 0 {
            self.commit(&mut progress, &mut pending, errors.as_ref()).await?;
        }

        info!(
            task_id = %self.task_id,
            succeeded = %progress.succeeded_count,
            failed = %progress.failed_count,
            "Source file processed"
        );
        self.finish(TaskOutcome::Succeeded, &progress)
    }
}
