// Composition root: wires adapters into the import services and runs the worker pools

use crate::settings::Settings;
use anyhow::{Context, Result};
use bulkimport_core::application::worker::constants::{ORCHESTRATOR_QUEUE, PROCESSING_QUEUE};
use bulkimport_core::application::{
    BlobImportErrorStoreFactory, CancellationToken, ImportDependencies, ImportJobService,
    ImportSettings, NdjsonResourceParser, RecoveryService, RetryPolicy, TaskFactory, Worker,
};
use bulkimport_core::port::{
    ContextUpdaterFactory, IntegrationDataStoreClient, SystemTimeProvider, TaskContextUpdaterFactory,
    TaskManager, TimeProvider, UuidProvider,
};
use bulkimport_infra_blob::ObjectStoreIntegrationClient;
use bulkimport_infra_sqlite::{
    create_pool, run_migrations, SqliteBulkImporter, SqliteSequenceIdGenerator, SqliteTaskManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Services {
    pub task_manager: Arc<dyn TaskManager>,
    pub store: Arc<ObjectStoreIntegrationClient>,
    pub jobs: ImportJobService,
    pub recovery: RecoveryService,
    factory: Arc<TaskFactory>,
    context_updaters: Arc<dyn ContextUpdaterFactory>,
    settings: Settings,
}

impl Services {
    pub async fn build(settings: &Settings) -> Result<Self> {
        if let Some(parent) = settings.database_file().as_deref().and_then(|f| f.parent()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }

        let database_url = settings.database_url();
        info!(database_url = %database_url, "Initializing database...");
        let pool = create_pool(&database_url)
            .await
            .map_err(|e| anyhow::anyhow!("DB pool creation failed: {}", e))?;
        run_migrations(&pool)
            .await
            .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;

        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let ids = Arc::new(UuidProvider);

        let task_manager: Arc<dyn TaskManager> = Arc::new(SqliteTaskManager::new(
            pool.clone(),
            time_provider.clone(),
            ids.clone(),
        ));
        let store = Arc::new(
            settings
                .storage_backend()
                .build()
                .map_err(|e| anyhow::anyhow!("Storage initialization failed: {}", e))?,
        );
        let client: Arc<dyn IntegrationDataStoreClient> = store.clone();

        let deps = ImportDependencies {
            task_manager: task_manager.clone(),
            store: client.clone(),
            bulk_import: Arc::new(SqliteBulkImporter::new(pool.clone(), time_provider.clone())),
            sequence: Arc::new(SqliteSequenceIdGenerator::new(pool)),
            error_stores: Arc::new(BlobImportErrorStoreFactory::new(client, ids.clone())),
            parser: Arc::new(NdjsonResourceParser),
            settings: ImportSettings {
                batch_size: settings.import.batch_size,
                poll_interval: settings.poll_interval(),
                load_retry: RetryPolicy::store_operation(),
            },
        };

        let jobs = ImportJobService::new(task_manager.clone(), ids).with_defaults(
            settings.import.max_concurrent_processing_tasks,
            settings.import.error_container.clone(),
        );
        let recovery = RecoveryService::new(
            task_manager.clone(),
            time_provider,
            Some(settings.recovery_window_ms),
        );

        Ok(Self {
            context_updaters: Arc::new(TaskContextUpdaterFactory::new(task_manager.clone())),
            factory: Arc::new(TaskFactory::for_import(deps)),
            task_manager,
            store,
            jobs,
            recovery,
            settings: settings.clone(),
        })
    }

    fn spawn_worker(&self, queue: &str, shutdown: CancellationToken) -> JoinHandle<()> {
        let worker = Worker::new(
            queue,
            self.task_manager.clone(),
            self.factory.clone(),
            self.context_updaters.clone(),
        )
        .with_heartbeat_interval(self.settings.cancel_poll_interval());

        tokio::spawn(async move {
            if let Err(e) = worker.run(shutdown).await {
                error!(error = %e, "Worker failed");
            }
        })
    }

    /// Requeue orphaned tasks, then run both worker pools until `shutdown` fires
    pub async fn serve(&self, mut shutdown: CancellationToken) -> Result<()> {
        info!("Running crash recovery...");
        match self.recovery.recover_orphaned_tasks().await {
            Ok(count) => info!(recovered_tasks = count, "Crash recovery completed"),
            Err(e) => error!(error = %e, "Crash recovery failed"),
        }

        let mut handles = Vec::new();
        for _ in 0..self.settings.workers.orchestrator {
            handles.push(self.spawn_worker(ORCHESTRATOR_QUEUE, shutdown.clone()));
        }
        for _ in 0..self.settings.workers.processing {
            handles.push(self.spawn_worker(PROCESSING_QUEUE, shutdown.clone()));
        }
        info!(
            orchestrator_workers = self.settings.workers.orchestrator,
            processing_workers = self.settings.workers.processing,
            "System ready. Waiting for import jobs..."
        );

        shutdown.canceled().await;
        info!("Shutdown requested, waiting for workers...");

        for handle in handles {
            if tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("Worker did not stop in time; its task will be recovered on next start");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::environment;
    use bulkimport_core::application::cancellation_pair;
    use bulkimport_core::application::import::ImportRequest;
    use bulkimport_core::domain::{ImportJobStatus, ManifestEntry, TaskStatus};
    use std::collections::HashMap;

    fn memory_settings() -> Settings {
        let vars: HashMap<String, String> = [
            ("BULKIMPORT_DATABASE_PATH", "sqlite::memory:"),
            ("BULKIMPORT_STORAGE__KIND", "memory"),
            ("BULKIMPORT_WORKERS__PROCESSING", "2"),
            ("BULKIMPORT_IMPORT__POLL_INTERVAL_MS", "20"),
            ("BULKIMPORT_IMPORT__CANCEL_POLL_INTERVAL_MS", "20"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Settings::load_from(None, environment().source(Some(vars))).unwrap()
    }

    #[tokio::test]
    async fn test_serve_runs_an_import_to_completion() {
        let services = Services::build(&memory_settings()).await.unwrap();
        let body = (1..=5)
            .map(|i| format!(r#"{{"resourceType":"Patient","id":"p{}"}}"#, i))
            .collect::<Vec<_>>()
            .join("\n");
        let uri = "memory:///source/patients.ndjson";
        services.store.put_object(uri, body.into_bytes()).await.unwrap();

        let job_id = services
            .jobs
            .submit(ImportRequest {
                job_id: Some("job-1".to_string()),
                manifest: vec![ManifestEntry::new("Patient", uri)],
                options: Default::default(),
            })
            .await
            .unwrap();

        let (source, token) = cancellation_pair();
        let services = Arc::new(services);
        let server = {
            let services = services.clone();
            tokio::spawn(async move { services.serve(token).await })
        };

        let mut response = services.jobs.get_status(&job_id).await.unwrap();
        for _ in 0..500 {
            if response.job_status.map_or(false, |s| s.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            response = services.jobs.get_status(&job_id).await.unwrap();
        }

        source.cancel();
        server.await.unwrap().unwrap();

        assert_eq!(response.job_status, Some(TaskStatus::Succeeded));
        let result = response.result.unwrap();
        assert_eq!(result.status, ImportJobStatus::Succeeded);
        assert_eq!(result.total_succeeded(), 5);
    }
}
