//! Shared wiring for the end-to-end tests: SQLite queue and resource store on a
//! temp file, in-memory object store, real workers.

#![allow(dead_code)]

use bulkimport_core::application::import::ImportRequest;
use bulkimport_core::application::worker::constants::{ORCHESTRATOR_QUEUE, PROCESSING_QUEUE};
use bulkimport_core::application::{
    cancellation_pair, BlobImportErrorStoreFactory, CancellationSource, ImportDependencies,
    ImportJobService, ImportSettings, NdjsonResourceParser, RetryPolicy, TaskFactory, Worker,
};
use bulkimport_core::domain::{ManifestEntry, TaskRecord};
use bulkimport_core::port::{
    ContextUpdaterFactory, IntegrationDataStoreClient, SystemTimeProvider,
    TaskContextUpdaterFactory, TaskManager, TimeProvider, UuidProvider,
};
use bulkimport_infra_blob::ObjectStoreIntegrationClient;
use bulkimport_infra_sqlite::{
    create_pool, run_migrations, SqliteBulkImporter, SqliteSequenceIdGenerator, SqliteTaskManager,
};
use futures::TryStreamExt;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub struct Harness {
    pub pool: SqlitePool,
    pub task_manager: Arc<SqliteTaskManager>,
    pub store: Arc<ObjectStoreIntegrationClient>,
    pub bulk: Arc<SqliteBulkImporter>,
    pub jobs: ImportJobService,
    factory: Arc<TaskFactory>,
    context_updaters: Arc<dyn ContextUpdaterFactory>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new(batch_size: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("import.db").display());
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let ids = Arc::new(UuidProvider);
        let task_manager = Arc::new(SqliteTaskManager::new(pool.clone(), time.clone(), ids.clone()));
        let store = Arc::new(ObjectStoreIntegrationClient::in_memory().unwrap());
        let client: Arc<dyn IntegrationDataStoreClient> = store.clone();
        let bulk = Arc::new(SqliteBulkImporter::new(pool.clone(), time));

        let deps = ImportDependencies {
            task_manager: task_manager.clone(),
            store: client.clone(),
            bulk_import: bulk.clone(),
            sequence: Arc::new(SqliteSequenceIdGenerator::new(pool.clone())),
            error_stores: Arc::new(BlobImportErrorStoreFactory::new(client, ids.clone())),
            parser: Arc::new(NdjsonResourceParser),
            settings: ImportSettings {
                batch_size,
                poll_interval: Duration::from_millis(20),
                load_retry: RetryPolicy::linear(1, Duration::from_millis(10)),
            },
        };

        Self {
            jobs: ImportJobService::new(task_manager.clone(), ids).with_defaults(4, "import-errors"),
            context_updaters: Arc::new(TaskContextUpdaterFactory::new(task_manager.clone())),
            factory: Arc::new(TaskFactory::for_import(deps)),
            pool,
            task_manager,
            store,
            bulk,
            _dir: dir,
        }
    }

    pub fn spawn_workers(&self, orchestrators: usize, processors: usize) -> Workers {
        let (source, token) = cancellation_pair();
        let mut handles = Vec::new();
        let queues = std::iter::repeat(ORCHESTRATOR_QUEUE)
            .take(orchestrators)
            .chain(std::iter::repeat(PROCESSING_QUEUE).take(processors));
        for queue in queues {
            let worker = Worker::new(
                queue,
                self.task_manager.clone(),
                self.factory.clone(),
                self.context_updaters.clone(),
            )
            .with_heartbeat_interval(Duration::from_millis(20));
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                worker.run(token).await.unwrap();
            }));
        }
        Workers { source, handles }
    }

    pub async fn put_source(&self, name: &str, body: &str) -> String {
        let uri = format!("memory:///source/{}", name);
        self.store.put_object(&uri, body.as_bytes().to_vec()).await.unwrap();
        uri
    }

    pub async fn submit(&self, job_id: &str, manifest: Vec<ManifestEntry>) -> String {
        self.jobs
            .submit(ImportRequest {
                job_id: Some(job_id.to_string()),
                manifest,
                options: Default::default(),
            })
            .await
            .unwrap()
    }

    /// Poll the task record until it is terminal
    pub async fn wait_terminal(&self, task_id: &str) -> TaskRecord {
        for _ in 0..1500 {
            let record = self.task_manager.get_task(task_id).await.unwrap().unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {} did not finish", task_id);
    }

    pub async fn job_task(&self, job_id: &str) -> TaskRecord {
        self.task_manager
            .find_by_idempotency_key(&format!("import:{}", job_id))
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn read_object(&self, uri: &str) -> String {
        let chunks: Vec<_> = self
            .store
            .download(uri, 0)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        String::from_utf8(chunks.concat()).unwrap()
    }

    pub async fn count(&self, sql: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(sql).fetch_one(&self.pool).await.unwrap()
    }
}

pub struct Workers {
    source: CancellationSource,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    pub async fn stop(self) {
        self.source.cancel();
        for handle in self.handles {
            handle.await.unwrap();
        }
    }
}

pub fn patient_line(id: usize) -> String {
    format!(
        r#"{{"resourceType":"Patient","id":"p{}","identifier":[{{"system":"urn:mrn","value":"{}"}}],"name":[{{"family":"Doe{}"}}]}}"#,
        id, id, id
    )
}

/// `count` lines; the 1-based lines in `malformed` are broken JSON
pub fn patient_file(count: usize, malformed: &[usize]) -> String {
    let mut out = String::new();
    for i in 1..=count {
        if malformed.contains(&i) {
            out.push_str("{\"resourceType\":\"Patient\",");
        } else {
            out.push_str(&patient_line(i));
        }
        out.push('\n');
    }
    out
}
