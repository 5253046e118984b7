// Error Store over the remote object store

use crate::application::import::store_error;
use crate::domain::ImportErrorRecord;
use crate::error::Result;
use crate::port::{IdProvider, ImportErrorStore, ImportErrorStoreFactory, IntegrationDataStoreClient};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// NDJSON error file grown one committed block per upload
pub struct BlobImportErrorStore {
    client: Arc<dyn IntegrationDataStoreClient>,
    block_ids: Arc<dyn IdProvider>,
    uri: String,
}

#[async_trait]
impl ImportErrorStore for BlobImportErrorStore {
    async fn upload_errors(&self, records: &[ImportErrorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut body = Vec::new();
        for record in records {
            serde_json::to_writer(&mut body, record)?;
            body.push(b'\n');
        }

        let block_id = self.block_ids.generate_id();
        self.client
            .upload_block(&self.uri, Bytes::from(body), &block_id)
            .await
            .map_err(store_error)?;
        self.client
            .append_commit(&self.uri, std::slice::from_ref(&block_id))
            .await
            .map_err(store_error)?;

        debug!(uri = %self.uri, block_id = %block_id, count = %records.len(), "Appended error block");
        Ok(())
    }

    fn error_file_location(&self) -> &str {
        &self.uri
    }
}

pub struct BlobImportErrorStoreFactory {
    client: Arc<dyn IntegrationDataStoreClient>,
    block_ids: Arc<dyn IdProvider>,
}

impl BlobImportErrorStoreFactory {
    pub fn new(client: Arc<dyn IntegrationDataStoreClient>, block_ids: Arc<dyn IdProvider>) -> Self {
        Self { client, block_ids }
    }
}

#[async_trait]
impl ImportErrorStoreFactory for BlobImportErrorStoreFactory {
    async fn initialize(&self, container: &str, file_name: &str) -> Result<Box<dyn ImportErrorStore>> {
        let uri = self
            .client
            .prepare_resource(container, file_name)
            .await
            .map_err(store_error)?;
        Ok(Box::new(BlobImportErrorStore {
            client: Arc::clone(&self.client),
            block_ids: Arc::clone(&self.block_ids),
            uri,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::integration_store::mocks::InMemoryIntegrationStore;
    use crate::port::integration_store::status;
    use crate::error::AppError;

    fn factory(store: Arc<InMemoryIntegrationStore>) -> BlobImportErrorStoreFactory {
        BlobImportErrorStoreFactory::new(store, Arc::new(SequentialIdProvider::new("b")))
    }

    #[tokio::test]
    async fn test_uploads_grow_the_file_in_order() {
        let store = Arc::new(InMemoryIntegrationStore::new());
        let errors = factory(store.clone())
            .initialize("errors", "job-1/0_Patient.ndjson")
            .await
            .unwrap();

        errors
            .upload_errors(&[ImportErrorRecord::new(3, "bad json")])
            .await
            .unwrap();
        errors.upload_errors(&[]).await.unwrap();
        errors
            .upload_errors(&[ImportErrorRecord::new(9, "missing id")])
            .await
            .unwrap();

        let uri = errors.error_file_location();
        assert_eq!(uri, "memory:///errors/job-1/0_Patient.ndjson");
        assert_eq!(store.committed_blocks(uri), vec!["b-1".to_string(), "b-2".to_string()]);
        assert_eq!(
            store.object_text(uri).unwrap(),
            "{\"index\":3,\"reason\":\"bad json\"}\n{\"index\":9,\"reason\":\"missing id\"}\n"
        );
    }

    #[tokio::test]
    async fn test_transient_failure_maps_to_retriable() {
        let store = Arc::new(InMemoryIntegrationStore::new());
        let errors = factory(store.clone()).initialize("errors", "f").await.unwrap();
        store.inject_faults("append_commit", &[status::SERVICE_UNAVAILABLE]);

        let err = errors
            .upload_errors(&[ImportErrorRecord::new(1, "x")])
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_permission_failure_is_integration_error() {
        let store = Arc::new(InMemoryIntegrationStore::new());
        store.inject_faults("prepare_resource", &[status::FORBIDDEN]);

        let err = factory(store).initialize("errors", "f").await.err().unwrap();
        assert!(matches!(err, AppError::Integration(e) if e.status_code == 403));
    }
}
