// Object store backend selection

use crate::client::ObjectStoreIntegrationClient;
use crate::error::map_store_error;
use bulkimport_core::port::integration_store::status;
use bulkimport_core::port::{IntegrationDataStoreError, StoreResult};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Where source files and error files live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Process-local store (tests, demos)
    Memory,
    /// Directory on the local filesystem, addressed as `file:///<relative path>`
    Local { root: PathBuf },
    /// S3 or an S3-compatible endpoint, addressed as `s3://<bucket>/<key>`
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
    },
}

impl StorageBackend {
    pub fn build(&self) -> StoreResult<ObjectStoreIntegrationClient> {
        match self {
            StorageBackend::Memory => {
                info!("Storage: in-memory backend");
                ObjectStoreIntegrationClient::new(Arc::new(InMemory::new()), "memory:///")
            }
            StorageBackend::Local { root } => {
                std::fs::create_dir_all(root).map_err(|e| {
                    IntegrationDataStoreError::new(
                        format!("Cannot create storage root {}: {}", root.display(), e),
                        status::BAD_REQUEST,
                    )
                })?;
                let store = LocalFileSystem::new_with_prefix(root).map_err(map_store_error)?;
                info!("Storage: local backend at {}", root.display());
                ObjectStoreIntegrationClient::new(Arc::new(store), "file:///")
            }
            StorageBackend::S3 {
                bucket,
                region,
                endpoint,
            } => {
                // Credentials come from the standard AWS_* environment variables
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = endpoint.as_deref().filter(|e| !e.is_empty()) {
                    let endpoint = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                        endpoint.to_string()
                    } else {
                        format!("https://{}", endpoint)
                    };
                    builder = builder
                        .with_allow_http(endpoint.starts_with("http://"))
                        .with_endpoint(endpoint);
                }
                let store = builder.build().map_err(map_store_error)?;
                info!("Storage: S3 backend s3://{}", bucket);
                ObjectStoreIntegrationClient::new(Arc::new(store), &format!("s3://{}/", bucket))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkimport_core::port::IntegrationDataStoreClient;

    #[tokio::test]
    async fn test_local_backend_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let client = StorageBackend::Local { root: root.clone() }.build().unwrap();

        let uri = client.prepare_resource("errors", "a.ndjson").await.unwrap();
        assert_eq!(uri, "file:///errors/a.ndjson");
        assert!(root.join("errors").exists());
    }

    #[test]
    fn test_s3_backend_addresses_bucket() {
        let client = StorageBackend::S3 {
            bucket: "imports".to_string(),
            region: Some("us-east-1".to_string()),
            endpoint: Some("http://localhost:9000".to_string()),
        }
        .build()
        .unwrap();

        let path = client.path_of("s3://imports/2024/patients.ndjson").unwrap();
        assert_eq!(path.as_ref(), "2024/patients.ndjson");
        assert!(client.path_of("s3://other/2024/patients.ndjson").is_err());
    }
}
