// Block-blob client over object_store
//
// Layout for an object at `<path>`:
//   <path>.blocks/<id>     staged blocks
//   <path>.blocklist       committed blocks in order, `[{"id": .., "size": ..}]`
//   <path>                 plain objects written in one put (import sources)
//
// A committed object is a view over its block list: commits rewrite only the
// list, reads stream the listed blocks back to back. An object with a block
// list is always read through it, whatever sits at `<path>`.
// Containers are emulated with a `<container>/.container` marker.

use crate::error::map_store_error;
use async_trait::async_trait;
use bulkimport_core::application::RetryPolicy;
use bulkimport_core::port::integration_store::status;
use bulkimport_core::port::{
    BlobProperties, ByteStream, IntegrationDataStoreClient, IntegrationDataStoreError, StoreResult,
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};
use url::Url;

/// Bytes fetched per ranged read while streaming a download
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: usize = 4 * 1024 * 1024;

const BLOCKS_SUFFIX: &str = ".blocks";
const BLOCK_LIST_SUFFIX: &str = ".blocklist";
const CONTAINER_MARKER: &str = ".container";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CommittedBlock {
    id: String,
    size: usize,
}

/// Committed block list plus the version tag of the list object
struct BlockList {
    blocks: Vec<CommittedBlock>,
    e_tag: Option<String>,
}

impl BlockList {
    fn length(&self) -> usize {
        self.blocks.iter().map(|b| b.size).sum()
    }
}

pub struct ObjectStoreIntegrationClient {
    store: Arc<dyn ObjectStore>,
    base_url: Url,
    retry: RetryPolicy,
    append_retry: RetryPolicy,
    chunk_size: usize,
}

impl ObjectStoreIntegrationClient {
    /// `base_url` is the URI prefix under which object paths are addressed,
    /// e.g. `memory:///`, `file:///` or `s3://bucket/`.
    pub fn new(store: Arc<dyn ObjectStore>, base_url: &str) -> StoreResult<Self> {
        let mut base_url = Url::parse(base_url).map_err(|e| {
            IntegrationDataStoreError::new(
                format!("Invalid base URL {}: {}", base_url, e),
                status::BAD_REQUEST,
            )
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            store,
            base_url,
            retry: RetryPolicy::store_operation(),
            append_retry: RetryPolicy::append_commit(),
            chunk_size: DEFAULT_DOWNLOAD_CHUNK_SIZE,
        })
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::new(Arc::new(InMemory::new()), "memory:///")
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_retry_policies(mut self, retry: RetryPolicy, append_retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.append_retry = append_retry;
        self
    }

    /// The underlying store (to seed or inspect objects directly)
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Write a whole object in one put (seeding sources, not part of the block protocol)
    pub async fn put_object(&self, uri: &str, data: impl Into<Bytes>) -> StoreResult<()> {
        let path = self.path_of(uri)?;
        self.store
            .put(&path, PutPayload::from(data.into()))
            .await
            .map(|_| ())
            .map_err(map_store_error)
    }

    pub fn uri_for(&self, path: &Path) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn path_of(&self, uri: &str) -> StoreResult<Path> {
        let invalid = |reason: &str| {
            IntegrationDataStoreError::new(
                format!("Invalid resource URI {}: {}", uri, reason),
                status::BAD_REQUEST,
            )
        };

        let url = Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != self.base_url.scheme() || url.host_str() != self.base_url.host_str() {
            return Err(invalid(&format!("not under {}", self.base_url)));
        }
        let relative = url
            .path()
            .strip_prefix(self.base_url.path())
            .ok_or_else(|| invalid(&format!("not under {}", self.base_url)))?;
        if relative.is_empty() {
            return Err(invalid("empty object path"));
        }

        Path::from_url_path(relative).map_err(|e| invalid(&e.to_string()))
    }

    fn block_path(path: &Path, block_id: &str) -> StoreResult<Path> {
        if block_id.is_empty() || block_id.contains('/') {
            return Err(IntegrationDataStoreError::new(
                format!("Invalid block id {:?}", block_id),
                status::BAD_REQUEST,
            ));
        }
        Ok(Path::from(format!("{}{}/{}", path, BLOCKS_SUFFIX, block_id)))
    }

    fn block_list_path(path: &Path) -> Path {
        Path::from(format!("{}{}", path, BLOCK_LIST_SUFFIX))
    }

    async fn read_block_list(&self, path: &Path) -> StoreResult<Option<BlockList>> {
        match self.store.get(&Self::block_list_path(path)).await {
            Ok(result) => {
                let e_tag = result.meta.e_tag.clone();
                let bytes = result.bytes().await.map_err(map_store_error)?;
                let blocks = serde_json::from_slice(&bytes).map_err(|e| {
                    IntegrationDataStoreError::new(
                        format!("Corrupt block list for {}: {}", path, e),
                        status::INTERNAL_SERVER_ERROR,
                    )
                })?;
                Ok(Some(BlockList { blocks, e_tag }))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_store_error(e)),
        }
    }

    /// Look up the staged size of each block; an unknown id rejects the commit
    async fn staged_blocks(&self, path: &Path, block_ids: &[String]) -> StoreResult<Vec<CommittedBlock>> {
        let mut blocks = Vec::with_capacity(block_ids.len());
        for block_id in block_ids {
            let block_path = Self::block_path(path, block_id)?;
            let meta = match self.store.head(&block_path).await {
                Ok(meta) => meta,
                Err(object_store::Error::NotFound { .. }) => {
                    return Err(IntegrationDataStoreError::new(
                        format!("Block {} is not staged for {}", block_id, path),
                        status::BAD_REQUEST,
                    ))
                }
                Err(e) => return Err(map_store_error(e)),
            };
            blocks.push(CommittedBlock {
                id: block_id.clone(),
                size: meta.size,
            });
        }
        Ok(blocks)
    }

    async fn write_block_list(&self, path: &Path, blocks: &[CommittedBlock]) -> StoreResult<()> {
        let list = serde_json::to_vec(blocks).map_err(|e| {
            IntegrationDataStoreError::new(e.to_string(), status::INTERNAL_SERVER_ERROR)
        })?;
        self.store
            .put(&Self::block_list_path(path), PutPayload::from(list))
            .await
            .map(|_| ())
            .map_err(map_store_error)
    }

    /// The pieces an object is read from: its blocks in order, or the plain object
    async fn segments(&self, path: &Path) -> StoreResult<Vec<(Path, usize)>> {
        if let Some(list) = self.read_block_list(path).await? {
            return list
                .blocks
                .iter()
                .map(|b| Ok((Self::block_path(path, &b.id)?, b.size)))
                .collect();
        }
        let meta = self.store.head(path).await.map_err(map_store_error)?;
        Ok(vec![(path.clone(), meta.size)])
    }

    async fn ensure_container(&self, container: &str) -> StoreResult<()> {
        let marker = Path::from(format!("{}/{}", container, CONTAINER_MARKER));
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match self.store.put_opts(&marker, PutPayload::new(), opts).await {
            Ok(_) | Err(object_store::Error::AlreadyExists { .. }) => Ok(()),
            // Backends without conditional puts
            Err(object_store::Error::NotImplemented) => self
                .store
                .put(&marker, PutPayload::new())
                .await
                .map(|_| ())
                .map_err(map_store_error),
            Err(e) => Err(map_store_error(e)),
        }
    }

    fn log_failure(operation: &str, uri: &str, err: &IntegrationDataStoreError) {
        error!(
            operation = %operation,
            uri = %uri,
            status_code = err.status_code,
            error = %err.message,
            "Object store operation failed"
        );
    }
}

#[async_trait]
impl IntegrationDataStoreClient for ObjectStoreIntegrationClient {
    async fn download(&self, uri: &str, start_offset: u64) -> StoreResult<ByteStream> {
        let path = self.path_of(uri)?;
        let segments = {
            let path = &path;
            self.retry
                .run("download", IntegrationDataStoreError::is_transient, || self.segments(path))
                .await
                .inspect_err(|e| Self::log_failure("download", uri, e))?
        };

        // Skip whole segments before the offset
        let mut skip = usize::try_from(start_offset).unwrap_or(usize::MAX);
        let mut first = 0;
        while first < segments.len() && skip >= segments[first].1 {
            skip -= segments[first].1;
            first += 1;
        }
        debug!(uri = %uri, segments = segments.len(), first, skip, "Opening download stream");

        let segments = Arc::new(segments);
        let store = self.store.clone();
        let retry = self.retry;
        let chunk_size = self.chunk_size;
        let chunks = stream::try_unfold((first, skip), move |(mut index, mut position)| {
            let store = store.clone();
            let segments = segments.clone();
            async move {
                while index < segments.len() && position >= segments[index].1 {
                    index += 1;
                    position = 0;
                }
                let Some((path, size)) = segments.get(index) else {
                    return Ok(None);
                };
                let end = (position + chunk_size).min(*size);
                let store = &store;
                retry
                    .run("download_range", IntegrationDataStoreError::is_transient, || async move {
                        store
                            .get_range(path, position..end)
                            .await
                            .map_err(map_store_error)
                    })
                    .await
                    .map(|bytes| Some((bytes, (index, end))))
            }
        });

        Ok(chunks.boxed())
    }

    async fn prepare_resource(&self, container: &str, file_name: &str) -> StoreResult<String> {
        let path = Path::from(format!("{}/{}", container, file_name));
        let uri = self.uri_for(&path);

        self.retry
            .run("prepare_resource", IntegrationDataStoreError::is_transient, || {
                self.ensure_container(container)
            })
            .await
            .inspect_err(|e| Self::log_failure("prepare_resource", &uri, e))?;

        info!(container = %container, uri = %uri, "Prepared destination");
        Ok(uri)
    }

    async fn upload_block(&self, uri: &str, data: Bytes, block_id: &str) -> StoreResult<()> {
        let path = self.path_of(uri)?;
        let block_path = Self::block_path(&path, block_id)?;
        let block_path = &block_path;

        self.retry
            .run("upload_block", IntegrationDataStoreError::is_transient, || {
                let payload = PutPayload::from(data.clone());
                async move {
                    self.store
                        .put(block_path, payload)
                        .await
                        .map(|_| ())
                        .map_err(map_store_error)
                }
            })
            .await
            .inspect_err(|e| Self::log_failure("upload_block", uri, e))
    }

    async fn commit(&self, uri: &str, block_ids: &[String]) -> StoreResult<()> {
        let path = self.path_of(uri)?;
        let path = &path;

        self.retry
            .run("commit", IntegrationDataStoreError::is_transient, || async move {
                let blocks = self.staged_blocks(path, block_ids).await?;
                self.write_block_list(path, &blocks).await
            })
            .await
            .inspect_err(|e| Self::log_failure("commit", uri, e))
    }

    async fn append_commit(&self, uri: &str, block_ids: &[String]) -> StoreResult<()> {
        let path = self.path_of(uri)?;
        let path = &path;

        self.append_retry
            .run("append_commit", IntegrationDataStoreError::is_transient, || async move {
                let mut blocks = self
                    .read_block_list(path)
                    .await?
                    .map(|list| list.blocks)
                    .unwrap_or_default();
                blocks.extend(self.staged_blocks(path, block_ids).await?);
                self.write_block_list(path, &blocks).await
            })
            .await
            .inspect_err(|e| Self::log_failure("append_commit", uri, e))
    }

    async fn get_properties(&self, uri: &str) -> StoreResult<BlobProperties> {
        let path = self.path_of(uri)?;
        let path = &path;

        self.retry
            .run("get_properties", IntegrationDataStoreError::is_transient, || async move {
                if let Some(list) = self.read_block_list(path).await? {
                    return Ok(BlobProperties {
                        length: list.length() as u64,
                        etag: list.e_tag,
                    });
                }
                let meta = self.store.head(path).await.map_err(map_store_error)?;
                Ok(BlobProperties {
                    etag: meta.e_tag,
                    length: meta.size as u64,
                })
            })
            .await
            .inspect_err(|e| Self::log_failure("get_properties", uri, e))
    }
}
