// Remote Object Store Port (Interface)
//
// Block-blob semantics: blocks are staged under caller-chosen ids and
// become visible only when a block list is committed.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known status codes used to classify store failures
pub mod status {
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;
    pub const PRECONDITION_FAILED: u16 = 412;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const NOT_IMPLEMENTED: u16 = 501;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// Failure reported by the object store, carrying the status it maps to
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (status {status_code})")]
pub struct IntegrationDataStoreError {
    pub message: String,
    pub status_code: u16,
}

impl IntegrationDataStoreError {
    pub fn new(message: impl Into<String>, status_code: u16) -> Self {
        Self {
            message: message.into(),
            status_code,
        }
    }

    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        !matches!(
            self.status_code,
            status::BAD_REQUEST
                | status::UNAUTHORIZED
                | status::FORBIDDEN
                | status::NOT_FOUND
                | status::NOT_IMPLEMENTED
        )
    }
}

pub type StoreResult<T> = std::result::Result<T, IntegrationDataStoreError>;

/// Lazy byte stream over an object
pub type ByteStream = BoxStream<'static, StoreResult<Bytes>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobProperties {
    pub etag: Option<String>,
    pub length: u64,
}

#[async_trait]
pub trait IntegrationDataStoreClient: Send + Sync {
    /// Open the object and stream its bytes starting at `start_offset`.
    /// An offset at or past the end yields an empty stream.
    async fn download(&self, uri: &str, start_offset: u64) -> StoreResult<ByteStream>;

    /// Ensure `container` exists and return the URI of `file_name` inside it
    async fn prepare_resource(&self, container: &str, file_name: &str) -> StoreResult<String>;

    /// Stage a block; invisible until committed
    async fn upload_block(&self, uri: &str, data: Bytes, block_id: &str) -> StoreResult<()>;

    /// Replace the object's content with exactly `block_ids`, in order
    async fn commit(&self, uri: &str, block_ids: &[String]) -> StoreResult<()>;

    /// Extend the currently committed block list with `block_ids`
    async fn append_commit(&self, uri: &str, block_ids: &[String]) -> StoreResult<()>;

    async fn get_properties(&self, uri: &str) -> StoreResult<BlobProperties>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use futures::stream;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        objects: HashMap<String, Bytes>,
        staged: HashMap<(String, String), Bytes>,
        block_lists: HashMap<String, Vec<String>>,
        containers: Vec<String>,
        faults: HashMap<&'static str, Vec<u16>>,
        calls: HashMap<&'static str, usize>,
    }

    /// In-memory block-blob store with fault injection.
    ///
    /// Operation names for faults and call counts: `download`, `prepare_resource`,
    /// `upload_block`, `commit`, `append_commit`, `get_properties`.
    pub struct InMemoryIntegrationStore {
        state: Mutex<State>,
        chunk_size: usize,
    }

    impl Default for InMemoryIntegrationStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryIntegrationStore {
        pub fn new() -> Self {
            Self::with_chunk_size(64)
        }

        /// Downloads are split into chunks of this many bytes
        pub fn with_chunk_size(chunk_size: usize) -> Self {
            Self {
                state: Mutex::new(State::default()),
                chunk_size: chunk_size.max(1),
            }
        }

        pub fn put_object(&self, uri: &str, data: impl Into<Bytes>) {
            self.state
                .lock()
                .unwrap()
                .objects
                .insert(uri.to_string(), data.into());
        }

        pub fn object(&self, uri: &str) -> Option<Bytes> {
            self.state.lock().unwrap().objects.get(uri).cloned()
        }

        pub fn object_text(&self, uri: &str) -> Option<String> {
            self.object(uri)
                .map(|b| String::from_utf8_lossy(&b).into_owned())
        }

        pub fn committed_blocks(&self, uri: &str) -> Vec<String> {
            self.state
                .lock()
                .unwrap()
                .block_lists
                .get(uri)
                .cloned()
                .unwrap_or_default()
        }

        /// Make the next calls of `operation` fail with the given status codes, in order
        pub fn inject_faults(&self, operation: &'static str, status_codes: &[u16]) {
            self.state
                .lock()
                .unwrap()
                .faults
                .entry(operation)
                .or_default()
                .extend_from_slice(status_codes);
        }

        pub fn call_count(&self, operation: &'static str) -> usize {
            *self.state.lock().unwrap().calls.get(operation).unwrap_or(&0)
        }

        fn enter(&self, state: &mut State, operation: &'static str) -> StoreResult<()> {
            *state.calls.entry(operation).or_insert(0) += 1;
            if let Some(queue) = state.faults.get_mut(operation) {
                if !queue.is_empty() {
                    let code = queue.remove(0);
                    return Err(IntegrationDataStoreError::new(
                        format!("injected {} failure", operation),
                        code,
                    ));
                }
            }
            Ok(())
        }

        fn write_blocks(state: &mut State, uri: &str, block_ids: Vec<String>) -> StoreResult<()> {
            let mut content = Vec::new();
            for id in &block_ids {
                let block = state
                    .staged
                    .get(&(uri.to_string(), id.clone()))
                    .ok_or_else(|| {
                        IntegrationDataStoreError::new(
                            format!("block {} not staged for {}", id, uri),
                            status::BAD_REQUEST,
                        )
                    })?;
                content.extend_from_slice(block);
            }
            state.objects.insert(uri.to_string(), Bytes::from(content));
            state.block_lists.insert(uri.to_string(), block_ids);
            Ok(())
        }
    }

    #[async_trait]
    impl IntegrationDataStoreClient for InMemoryIntegrationStore {
        async fn download(&self, uri: &str, start_offset: u64) -> StoreResult<ByteStream> {
            let mut state = self.state.lock().unwrap();
            self.enter(&mut state, "download")?;
            let data = state.objects.get(uri).cloned().ok_or_else(|| {
                IntegrationDataStoreError::new(format!("{} not found", uri), status::NOT_FOUND)
            })?;

            let start = (start_offset as usize).min(data.len());
            let rest = data.slice(start..);
            let chunks: Vec<StoreResult<Bytes>> = rest
                .chunks(self.chunk_size)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(Box::pin(stream::iter(chunks)))
        }

        async fn prepare_resource(&self, container: &str, file_name: &str) -> StoreResult<String> {
            let mut state = self.state.lock().unwrap();
            self.enter(&mut state, "prepare_resource")?;
            if !state.containers.iter().any(|c| c == container) {
                state.containers.push(container.to_string());
            }
            Ok(format!("memory:///{}/{}", container, file_name))
        }

        async fn upload_block(&self, uri: &str, data: Bytes, block_id: &str) -> StoreResult<()> {
            let mut state = self.state.lock().unwrap();
            self.enter(&mut state, "upload_block")?;
            state
                .staged
                .insert((uri.to_string(), block_id.to_string()), data);
            Ok(())
        }

        async fn commit(&self, uri: &str, block_ids: &[String]) -> StoreResult<()> {
            let mut state = self.state.lock().unwrap();
            self.enter(&mut state, "commit")?;
            Self::write_blocks(&mut state, uri, block_ids.to_vec())
        }

        async fn append_commit(&self, uri: &str, block_ids: &[String]) -> StoreResult<()> {
            let mut state = self.state.lock().unwrap();
            self.enter(&mut state, "append_commit")?;
            let mut list = state.block_lists.get(uri).cloned().unwrap_or_default();
            list.extend(block_ids.iter().cloned());
            Self::write_blocks(&mut state, uri, list)
        }

        async fn get_properties(&self, uri: &str) -> StoreResult<BlobProperties> {
            let mut state = self.state.lock().unwrap();
            self.enter(&mut state, "get_properties")?;
            let data = state.objects.get(uri).ok_or_else(|| {
                IntegrationDataStoreError::new(format!("{} not found", uri), status::NOT_FOUND)
            })?;
            Ok(BlobProperties {
                etag: Some(format!("\"{}\"", data.len())),
                length: data.len() as u64,
            })
        }
    }
}
