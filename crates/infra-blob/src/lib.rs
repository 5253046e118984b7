// Bulk Import Infrastructure - Object Store Adapter
// Implements: IntegrationDataStoreClient over the `object_store` crate

mod backend;
mod client;
mod error;

pub use backend::StorageBackend;
pub use client::{ObjectStoreIntegrationClient, DEFAULT_DOWNLOAD_CHUNK_SIZE};
pub use error::map_store_error;
