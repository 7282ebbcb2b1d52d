//! Read-only view over uploads.

use crate::{
    backend::{BackendError, ByteStream},
    models::upload::UploadRecord,
    services::{
        coordinator::MultipartCoordinator,
        error::{StoreError, StoreResult},
    },
};
use std::collections::HashMap;

/// Turns the opaque metadata blob stored with an upload into key/value pairs.
/// The store never interprets the blob itself.
pub trait MetadataCodec {
    fn decode(&self, raw: &str) -> Result<HashMap<String, String>, String>;
}

#[derive(Clone)]
pub struct FileReader {
    coordinator: MultipartCoordinator,
}

impl FileReader {
    pub fn new(coordinator: MultipartCoordinator) -> Self {
        Self { coordinator }
    }

    pub async fn exists(&self, id: &str) -> StoreResult<bool> {
        self.coordinator.state().exists(id).await
    }

    pub async fn get_info(&self, id: &str) -> StoreResult<UploadRecord> {
        self.coordinator.state().get(id).await
    }

    /// Stream the assembled object. Every call opens a fresh stream.
    pub async fn get_content(&self, id: &str) -> StoreResult<ByteStream> {
        let record = self.coordinator.state().get(id).await?;
        if !record.is_complete() {
            return Err(StoreError::UploadIncomplete {
                id: record.id,
                offset: record.offset,
                length: record.size,
            });
        }
        let key = self.coordinator.object_key(id);
        self.coordinator
            .backend()
            .open_object(&key)
            .await?
            .ok_or_else(|| BackendError::NoSuchKey(key).into())
    }

    pub async fn get_metadata(
        &self,
        id: &str,
        codec: &dyn MetadataCodec,
    ) -> StoreResult<HashMap<String, String>> {
        let record = self.coordinator.state().get(id).await?;
        codec
            .decode(&record.metadata)
            .map_err(|reason| StoreError::InvalidMetadata { id: record.id, reason })
    }
}
