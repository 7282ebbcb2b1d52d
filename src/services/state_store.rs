//! Durable upload state.
//!
//! Every upload owns exactly one JSON record at `<prefix><id>.info`. The
//! record is rewritten in full on every mutation; the backend object is the
//! only copy that counts.

use crate::{
    backend::{DEFAULT_PAGE_SIZE, SharedBackend, object_keys},
    models::upload::UploadRecord,
    services::error::{StoreError, StoreResult},
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use tracing::{debug, warn};

pub const INFO_SUFFIX: &str = ".info";

#[derive(Clone)]
pub struct UploadStateStore {
    backend: SharedBackend,
    prefix: String,
    page_size: usize,
}

impl UploadStateStore {
    pub fn new(backend: SharedBackend, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Number of keys requested per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn key(&self, id: &str) -> String {
        format!("{}{}{}", self.prefix, id, INFO_SUFFIX)
    }

    /// Persist a new record. Fails if one is already visible for the id.
    pub async fn create(&self, record: &UploadRecord) -> StoreResult<()> {
        if self.backend.head_object(&self.key(&record.id)).await? {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        self.put(record).await
    }

    pub async fn exists(&self, id: &str) -> StoreResult<bool> {
        Ok(self.backend.head_object(&self.key(id)).await?)
    }

    pub async fn get(&self, id: &str) -> StoreResult<UploadRecord> {
        let key = self.key(id);
        let body = self
            .backend
            .get_object(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        serde_json::from_slice(&body).map_err(|source| StoreError::CorruptState { key, source })
    }

    /// Overwrite the record. Returns only once the backend accepted the write.
    pub async fn put(&self, record: &UploadRecord) -> StoreResult<()> {
        let key = self.key(&record.id);
        let body = serde_json::to_vec(record).map_err(|source| StoreError::CorruptState {
            key: key.clone(),
            source,
        })?;
        self.backend.put_object(&key, Bytes::from(body)).await?;
        debug!(id = %record.id, offset = record.offset, parts = record.parts.len(), "persisted upload state");
        Ok(())
    }

    /// Remove the record. Absent records are fine.
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        self.backend.delete_object(&self.key(id)).await?;
        Ok(())
    }

    /// Lazily enumerate every record, one listing page at a time.
    ///
    /// Records that vanished between listing and reading, or that fail to
    /// parse, are logged and skipped. Backend failures are yielded as errors.
    pub fn list(&self) -> BoxStream<'static, StoreResult<UploadRecord>> {
        let backend = self.backend.clone();
        object_keys(self.backend.clone(), self.prefix.clone(), self.page_size)
            .map_err(StoreError::from)
            .try_filter_map(move |key| read_listed_record(backend.clone(), key))
            .boxed()
    }
}

async fn read_listed_record(backend: SharedBackend, key: String) -> StoreResult<Option<UploadRecord>> {
    if !key.ends_with(INFO_SUFFIX) {
        debug!(key = %key, "skipping non-record key under state prefix");
        return Ok(None);
    }
    let Some(body) = backend.get_object(&key).await? else {
        debug!(key = %key, "state record vanished while listing");
        return Ok(None);
    };
    match serde_json::from_slice::<UploadRecord>(&body) {
        Ok(record) => Ok(Some(record)),
        Err(err) => {
            warn!(key = %key, error = %err, "skipping corrupt upload state record");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ObjectBackend, memory::MemoryBackend};
    use std::sync::Arc;

    fn store() -> (UploadStateStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = UploadStateStore::new(backend.clone(), "state/").with_page_size(2);
        (store, backend)
    }

    fn record(id: &str) -> UploadRecord {
        UploadRecord::new(id.into(), format!("upload-{id}"), 10, String::new())
    }

    #[tokio::test]
    async fn create_refuses_existing_record() {
        let (store, _) = store();
        store.create(&record("a")).await.unwrap();
        let err = store.create(&record("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == "a"));
    }

    #[tokio::test]
    async fn get_missing_record_is_not_found() {
        let (store, _) = store();
        let err = store.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn put_overwrites_and_delete_is_idempotent() {
        let (store, _) = store();
        let mut rec = record("a");
        store.create(&rec).await.unwrap();
        rec.offset = 4;
        store.put(&rec).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().offset, 4);

        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert!(!store.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn list_skips_corrupt_and_foreign_entries() {
        let (store, backend) = store();
        for id in ["a", "b", "c", "d"] {
            store.create(&record(id)).await.unwrap();
        }
        backend
            .put_object("state/torn.info", Bytes::from_static(b"{\"Id\":"))
            .await
            .unwrap();
        backend
            .put_object("state/readme.txt", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let mut ids: Vec<String> = store
            .list()
            .map_ok(|r| r.id)
            .try_collect()
            .await
            .unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn get_reports_corrupt_record() {
        let (store, backend) = store();
        backend
            .put_object("state/bad.info", Bytes::from_static(b"not json"))
            .await
            .unwrap();
        let err = store.get("bad").await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptState { .. }));
    }

    #[tokio::test]
    async fn put_failure_propagates() {
        let (store, backend) = store();
        backend.set_fail_puts(true);
        let err = store.put(&record("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
