//! Multipart upload lifecycle.
//!
//! Every upload is backed by one multipart handle on `<object_prefix><id>`.
//! Parts are committed one at a time: the part goes to the backend first, the
//! state record is persisted second, and only then is the caller's copy of the
//! record advanced.

use crate::{
    backend::{BackendError, CompletedPart, SharedBackend},
    models::upload::{PartRecord, UploadRecord},
    services::{
        error::{StoreError, StoreResult},
        state_store::UploadStateStore,
    },
};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct MultipartCoordinator {
    backend: SharedBackend,
    state: UploadStateStore,
    object_prefix: String,
}

impl MultipartCoordinator {
    pub fn new(
        backend: SharedBackend,
        state: UploadStateStore,
        object_prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            state,
            object_prefix: object_prefix.into(),
        }
    }

    pub fn state(&self) -> &UploadStateStore {
        &self.state
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn object_prefix(&self) -> &str {
        &self.object_prefix
    }

    /// Key the upload is assembled into.
    pub fn object_key(&self, id: &str) -> String {
        format!("{}{}", self.object_prefix, id)
    }

    /// Open a new multipart handle for `id`.
    pub async fn initiate(&self, id: &str) -> StoreResult<String> {
        let key = self.object_key(id);
        let upload_id = self.backend.create_multipart_upload(&key).await?;
        info!(id, upload_id = %upload_id, "initiated multipart upload");
        Ok(upload_id)
    }

    /// Commit `body` as the next part of `record`.
    ///
    /// The record is persisted before this returns; `record` is only updated
    /// once that write succeeded. With a `cancel` token, cancellation while the
    /// part is in transfer yields [`StoreError::Cancelled`] and leaves `record`
    /// untouched. The part may or may not exist at the backend afterwards; the
    /// next commit reuses its number.
    pub async fn upload_part(
        &self,
        record: &mut UploadRecord,
        body: Bytes,
        cancel: Option<&CancellationToken>,
    ) -> StoreResult<PartRecord> {
        let number = record.next_part_number();
        let size = body.len() as u64;
        let key = self.object_key(&record.id);

        let transfer = self
            .backend
            .upload_part(&key, &record.upload_id, number, body);
        let etag = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(id = %record.id, part = number, "part upload cancelled");
                    return Err(StoreError::Cancelled);
                }
                etag = transfer => etag?,
            },
            None => transfer.await?,
        };

        let part = PartRecord { number, size, etag };
        let mut updated = record.clone();
        updated.parts.push(part.clone());
        updated.offset += size;
        self.state.put(&updated).await?;

        debug!(id = %record.id, part = number, size, offset = updated.offset, "committed part");
        *record = updated;
        Ok(part)
    }

    /// Assemble the committed parts into the final object.
    ///
    /// Safe to repeat: if the handle is gone but the object exists, a previous
    /// attempt already succeeded and its response was lost.
    pub async fn finalize(&self, record: &UploadRecord) -> StoreResult<()> {
        if !record.is_complete() {
            return Err(StoreError::UploadIncomplete {
                id: record.id.clone(),
                offset: record.offset,
                length: record.size,
            });
        }

        let key = self.object_key(&record.id);
        let mut parts: Vec<CompletedPart> = record
            .parts
            .iter()
            .map(|p| CompletedPart {
                part_number: p.number,
                etag: p.etag.clone(),
            })
            .collect();
        parts.sort_by_key(|p| p.part_number);

        if parts.is_empty() && self.backend.head_object(&key).await? {
            debug!(id = %record.id, "empty upload already finalized");
            return Ok(());
        }

        let result: Result<(), BackendError> = async {
            if parts.is_empty() {
                // completion needs at least one part, even for empty uploads
                let etag = self
                    .backend
                    .upload_part(&key, &record.upload_id, 1, Bytes::new())
                    .await?;
                parts.push(CompletedPart {
                    part_number: 1,
                    etag,
                });
            }
            self.backend
                .complete_multipart_upload(&key, &record.upload_id, &parts)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                info!(id = %record.id, size = record.offset, parts = parts.len(), "finalized upload");
                Ok(())
            }
            Err(err @ BackendError::NoSuchUpload { .. }) => {
                if self.backend.head_object(&key).await? {
                    debug!(id = %record.id, "upload already finalized");
                    Ok(())
                } else {
                    Err(err.into())
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Cancel a multipart handle. An unknown handle counts as already gone.
    pub async fn abort(&self, id: &str, upload_id: &str) -> StoreResult<()> {
        let key = self.object_key(id);
        match self.backend.abort_multipart_upload(&key, upload_id).await {
            Ok(()) => {
                info!(id, upload_id, "aborted multipart upload");
                Ok(())
            }
            Err(BackendError::NoSuchUpload { .. }) => {
                debug!(id, upload_id, "multipart upload already gone");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Remove every trace of an upload: state record, multipart handle and
    /// assembled object.
    ///
    /// The record goes first so a concurrent writer cannot find it anymore;
    /// the handle and the object are cleaned up best-effort afterwards.
    pub async fn terminate(&self, record: &UploadRecord) -> StoreResult<()> {
        self.state.delete(&record.id).await?;

        if let Err(err) = self.abort(&record.id, &record.upload_id).await {
            warn!(id = %record.id, error = %err, "failed to abort multipart upload");
        }
        let key = self.object_key(&record.id);
        if let Err(err) = self.backend.delete_object(&key).await {
            warn!(id = %record.id, error = %err, "failed to delete upload object");
        }
        info!(id = %record.id, "terminated upload");
        Ok(())
    }

    /// Remove the record and object of an upload whose record is unreadable.
    /// The handle id is unknown, so the handle is left to the orphan sweep.
    pub async fn discard(&self, id: &str) -> StoreResult<()> {
        self.state.delete(id).await?;
        let key = self.object_key(id);
        if let Err(err) = self.backend.delete_object(&key).await {
            warn!(id, error = %err, "failed to delete upload object");
        }
        info!(id, "discarded upload with unreadable state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use std::{sync::Arc, time::Duration};

    struct Fixture {
        backend: Arc<MemoryBackend>,
        coordinator: MultipartCoordinator,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let state = UploadStateStore::new(backend.clone(), "state/");
        let coordinator = MultipartCoordinator::new(backend.clone(), state, "files/");
        Fixture {
            backend,
            coordinator,
        }
    }

    async fn new_record(f: &Fixture, id: &str, size: i64) -> UploadRecord {
        let upload_id = f.coordinator.initiate(id).await.unwrap();
        let record = UploadRecord::new(id.into(), upload_id, size, String::new());
        f.coordinator.state().create(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn upload_part_numbers_contiguously_and_persists() {
        let f = fixture();
        let mut record = new_record(&f, "a", 10).await;

        let p1 = f
            .coordinator
            .upload_part(&mut record, Bytes::from_static(b"abcd"), None)
            .await
            .unwrap();
        let p2 = f
            .coordinator
            .upload_part(&mut record, Bytes::from_static(b"efg"), None)
            .await
            .unwrap();

        assert_eq!((p1.number, p2.number), (1, 2));
        assert_eq!(record.offset, 7);
        let stored = f.coordinator.state().get("a").await.unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn failed_persist_leaves_record_untouched() {
        let f = fixture();
        let mut record = new_record(&f, "a", 10).await;
        let before = record.clone();

        f.backend.set_fail_puts(true);
        let err = f
            .coordinator
            .upload_part(&mut record, Bytes::from_static(b"abcd"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(record, before);

        f.backend.set_fail_puts(false);
        let part = f
            .coordinator
            .upload_part(&mut record, Bytes::from_static(b"abcd"), None)
            .await
            .unwrap();
        assert_eq!(part.number, 1);
    }

    #[tokio::test]
    async fn cancelled_transfer_is_distinguished() {
        let f = fixture();
        let mut record = new_record(&f, "a", 10).await;
        let before = record.clone();

        f.backend.set_part_delay(Some(Duration::from_secs(30)));
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = f
            .coordinator
            .upload_part(&mut record, Bytes::from_static(b"abcd"), Some(&token))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(record, before);
        assert_eq!(f.coordinator.state().get("a").await.unwrap(), before);
    }

    #[tokio::test]
    async fn finalize_requires_complete_upload() {
        let f = fixture();
        let mut record = new_record(&f, "a", 10).await;
        f.coordinator
            .upload_part(&mut record, Bytes::from_static(b"abc"), None)
            .await
            .unwrap();

        let err = f.coordinator.finalize(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::UploadIncomplete { offset: 3, .. }));
        assert_eq!(f.backend.completions(), 0);
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let f = fixture();
        let mut record = new_record(&f, "a", 4).await;
        f.coordinator
            .upload_part(&mut record, Bytes::from_static(b"abcd"), None)
            .await
            .unwrap();

        f.coordinator.finalize(&record).await.unwrap();
        f.coordinator.finalize(&record).await.unwrap();
        assert_eq!(f.backend.object("files/a").unwrap(), Bytes::from_static(b"abcd"));
        assert_eq!(f.backend.completions(), 2);
    }

    #[tokio::test]
    async fn finalize_empty_upload_adds_empty_part() {
        let f = fixture();
        let record = new_record(&f, "empty", 0).await;
        f.coordinator.finalize(&record).await.unwrap();
        assert_eq!(f.backend.object("files/empty").unwrap().len(), 0);

        f.coordinator.finalize(&record).await.unwrap();
        assert_eq!(f.backend.part_uploads(), 1);
        assert_eq!(f.backend.completions(), 1);
    }

    #[tokio::test]
    async fn abort_tolerates_missing_handle() {
        let f = fixture();
        let record = new_record(&f, "a", 4).await;
        let mut record = record;
        f.coordinator
            .upload_part(&mut record, Bytes::from_static(b"ab"), None)
            .await
            .unwrap();
        assert_eq!(f.backend.stored_parts(&record.upload_id), 1);

        f.coordinator.abort("a", &record.upload_id).await.unwrap();
        f.coordinator.abort("a", &record.upload_id).await.unwrap();
        assert!(!f.backend.has_upload(&record.upload_id));
        assert_eq!(f.backend.stored_parts(&record.upload_id), 0);
        assert_eq!(f.backend.aborts(), 2);
    }

    #[tokio::test]
    async fn terminate_removes_record_handle_and_object() {
        let f = fixture();
        let mut record = new_record(&f, "a", 4).await;
        f.coordinator
            .upload_part(&mut record, Bytes::from_static(b"abcd"), None)
            .await
            .unwrap();
        f.coordinator.finalize(&record).await.unwrap();

        f.coordinator.terminate(&record).await.unwrap();
        assert!(!f.coordinator.state().exists("a").await.unwrap());
        assert!(f.backend.object("files/a").is_none());
        assert!(!f.backend.has_upload(&record.upload_id));
    }
}
