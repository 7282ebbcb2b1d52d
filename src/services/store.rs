//! The upload store as a protocol engine sees it.

use crate::{
    backend::{ByteStream, SharedBackend},
    config::StoreConfig,
    models::upload::{DEFERRED_LENGTH, UploadRecord},
    services::{
        coordinator::MultipartCoordinator,
        error::{StoreError, StoreResult},
        ingest::{IngestionPipeline, WriteOutcome},
        reader::{FileReader, MetadataCodec},
        reconciler::{ExpirationReconciler, ReconcileReport},
        state_store::UploadStateStore,
    },
};
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use std::{collections::HashMap, io, sync::Arc, time::Duration};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Source of new upload ids.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Random v4 UUIDs without hyphens.
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

#[derive(Clone)]
pub struct UploadStore {
    coordinator: MultipartCoordinator,
    pipeline: IngestionPipeline,
    reconciler: ExpirationReconciler,
    reader: FileReader,
    ids: Arc<dyn IdGenerator>,
    default_ttl: Option<Duration>,
}

impl UploadStore {
    pub fn new(backend: SharedBackend, config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        if config.prefixes_nested() {
            warn!(
                state_prefix = %config.state_prefix,
                object_prefix = %config.object_prefix,
                "state and object prefixes are nested"
            );
        }

        let state = UploadStateStore::new(backend.clone(), config.state_prefix.clone())
            .with_page_size(config.page_size);
        let coordinator = MultipartCoordinator::new(backend, state, config.object_prefix.clone());
        Ok(Self {
            pipeline: IngestionPipeline::new(coordinator.clone(), config.part_limits),
            reconciler: ExpirationReconciler::new(coordinator.clone())
                .with_orphan_grace(config.orphan_grace)
                .with_page_size(config.page_size),
            reader: FileReader::new(coordinator.clone()),
            coordinator,
            ids: Arc::new(UuidGenerator),
            default_ttl: config.default_ttl,
        })
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn reconciler(&self) -> &ExpirationReconciler {
        &self.reconciler
    }

    pub async fn exists(&self, id: &str) -> StoreResult<bool> {
        self.reader.exists(id).await
    }

    /// Start a new upload of `length` bytes ([`DEFERRED_LENGTH`] if unknown).
    pub async fn create(&self, length: i64, metadata: impl Into<String>) -> StoreResult<UploadRecord> {
        let id = self.ids.generate();
        if length < DEFERRED_LENGTH {
            return Err(StoreError::InvalidLength {
                id,
                length,
                reason: "length must be non-negative or deferred".into(),
            });
        }

        let upload_id = self.coordinator.initiate(&id).await?;
        let mut record = UploadRecord::new(id, upload_id, length, metadata.into());
        record.expires = self.default_ttl.and_then(expiry_from_now);
        self.coordinator.state().create(&record).await?;
        info!(id = %record.id, size = record.size, "created upload");

        if record.is_complete() {
            self.coordinator.finalize(&record).await?;
        }
        Ok(record)
    }

    pub async fn write_stream<S>(
        &self,
        id: &str,
        stream: S,
        cancel: &CancellationToken,
    ) -> StoreResult<WriteOutcome>
    where
        S: Stream<Item = io::Result<bytes::Bytes>> + Send + Unpin,
    {
        self.pipeline.write_stream(id, stream, cancel).await
    }

    pub async fn write_reader<R>(
        &self,
        id: &str,
        reader: R,
        cancel: &CancellationToken,
    ) -> StoreResult<WriteOutcome>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.pipeline.write_reader(id, reader, cancel).await
    }

    /// Fix the length of an upload created with a deferred length.
    pub async fn declare_length(&self, id: &str, length: i64) -> StoreResult<UploadRecord> {
        let mut record = self.coordinator.state().get(id).await?;
        if !record.is_length_deferred() {
            return Err(StoreError::LengthAlreadyDeclared(record.id));
        }
        if u64::try_from(length).map_or(true, |len| len < record.offset) {
            return Err(StoreError::InvalidLength {
                id: record.id,
                length,
                reason: format!("below current offset {}", record.offset),
            });
        }

        record.size = length;
        self.coordinator.state().put(&record).await?;
        info!(id, length, "declared upload length");

        if record.is_complete() {
            self.coordinator.finalize(&record).await?;
        }
        Ok(record)
    }

    /// Delete an upload and everything it left at the backend. Unknown ids
    /// are a no-op. An unreadable record is still removed along with the
    /// object; its multipart handle is reaped by the orphan sweep.
    pub async fn terminate(&self, id: &str) -> StoreResult<()> {
        match self.coordinator.state().get(id).await {
            Ok(record) => self.coordinator.terminate(&record).await,
            Err(err) if err.is_not_found() => Ok(()),
            Err(err @ StoreError::CorruptState { .. }) => {
                warn!(id, error = %err, "terminating upload with corrupt state");
                self.coordinator.discard(id).await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get_expiration(&self, id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.coordinator.state().get(id).await?.expires)
    }

    pub async fn set_expiration(&self, id: &str, expires: Option<DateTime<Utc>>) -> StoreResult<()> {
        let mut record = self.coordinator.state().get(id).await?;
        record.expires = expires;
        self.coordinator.state().put(&record).await
    }

    pub async fn find_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        self.reconciler.find_expired(now).await
    }

    /// Run one reconcile pass and return how many handles and uploads it
    /// removed.
    pub async fn purge_expired(&self, cancel: &CancellationToken) -> StoreResult<usize> {
        self.reconcile(cancel).await.map(|report| report.total())
    }

    pub async fn reconcile(&self, cancel: &CancellationToken) -> StoreResult<ReconcileReport> {
        self.reconciler.reconcile(cancel).await
    }

    pub async fn get_info(&self, id: &str) -> StoreResult<UploadRecord> {
        self.reader.get_info(id).await
    }

    pub async fn get_content(&self, id: &str) -> StoreResult<ByteStream> {
        self.reader.get_content(id).await
    }

    pub async fn get_metadata(
        &self,
        id: &str,
        codec: &dyn MetadataCodec,
    ) -> StoreResult<HashMap<String, String>> {
        self.reader.get_metadata(id, codec).await
    }
}

fn expiry_from_now(ttl: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ObjectBackend, memory::MemoryBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Sequential(AtomicUsize);

    impl IdGenerator for Sequential {
        fn generate(&self) -> String {
            format!("file{}", self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn store(config: StoreConfig) -> (UploadStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = UploadStore::new(backend.clone(), &config)
            .unwrap()
            .with_id_generator(Arc::new(Sequential(AtomicUsize::new(0))));
        (store, backend)
    }

    #[tokio::test]
    async fn identical_prefixes_are_rejected() {
        let config = StoreConfig {
            state_prefix: "same/".into(),
            object_prefix: "same/".into(),
            ..StoreConfig::default()
        };
        let result = UploadStore::new(Arc::new(MemoryBackend::new()), &config);
        assert!(matches!(result, Err(StoreError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn create_uses_generator_and_default_ttl() {
        let (store, _) = store(StoreConfig {
            default_ttl: Some(Duration::from_secs(60)),
            ..StoreConfig::default()
        });
        let record = store.create(10, "name world").await.unwrap();
        assert_eq!(record.id, "file0");
        assert!(record.expires.is_some_and(|at| at > Utc::now()));
        assert!(store.exists("file0").await.unwrap());
    }

    #[tokio::test]
    async fn zero_length_upload_is_finalized_at_creation() {
        let (store, backend) = store(StoreConfig::default());
        let record = store.create(0, "").await.unwrap();
        assert_eq!(backend.completions(), 1);
        assert_eq!(
            backend
                .object(&format!("uploads/files/{}", record.id))
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn negative_length_is_rejected() {
        let (store, _) = store(StoreConfig::default());
        let err = store.create(-5, "").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidLength { length: -5, .. }));
    }

    #[tokio::test]
    async fn declare_length_only_once_and_not_below_offset() {
        let (store, _) = store(StoreConfig::default());
        let record = store.create(DEFERRED_LENGTH, "").await.unwrap();
        let cancel = CancellationToken::new();
        store
            .write_reader(&record.id, &b"abcdef"[..], &cancel)
            .await
            .unwrap();

        let err = store.declare_length(&record.id, 3).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidLength { .. }));

        let declared = store.declare_length(&record.id, 10).await.unwrap();
        assert_eq!(declared.size, 10);

        let err = store.declare_length(&record.id, 12).await.unwrap_err();
        assert!(matches!(err, StoreError::LengthAlreadyDeclared(_)));
    }

    #[tokio::test]
    async fn declaring_length_at_offset_finalizes() {
        let (store, backend) = store(StoreConfig::default());
        let record = store.create(DEFERRED_LENGTH, "").await.unwrap();
        store
            .write_reader(&record.id, &b"abcdef"[..], &CancellationToken::new())
            .await
            .unwrap();

        store.declare_length(&record.id, 6).await.unwrap();
        assert_eq!(backend.completions(), 1);
        assert!(store.get_info(&record.id).await.unwrap().is_complete());
    }

    #[tokio::test]
    async fn terminate_removes_upload_with_corrupt_record() {
        let (store, backend) = store(StoreConfig {
            orphan_grace: Duration::ZERO,
            ..StoreConfig::default()
        });
        let record = store.create(3, "").await.unwrap();
        store
            .write_reader(&record.id, &b"abc"[..], &CancellationToken::new())
            .await
            .unwrap();
        let state_key = format!("uploads/info/{}.info", record.id);
        let object_key = format!("uploads/files/{}", record.id);
        backend
            .put_object(&state_key, bytes::Bytes::from_static(b"{\"Id\":"))
            .await
            .unwrap();

        store.terminate(&record.id).await.unwrap();

        assert!(!store.exists(&record.id).await.unwrap());
        assert!(backend.object(&object_key).is_none());
    }

    #[tokio::test]
    async fn corrupt_record_handle_is_left_to_orphan_sweep() {
        let (store, backend) = store(StoreConfig {
            orphan_grace: Duration::ZERO,
            ..StoreConfig::default()
        });
        let record = store.create(10, "").await.unwrap();
        backend
            .put_object(
                &format!("uploads/info/{}.info", record.id),
                bytes::Bytes::from_static(b"not json"),
            )
            .await
            .unwrap();

        store.terminate(&record.id).await.unwrap();
        assert!(backend.has_upload(&record.upload_id));

        let report = store.reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.orphans_aborted, 1);
        assert!(!backend.has_upload(&record.upload_id));
    }

    #[tokio::test]
    async fn expiration_round_trips_and_unknown_terminate_is_noop() {
        let (store, _) = store(StoreConfig::default());
        let record = store.create(10, "").await.unwrap();
        assert_eq!(store.get_expiration(&record.id).await.unwrap(), None);

        let at = Utc::now() - TimeDelta::minutes(5);
        store.set_expiration(&record.id, Some(at)).await.unwrap();
        assert_eq!(store.get_expiration(&record.id).await.unwrap(), Some(at));
        assert_eq!(store.find_expired(Utc::now()).await.unwrap(), vec![record.id.clone()]);

        assert_eq!(store.purge_expired(&CancellationToken::new()).await.unwrap(), 1);
        assert!(!store.exists(&record.id).await.unwrap());
        store.terminate(&record.id).await.unwrap();
    }
}
