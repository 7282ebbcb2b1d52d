use bytes::Bytes;
use futures::{TryStreamExt, stream};
use sqlx::sqlite::SqlitePoolOptions;
use std::{io, sync::Arc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tus_object_store::{
    backend::{SharedBackend, local::LocalBackend, memory::MemoryBackend},
    config::StoreConfig,
    models::upload::DEFERRED_LENGTH,
    services::{error::StoreError, ingest::WriteStatus, store::UploadStore},
};

async fn local_backend() -> (SharedBackend, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let backend = LocalBackend::new(Arc::new(pool), dir.path());
    backend.migrate().await.unwrap();
    (Arc::new(backend), dir)
}

fn body(len: usize) -> impl futures::Stream<Item = io::Result<Bytes>> + Send + Unpin {
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    stream::iter(vec![Ok(Bytes::from(data))])
}

async fn create_write_read_delete(backend: SharedBackend) {
    let config = StoreConfig::default();
    let store = UploadStore::new(backend.clone(), &config).unwrap();
    let cancel = CancellationToken::new();

    let record = store.create(1000, "name world").await.unwrap();
    let id = record.id.clone();

    let first = store.write_stream(&id, body(400), &cancel).await.unwrap();
    assert_eq!(first.bytes_written, 400);
    assert_eq!(first.status, WriteStatus::Drained);
    let info = store.get_info(&id).await.unwrap();
    assert_eq!(info.offset, 400);
    assert_eq!(info.parts.len(), 1);

    let second = store.write_stream(&id, body(600), &cancel).await.unwrap();
    assert_eq!(second.bytes_written, 600);
    assert_eq!(second.status, WriteStatus::Completed);
    assert_eq!(store.get_info(&id).await.unwrap().offset, 1000);

    let chunks: Vec<Bytes> = store
        .get_content(&id)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let content = chunks.concat();
    assert_eq!(content.len(), 1000);
    assert_eq!(content[400], 0);

    store.terminate(&id).await.unwrap();
    assert!(!store.exists(&id).await.unwrap());
    let object_key = format!("{}{}", config.object_prefix, id);
    assert!(!backend.head_object(&object_key).await.unwrap());
    let handles = backend
        .list_multipart_uploads(&config.object_prefix, None, 10)
        .await
        .unwrap();
    assert!(handles.uploads.is_empty());
}

async fn deferred_length_then_overrun(backend: SharedBackend) {
    let store = UploadStore::new(backend, &StoreConfig::default()).unwrap();
    let cancel = CancellationToken::new();

    let record = store.create(DEFERRED_LENGTH, "").await.unwrap();
    let id = record.id;
    store.declare_length(&id, 500).await.unwrap();

    let written = store.write_stream(&id, body(300), &cancel).await.unwrap();
    assert_eq!(written.offset, 300);

    let err = store.write_stream(&id, body(250), &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::ClientOverrun {
            offset: 300,
            length: 500,
            ..
        }
    ));
    assert_eq!(store.get_info(&id).await.unwrap().offset, 300);

    let last = store.write_stream(&id, body(200), &cancel).await.unwrap();
    assert_eq!(last.status, WriteStatus::Completed);
    assert_eq!(last.offset, 500);

    let chunks: Vec<Bytes> = store
        .get_content(&id)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(chunks.concat().len(), 500);
}

#[tokio::test]
async fn end_to_end_in_memory() {
    create_write_read_delete(Arc::new(MemoryBackend::new())).await;
}

#[tokio::test]
async fn end_to_end_on_local_backend() {
    let (backend, _dir) = local_backend().await;
    create_write_read_delete(backend).await;
}

#[tokio::test]
async fn deferred_length_in_memory() {
    deferred_length_then_overrun(Arc::new(MemoryBackend::new())).await;
}

#[tokio::test]
async fn deferred_length_on_local_backend() {
    let (backend, _dir) = local_backend().await;
    deferred_length_then_overrun(backend).await;
}

#[tokio::test]
async fn reconcile_on_local_backend_aborts_orphans() {
    let (backend, _dir) = local_backend().await;
    let config = StoreConfig {
        orphan_grace: std::time::Duration::ZERO,
        ..StoreConfig::default()
    };
    let store = UploadStore::new(backend.clone(), &config).unwrap();
    let kept = store.create(10, "").await.unwrap();
    let orphan = backend
        .create_multipart_upload(&format!("{}stray", config.object_prefix))
        .await
        .unwrap();

    let report = store.reconcile(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.orphans_aborted, 1);

    let remaining = backend
        .list_multipart_uploads(&config.object_prefix, None, 10)
        .await
        .unwrap();
    let ids: Vec<String> = remaining.uploads.into_iter().map(|h| h.upload_id).collect();
    assert_eq!(ids, vec![kept.upload_id]);
    assert!(!ids.contains(&orphan));
}
