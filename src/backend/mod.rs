//! Object store abstraction the upload store is written against.
//!
//! A backend offers plain object operations (used for state records and for
//! reading assembled files) plus the multipart primitive parts are committed
//! through. Backends may be eventually consistent: nothing in the store relies
//! on a write being visible to the next read.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use std::{io, sync::Arc};
use thiserror::Error;

/// Page size used when walking backend listings.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Stream of object bytes. Consumed at most once.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

pub type SharedBackend = Arc<dyn ObjectBackend>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("multipart upload `{upload_id}` not found")]
    NoSuchUpload { upload_id: String },
    #[error("object `{0}` not found")]
    NoSuchKey(String),
    #[error("invalid part {part_number} for upload `{upload_id}`: {reason}")]
    InvalidPart {
        upload_id: String,
        part_number: i32,
        reason: String,
    },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A part handed to [`ObjectBackend::complete_multipart_upload`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// One page of object keys.
#[derive(Debug, Default)]
pub struct ObjectPage {
    pub keys: Vec<String>,
    pub next_continuation_token: Option<String>,
}

/// An incomplete multipart upload visible at the backend.
#[derive(Clone, Debug)]
pub struct MultipartHandle {
    pub key: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

/// One page of incomplete multipart uploads.
#[derive(Debug, Default)]
pub struct MultipartPage {
    pub uploads: Vec<MultipartHandle>,
    pub next_continuation_token: Option<String>,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    /// Write a whole object, replacing any previous version.
    async fn put_object(&self, key: &str, body: Bytes) -> BackendResult<()>;

    /// Read a whole object into memory. `None` if absent.
    async fn get_object(&self, key: &str) -> BackendResult<Option<Bytes>>;

    /// Open an object for streaming. `None` if absent.
    async fn open_object(&self, key: &str) -> BackendResult<Option<ByteStream>>;

    async fn head_object(&self, key: &str) -> BackendResult<bool>;

    /// Delete an object. Deleting an absent key succeeds.
    async fn delete_object(&self, key: &str) -> BackendResult<()>;

    /// List keys starting with `prefix` in lexicographical order.
    async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
        max_keys: usize,
    ) -> BackendResult<ObjectPage>;

    /// Open a multipart upload for `key`, returning its upload id.
    async fn create_multipart_upload(&self, key: &str) -> BackendResult<String>;

    /// Upload one part, returning its ETag. Re-uploading a number replaces it.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> BackendResult<String>;

    /// Assemble `parts` (ordered by number) into the object at `key`.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()>;

    /// Discard an upload and its parts. Fails with
    /// [`BackendError::NoSuchUpload`] if the handle is unknown.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()>;

    /// List incomplete multipart uploads whose key starts with `prefix`.
    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
        max_uploads: usize,
    ) -> BackendResult<MultipartPage>;
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

impl Cursor {
    fn token(self) -> Option<Option<String>> {
        match self {
            Cursor::Start => Some(None),
            Cursor::Next(token) => Some(Some(token)),
            Cursor::Done => None,
        }
    }

    fn after(next: Option<String>) -> Self {
        next.map_or(Cursor::Done, Cursor::Next)
    }
}

/// Lazily walk every key under `prefix`, fetching one page at a time.
pub fn object_keys(
    backend: SharedBackend,
    prefix: String,
    page_size: usize,
) -> BoxStream<'static, BackendResult<String>> {
    stream::try_unfold(Cursor::Start, move |cursor| {
        key_page(backend.clone(), prefix.clone(), page_size, cursor)
    })
    .map_ok(|keys| stream::iter(keys.into_iter().map(Ok::<_, BackendError>)))
    .try_flatten()
    .boxed()
}

/// Lazily walk every incomplete multipart upload under `prefix`.
pub fn multipart_uploads(
    backend: SharedBackend,
    prefix: String,
    page_size: usize,
) -> BoxStream<'static, BackendResult<MultipartHandle>> {
    stream::try_unfold(Cursor::Start, move |cursor| {
        upload_page(backend.clone(), prefix.clone(), page_size, cursor)
    })
    .map_ok(|uploads| stream::iter(uploads.into_iter().map(Ok::<_, BackendError>)))
    .try_flatten()
    .boxed()
}

async fn key_page(
    backend: SharedBackend,
    prefix: String,
    page_size: usize,
    cursor: Cursor,
) -> BackendResult<Option<(Vec<String>, Cursor)>> {
    let Some(token) = cursor.token() else {
        return Ok(None);
    };
    let page = backend.list_objects(&prefix, token, page_size).await?;
    Ok(Some((page.keys, Cursor::after(page.next_continuation_token))))
}

async fn upload_page(
    backend: SharedBackend,
    prefix: String,
    page_size: usize,
    cursor: Cursor,
) -> BackendResult<Option<(Vec<MultipartHandle>, Cursor)>> {
    let Some(token) = cursor.token() else {
        return Ok(None);
    };
    let page = backend
        .list_multipart_uploads(&prefix, token, page_size)
        .await?;
    Ok(Some((page.uploads, Cursor::after(page.next_continuation_token))))
}

/// ETag of a payload: lowercase hex MD5.
pub(crate) fn content_etag(body: &[u8]) -> String {
    format!("{:x}", md5::compute(body))
}

/// ETag of an assembled multipart object: MD5 over the part digests, suffixed
/// with the part count.
pub(crate) fn multipart_etag(part_etags: &[&str]) -> String {
    let mut digest = md5::Context::new();
    for etag in part_etags {
        digest.consume(etag.as_bytes());
    }
    format!("{:x}-{}", digest.compute(), part_etags.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[tokio::test]
    async fn object_keys_walks_every_page() {
        let backend = Arc::new(MemoryBackend::new());
        for i in 0..7 {
            backend
                .put_object(&format!("state/{i}.info"), Bytes::from_static(b"{}"))
                .await
                .unwrap();
        }
        backend
            .put_object("other/x", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let keys: Vec<String> = object_keys(backend.clone(), "state/".into(), 3)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(keys.len(), 7);
        assert!(keys.iter().all(|k| k.starts_with("state/")));
        assert!(backend.list_calls() >= 3);
    }

    #[tokio::test]
    async fn multipart_uploads_walks_every_page() {
        let backend = Arc::new(MemoryBackend::new());
        for i in 0..5 {
            backend
                .create_multipart_upload(&format!("files/{i}"))
                .await
                .unwrap();
        }

        let handles: Vec<MultipartHandle> = multipart_uploads(backend.clone(), "files/".into(), 2)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(handles.len(), 5);
    }

    #[test]
    fn multipart_etag_counts_parts() {
        let etag = multipart_etag(&["a", "b", "c"]);
        assert!(etag.ends_with("-3"));
    }
}
