//! In-process backend.
//!
//! Keeps objects and multipart uploads in maps guarded by a mutex that is
//! never held across an await. Counts multipart calls and can be told to fail
//! object writes or to slow part uploads down, which is what the store's tests
//! lean on.

use super::{
    BackendError, BackendResult, ByteStream, CompletedPart, MultipartHandle, MultipartPage,
    ObjectBackend, ObjectPage, content_etag, multipart_etag,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::{
    collections::BTreeMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tracing::debug;

struct PendingUpload {
    key: String,
    initiated: DateTime<Utc>,
    parts: BTreeMap<i32, (Bytes, String)>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Bytes>,
    uploads: BTreeMap<String, PendingUpload>,
    next_upload: u64,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    part_delay: Mutex<Option<Duration>>,
    fail_puts: AtomicBool,
    part_uploads: AtomicUsize,
    completions: AtomicUsize,
    aborts: AtomicUsize,
    list_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain maps behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every following `put_object` fail with `Unavailable`.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Delay each part upload by `delay` before it is stored.
    pub fn set_part_delay(&self, delay: Option<Duration>) {
        *self
            .part_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }

    /// Pretend an upload was initiated at `initiated`.
    pub fn backdate_upload(&self, upload_id: &str, initiated: DateTime<Utc>) {
        if let Some(upload) = self.state().uploads.get_mut(upload_id) {
            upload.initiated = initiated;
        }
    }

    pub fn has_upload(&self, upload_id: &str) -> bool {
        self.state().uploads.contains_key(upload_id)
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state().objects.get(key).cloned()
    }

    /// Number of parts stored for an open upload.
    pub fn stored_parts(&self, upload_id: &str) -> usize {
        self.state()
            .uploads
            .get(upload_id)
            .map_or(0, |upload| upload.parts.len())
    }

    pub fn part_uploads(&self) -> usize {
        self.part_uploads.load(Ordering::SeqCst)
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    /// Abort calls, including those for unknown handles.
    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn put_object(&self, key: &str, body: Bytes) -> BackendResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(format!("put `{key}` rejected")));
        }
        self.state().objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> BackendResult<Option<Bytes>> {
        Ok(self.state().objects.get(key).cloned())
    }

    async fn open_object(&self, key: &str) -> BackendResult<Option<ByteStream>> {
        let body = self.state().objects.get(key).cloned();
        Ok(body.map(|body| stream::once(async move { Ok(body) }).boxed()))
    }

    async fn head_object(&self, key: &str) -> BackendResult<bool> {
        Ok(self.state().objects.contains_key(key))
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        self.state().objects.remove(key);
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
        max_keys: usize,
    ) -> BackendResult<ObjectPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        let mut keys: Vec<String> = state
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| continuation_token.as_deref().is_none_or(|after| key.as_str() > after))
            .take(max_keys.max(1) + 1)
            .cloned()
            .collect();

        let mut next_continuation_token = None;
        if keys.len() > max_keys.max(1) {
            keys.pop();
            next_continuation_token = keys.last().cloned();
        }
        Ok(ObjectPage {
            keys,
            next_continuation_token,
        })
    }

    async fn create_multipart_upload(&self, key: &str) -> BackendResult<String> {
        let mut state = self.state();
        state.next_upload += 1;
        let upload_id = format!("mem-upload-{:06}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                initiated: Utc::now(),
                parts: BTreeMap::new(),
            },
        );
        debug!(key, upload_id, "created in-memory multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> BackendResult<String> {
        self.part_uploads.fetch_add(1, Ordering::SeqCst);
        let delay = *self
            .part_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| BackendError::NoSuchUpload {
                upload_id: upload_id.to_string(),
            })?;
        let etag = content_etag(&body);
        upload.parts.insert(part_number, (body, etag.clone()));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| BackendError::NoSuchUpload {
                upload_id: upload_id.to_string(),
            })?;

        let mut assembled = BytesMut::new();
        let mut previous = 0;
        for part in parts {
            let invalid = |reason: &str| BackendError::InvalidPart {
                upload_id: upload_id.to_string(),
                part_number: part.part_number,
                reason: reason.to_string(),
            };
            if part.part_number <= previous {
                return Err(invalid("parts must be in ascending order"));
            }
            previous = part.part_number;
            let (body, etag) = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| invalid("part was never uploaded"))?;
            if *etag != part.etag {
                return Err(invalid("etag mismatch"));
            }
            assembled.extend_from_slice(body);
        }

        state.uploads.remove(upload_id);
        state.objects.insert(key.to_string(), assembled.freeze());
        let etags: Vec<&str> = parts.iter().map(|p| p.etag.as_str()).collect();
        debug!(key, upload_id, etag = %multipart_etag(&etags), "completed in-memory multipart upload");
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        match state.uploads.get(upload_id) {
            Some(upload) if upload.key == key => {
                state.uploads.remove(upload_id);
                Ok(())
            }
            _ => Err(BackendError::NoSuchUpload {
                upload_id: upload_id.to_string(),
            }),
        }
    }

    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
        max_uploads: usize,
    ) -> BackendResult<MultipartPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        let mut handles: Vec<MultipartHandle> = state
            .uploads
            .iter()
            .filter(|(_, upload)| upload.key.starts_with(prefix))
            .map(|(upload_id, upload)| MultipartHandle {
                key: upload.key.clone(),
                upload_id: upload_id.clone(),
                initiated: upload.initiated,
            })
            .collect();
        handles.sort_by(|a, b| (&a.key, &a.upload_id).cmp(&(&b.key, &b.upload_id)));

        let max_uploads = max_uploads.max(1);
        let mut uploads: Vec<MultipartHandle> = handles
            .into_iter()
            .filter(|h| {
                continuation_token
                    .as_deref()
                    .is_none_or(|after| marker(&h.key, &h.upload_id).as_str() > after)
            })
            .take(max_uploads + 1)
            .collect();

        let mut next_continuation_token = None;
        if uploads.len() > max_uploads {
            uploads.pop();
            next_continuation_token = uploads.last().map(|h| marker(&h.key, &h.upload_id));
        }
        Ok(MultipartPage {
            uploads,
            next_continuation_token,
        })
    }
}

/// Listing marker ordering the same way as `(key, upload_id)`.
fn marker(key: &str, upload_id: &str) -> String {
    format!("{key}\u{0}{upload_id}")
}
