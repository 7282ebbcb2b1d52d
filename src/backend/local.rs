//! src/backend/local.rs
//!
//! LocalBackend — an object backend backed by SQLite for bookkeeping and local
//! disk for payloads. Objects are sharded beneath
//! `base_path/objects/{shard}/{shard}/{key}`; parts of an open multipart upload
//! live under `base_path/multipart/{upload_id}/` until the upload is completed
//! or aborted.

use super::{
    BackendError, BackendResult, ByteStream, CompletedPart, MultipartHandle, MultipartPage,
    ObjectBackend, ObjectPage, content_etag, multipart_etag,
};
use crate::models::multipart::{MultipartPart, MultipartUpload, StoredObject};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

/// Schema applied by [`LocalBackend::migrate`].
pub const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MAX_PART_NUMBER: i32 = 10_000;

#[derive(Clone)]
pub struct LocalBackend {
    /// Shared SQLite connection pool used for bookkeeping.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,
}

impl LocalBackend {
    /// Create a backend using `db` for bookkeeping and `base_path` as the
    /// root directory for payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Apply the embedded schema, one statement at a time.
    pub async fn migrate(&self) -> BackendResult<()> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Run a trivial query against SQLite.
    pub async fn check_database(&self) -> Result<(), String> {
        match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await
        {
            Ok(1) => Ok(()),
            Ok(v) => Err(format!("unexpected result: {}", v)),
            Err(e) => Err(format!("error: {}", e)),
        }
    }

    /// Write, read back and delete a scratch file under `base_path`.
    pub async fn check_disk(&self) -> Result<(), String> {
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz")
            .await
            .map_err(|e| format!("could not write tmp file: {}", e))?;
        let read = fs::read(&tmp_path).await;
        // best-effort cleanup either way
        let _ = fs::remove_file(&tmp_path).await;
        match read {
            Ok(bytes) if bytes == b"readyz" => Ok(()),
            Ok(_) => Err("file content mismatch".to_string()),
            Err(e) => Err(format!("could not read tmp file: {}", e)),
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(key: &str) -> BackendResult<()> {
        let invalid = || BackendError::InvalidKey(key.to_string());
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(invalid());
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    /// Upload ids are generated here; anything else cannot name an upload.
    fn ensure_upload_id_safe(upload_id: &str) -> BackendResult<()> {
        if !upload_id.is_empty() && upload_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(())
        } else {
            Err(BackendError::NoSuchUpload {
                upload_id: upload_id.to_string(),
            })
        }
    }

    fn objects_root(&self) -> PathBuf {
        self.base_path.join("objects")
    }

    /// Two-level shard identifiers: the first two bytes of MD5(key) as hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.objects_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join("multipart").join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: i32) -> PathBuf {
        self.upload_dir(upload_id).join(format!("{:05}", part_number))
    }

    /// Open a temp file next to `dest`, creating parent directories.
    async fn create_temp_beside(dest: &Path) -> io::Result<(PathBuf, File)> {
        let parent = dest.parent().map(Path::to_path_buf).ok_or_else(|| {
            io::Error::new(ErrorKind::Other, "payload path missing parent directory")
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;
        Ok((tmp_path, file))
    }

    /// Flush + fsync `file` and atomically rename it onto `dest`.
    /// Removes the temp file on failure.
    async fn persist_temp(tmp_path: &Path, mut file: File, dest: &Path) -> io::Result<()> {
        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = synced {
            let _ = fs::remove_file(tmp_path).await;
            return Err(err);
        }
        drop(file);

        if let Err(err) = fs::rename(tmp_path, dest).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(dest).await?;
                fs::rename(tmp_path, dest).await?;
            } else {
                let _ = fs::remove_file(tmp_path).await;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn write_atomically(dest: &Path, body: &[u8]) -> io::Result<()> {
        let (tmp_path, mut file) = Self::create_temp_beside(dest).await?;
        if let Err(err) = file.write_all(body).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        Self::persist_temp(&tmp_path, file, dest).await
    }

    async fn fetch_object(&self, key: &str) -> BackendResult<Option<StoredObject>> {
        Ok(sqlx::query_as::<_, StoredObject>(
            "SELECT key, size_bytes, etag, last_modified FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Fetch an open upload, failing with NoSuchUpload when it is unknown or
    /// belongs to another key.
    async fn fetch_upload(&self, key: &str, upload_id: &str) -> BackendResult<MultipartUpload> {
        Self::ensure_upload_id_safe(upload_id)?;
        sqlx::query_as::<_, MultipartUpload>(
            "SELECT upload_id, key, initiated_at FROM multipart_uploads WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?
        .filter(|upload| upload.key == key)
        .ok_or_else(|| BackendError::NoSuchUpload {
            upload_id: upload_id.to_string(),
        })
    }

    async fn upsert_object(&self, key: &str, size_bytes: i64, etag: &str) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO objects (key, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(key)
        .bind(size_bytes)
        .bind(etag)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Drop the bookkeeping rows of an upload. Returns false if it was unknown.
    async fn forget_upload(&self, key: &str, upload_id: &str) -> BackendResult<bool> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM multipart_uploads WHERE upload_id = ? AND key = ?")
            .bind(upload_id)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_upload_dir(&self, upload_id: &str) {
        let dir = self.upload_dir(upload_id);
        if let Err(err) = fs::remove_dir_all(&dir).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove upload directory {}: {}",
                    dir.display(),
                    err
                );
            }
        }
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectBackend for LocalBackend {
    /// Write bytes to a temp file, rename into place, then upsert the row.
    async fn put_object(&self, key: &str, body: Bytes) -> BackendResult<()> {
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        Self::write_atomically(&file_path, &body).await?;

        if let Err(err) = self
            .upsert_object(key, body.len() as i64, &content_etag(&body))
            .await
        {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }
        Ok(())
    }

    async fn get_object(&self, key: &str) -> BackendResult<Option<Bytes>> {
        Self::ensure_key_safe(key)?;
        if self.fetch_object(key).await?.is_none() {
            return Ok(None);
        }
        match fs::read(self.object_path(key)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn open_object(&self, key: &str) -> BackendResult<Option<ByteStream>> {
        Self::ensure_key_safe(key)?;
        if self.fetch_object(key).await?.is_none() {
            return Ok(None);
        }
        match File::open(self.object_path(key)).await {
            Ok(file) => Ok(Some(ReaderStream::new(file).boxed())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn head_object(&self, key: &str) -> BackendResult<bool> {
        Self::ensure_key_safe(key)?;
        Ok(self.fetch_object(key).await?.is_some())
    }

    /// Delete the row, then the payload, then prune empty shard directories.
    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        Self::ensure_key_safe(key)?;
        sqlx::query("DELETE FROM objects WHERE key = ?")
            .bind(key)
            .execute(&*self.db)
            .await?;

        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(err.into()),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.objects_root()).await;
        }
        Ok(())
    }

    /// Keyset pagination in key order; tokens are base64-encoded keys.
    async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
        max_keys: usize,
    ) -> BackendResult<ObjectPage> {
        let max_keys = max_keys.clamp(1, 1000);
        let after = continuation_token
            .as_deref()
            .map(decode_continuation_token)
            .unwrap_or_default();

        let mut keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM objects
             WHERE substr(key, 1, length(?1)) = ?1 AND key > ?2
             ORDER BY key ASC LIMIT ?3",
        )
        .bind(prefix)
        .bind(&after)
        .bind((max_keys + 1) as i64)
        .fetch_all(&*self.db)
        .await?;

        let mut next_continuation_token = None;
        if keys.len() > max_keys {
            keys.pop();
            next_continuation_token = keys.last().map(|key| encode_continuation_token(key));
        }
        Ok(ObjectPage {
            keys,
            next_continuation_token,
        })
    }

    async fn create_multipart_upload(&self, key: &str) -> BackendResult<String> {
        Self::ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        sqlx::query(
            "INSERT INTO multipart_uploads (upload_id, key, initiated_at) VALUES (?, ?, ?)",
        )
        .bind(&upload_id)
        .bind(key)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        fs::create_dir_all(self.upload_dir(&upload_id)).await?;
        debug!(key, upload_id, "initiated local multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> BackendResult<String> {
        Self::ensure_key_safe(key)?;
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(BackendError::InvalidPart {
                upload_id: upload_id.to_string(),
                part_number,
                reason: format!("part numbers range from 1 to {}", MAX_PART_NUMBER),
            });
        }
        self.fetch_upload(key, upload_id).await?;

        let path = self.part_path(upload_id, part_number);
        Self::write_atomically(&path, &body).await?;

        let etag = content_etag(&body);
        sqlx::query(
            r#"
            INSERT INTO multipart_parts (upload_id, part_number, size_bytes, etag, uploaded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(upload_id, part_number) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                uploaded_at = excluded.uploaded_at
            "#,
        )
        .bind(upload_id)
        .bind(part_number)
        .bind(body.len() as i64)
        .bind(&etag)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(etag)
    }

    /// Concatenate the listed parts into a temp file, rename it onto the
    /// object path, record the object and drop the upload.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()> {
        Self::ensure_key_safe(key)?;
        self.fetch_upload(key, upload_id).await?;

        let stored: HashMap<i32, MultipartPart> = sqlx::query_as::<_, MultipartPart>(
            "SELECT upload_id, part_number, size_bytes, etag, uploaded_at
             FROM multipart_parts WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?
        .into_iter()
        .map(|part| (part.part_number, part))
        .collect();

        let mut previous = 0;
        let mut size_bytes = 0;
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
            let row = stored
                .get(&part.part_number)
                .ok_or_else(|| invalid("part was never uploaded"))?;
            if row.etag != part.etag {
                return Err(invalid("etag mismatch"));
            }
            size_bytes += row.size_bytes;
        }

        let file_path = self.object_path(key);
        let (tmp_path, mut file) = Self::create_temp_beside(&file_path).await?;
        for part in parts {
            let copied = async {
                let mut src = File::open(self.part_path(upload_id, part.part_number)).await?;
                tokio::io::copy(&mut src, &mut file).await
            }
            .await;
            if let Err(err) = copied {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        }
        Self::persist_temp(&tmp_path, file, &file_path).await?;

        let etags: Vec<&str> = parts.iter().map(|p| p.etag.as_str()).collect();
        let etag = multipart_etag(&etags);
        if let Err(err) = self.upsert_object(key, size_bytes, &etag).await {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }

        self.forget_upload(key, upload_id).await?;
        self.remove_upload_dir(upload_id).await;
        info!(key, upload_id, etag = %etag, size_bytes, "completed local multipart upload");
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        Self::ensure_key_safe(key)?;
        Self::ensure_upload_id_safe(upload_id)?;
        if !self.forget_upload(key, upload_id).await? {
            return Err(BackendError::NoSuchUpload {
                upload_id: upload_id.to_string(),
            });
        }
        self.remove_upload_dir(upload_id).await;
        debug!(key, upload_id, "aborted local multipart upload");
        Ok(())
    }

    /// Keyset pagination over `(key, upload_id)`.
    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
        max_uploads: usize,
    ) -> BackendResult<MultipartPage> {
        let max_uploads = max_uploads.clamp(1, 1000);
        let (after_key, after_id) = continuation_token
            .as_deref()
            .map(decode_continuation_token)
            .and_then(|marker| {
                marker
                    .split_once('\0')
                    .map(|(key, id)| (key.to_string(), id.to_string()))
            })
            .unwrap_or_default();

        let mut rows: Vec<MultipartUpload> = sqlx::query_as::<_, MultipartUpload>(
            "SELECT upload_id, key, initiated_at FROM multipart_uploads
             WHERE substr(key, 1, length(?1)) = ?1
               AND (key > ?2 OR (key = ?2 AND upload_id > ?3))
             ORDER BY key ASC, upload_id ASC LIMIT ?4",
        )
        .bind(prefix)
        .bind(&after_key)
        .bind(&after_id)
        .bind((max_uploads + 1) as i64)
        .fetch_all(&*self.db)
        .await?;

        let mut next_continuation_token = None;
        if rows.len() > max_uploads {
            rows.pop();
            next_continuation_token = rows
                .last()
                .map(|last| encode_continuation_token(&format!("{}\0{}", last.key, last.upload_id)));
        }

        let uploads = rows
            .into_iter()
            .map(|row| MultipartHandle {
                key: row.key,
                upload_id: row.upload_id,
                initiated: row.initiated_at,
            })
            .collect();
        Ok(MultipartPage {
            uploads,
            next_continuation_token,
        })
    }
}

fn encode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

fn decode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}
