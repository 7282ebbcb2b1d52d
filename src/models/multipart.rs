//! Multipart bookkeeping rows kept by the SQLite-backed [`LocalBackend`].
//!
//! [`LocalBackend`]: crate::backend::local::LocalBackend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A multipart upload session, initiated before any part is uploaded.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartUpload {
    /// Unique upload ID (returned to the caller).
    pub upload_id: String,

    /// Object key the parts will be assembled into.
    pub key: String,

    /// Timestamp when the upload was initiated.
    pub initiated_at: DateTime<Utc>,
}

/// A single uploaded part of a multipart upload session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartPart {
    /// Parent upload session.
    pub upload_id: String,

    /// Part number (1-based).
    pub part_number: i32,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the part payload.
    pub etag: String,

    /// Timestamp when this part was uploaded.
    pub uploaded_at: DateTime<Utc>,
}

/// An assembled object.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Full object key.
    pub key: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of a single-put payload, or the multipart ETag (`<md5>-<parts>`).
    pub etag: String,

    /// Timestamp when the object was last written.
    pub last_modified: DateTime<Utc>,
}
