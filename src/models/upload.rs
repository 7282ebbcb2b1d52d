//! Per-upload state records persisted under the state prefix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel stored in `Size` while the client has not declared a length yet.
pub const DEFERRED_LENGTH: i64 = -1;

/// One committed part of a multipart upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PartRecord {
    /// Part number (1-based, contiguous in commit order).
    pub number: i32,

    /// Size in bytes.
    pub size: u64,

    /// ETag returned by the backend for this part.
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// Durable state of a single resumable upload.
///
/// The record is the only source of truth about how far an upload got: the
/// offset is advanced only after the part backing it was accepted by the
/// backend, and the record is written back before the commit is acknowledged.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct UploadRecord {
    /// File identifier handed out to the client.
    pub id: String,

    /// Backend multipart handle the parts are uploaded against.
    pub upload_id: String,

    /// Opaque metadata blob supplied at creation.
    #[serde(rename = "MetaData")]
    pub metadata: String,

    /// Declared total length, or [`DEFERRED_LENGTH`].
    pub size: i64,

    /// Bytes durably committed so far.
    pub offset: u64,

    /// Committed parts ordered by number.
    #[serde(default)]
    pub parts: Vec<PartRecord>,

    /// When the upload becomes eligible for the expiration sweep.
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,

    /// When the upload was created.
    pub created_at: DateTime<Utc>,
}

impl UploadRecord {
    pub fn new(id: String, upload_id: String, size: i64, metadata: String) -> Self {
        Self {
            id,
            upload_id,
            metadata,
            size,
            offset: 0,
            parts: Vec::new(),
            expires: None,
            created_at: Utc::now(),
        }
    }

    /// Declared length, `None` while deferred.
    pub fn length(&self) -> Option<u64> {
        u64::try_from(self.size).ok()
    }

    pub fn is_length_deferred(&self) -> bool {
        self.size == DEFERRED_LENGTH
    }

    /// True once every declared byte has been committed.
    pub fn is_complete(&self) -> bool {
        self.length() == Some(self.offset)
    }

    /// Bytes still expected, `None` while the length is deferred.
    pub fn remaining(&self) -> Option<u64> {
        self.length().map(|len| len.saturating_sub(self.offset))
    }

    /// Number the next committed part must carry.
    pub fn next_part_number(&self) -> i32 {
        self.parts.iter().map(|p| p.number).max().unwrap_or(0) + 1
    }

    /// Incomplete and past its expiration time.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_complete() && self.expires.is_some_and(|at| at <= now)
    }
}
