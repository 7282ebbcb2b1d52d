use crate::backend::BackendError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("upload `{0}` already exists")]
    AlreadyExists(String),
    #[error(
        "upload `{id}` overrun: {attempted} more bytes at offset {offset} exceed length {length}"
    )]
    ClientOverrun {
        id: String,
        offset: u64,
        length: u64,
        attempted: u64,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("upload `{id}` is incomplete ({offset} of {length} bytes)")]
    UploadIncomplete {
        id: String,
        offset: u64,
        length: i64,
    },
    #[error("upload `{0}` already has a declared length")]
    LengthAlreadyDeclared(String),
    #[error("invalid length {length} for upload `{id}`: {reason}")]
    InvalidLength {
        id: String,
        length: i64,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("state record `{key}` is corrupt: {source}")]
    CorruptState {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("metadata of upload `{id}` could not be decoded: {reason}")]
    InvalidMetadata { id: String, reason: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
