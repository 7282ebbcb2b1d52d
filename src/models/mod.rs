//! Core data models.
//!
//! `upload` holds the per-upload state records the store persists through its
//! backend. `multipart` holds the rows the SQLite-backed backend keeps for its
//! own multipart bookkeeping; they map to tables via `sqlx::FromRow`.

pub mod multipart;
pub mod upload;
