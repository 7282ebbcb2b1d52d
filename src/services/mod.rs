//! Upload store components, bottom-up: part planning, state records, the
//! multipart lifecycle, ingestion, expiration and the read view. [`store`]
//! composes them.

pub mod coordinator;
pub mod error;
pub mod ingest;
pub mod part_size;
pub mod reader;
pub mod reconciler;
pub mod state_store;
pub mod store;
