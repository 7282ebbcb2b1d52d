//! Resumable, chunked uploads stored through an object store's multipart
//! upload primitive.
//!
//! [`services::store::UploadStore`] is the entry point. It runs against any
//! [`backend::ObjectBackend`]; [`backend::local::LocalBackend`] keeps
//! bookkeeping in SQLite and payloads on disk, [`backend::memory::MemoryBackend`]
//! keeps everything in process.

pub mod backend;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
