//! Operational routes of the upload daemon.
//!
//! - `GET    /healthz`          — liveness
//! - `GET    /readyz`           — SQLite + disk readiness
//! - `GET    /uploads/expired`  — ids of expired, incomplete uploads
//! - `POST   /uploads/purge`    — run a reconcile pass now
//! - `GET    /uploads/{id}`     — upload state record
//! - `DELETE /uploads/{id}`     — terminate an upload

use crate::{
    backend::local::LocalBackend,
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{delete_upload, get_upload, list_expired, purge},
    },
    services::store::UploadStore,
};
use axum::{
    Router,
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: UploadStore,
    /// Probed by `/readyz`.
    pub local: LocalBackend,
    /// Fires when the server shuts down.
    pub shutdown: CancellationToken,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // static segments win over `{id}`
        .route("/uploads/expired", get(list_expired))
        .route("/uploads/purge", post(purge))
        .route("/uploads/{id}", get(get_upload).delete(delete_upload))
}
