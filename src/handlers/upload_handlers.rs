//! Operational endpoints over the upload store.
//!
//! The resumable protocol itself is served by the host engine; these routes
//! let operators inspect, expire and remove uploads.

use crate::{errors::AppError, models::upload::UploadRecord, routes::AppState};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Serialize)]
pub struct ExpiredResponse {
    pub ids: Vec<String>,
}

#[derive(Serialize)]
pub struct PurgeResponse {
    pub orphans_aborted: usize,
    pub expired_purged: usize,
    pub total: usize,
}

/// `GET /uploads/expired`
pub async fn list_expired(State(state): State<AppState>) -> Result<Json<ExpiredResponse>, AppError> {
    let ids = state.store.find_expired(Utc::now()).await?;
    Ok(Json(ExpiredResponse { ids }))
}

/// `POST /uploads/purge`
///
/// Runs a reconcile pass right away. The pass is bound to server shutdown,
/// not to the request.
pub async fn purge(State(state): State<AppState>) -> Result<Json<PurgeResponse>, AppError> {
    let cancel: CancellationToken = state.shutdown.child_token();
    let report = state.store.reconcile(&cancel).await?;
    Ok(Json(PurgeResponse {
        orphans_aborted: report.orphans_aborted,
        expired_purged: report.expired_purged,
        total: report.total(),
    }))
}

/// `GET /uploads/{id}`
pub async fn get_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UploadRecord>, AppError> {
    Ok(Json(state.store.get_info(&id).await?))
}

/// `DELETE /uploads/{id}`
pub async fn delete_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.store.terminate(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
