use crate::{backend::BackendError, services::error::StoreError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            StoreError::ClientOverrun { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            StoreError::UploadIncomplete { .. } | StoreError::LengthAlreadyDeclared(_) => {
                StatusCode::CONFLICT
            }
            StoreError::InvalidLength { .. } | StoreError::InvalidMetadata { .. } => {
                StatusCode::BAD_REQUEST
            }
            StoreError::Cancelled | StoreError::Backend(BackendError::Unavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            StoreError::InvalidConfig(_)
            | StoreError::CorruptState { .. }
            | StoreError::Backend(_)
            | StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_statuses() {
        let cases = [
            (StoreError::NotFound("a".into()), StatusCode::NOT_FOUND),
            (
                StoreError::UploadIncomplete {
                    id: "a".into(),
                    offset: 1,
                    length: 2,
                },
                StatusCode::CONFLICT,
            ),
            (StoreError::Cancelled, StatusCode::SERVICE_UNAVAILABLE),
            (
                StoreError::Backend(BackendError::NoSuchKey("k".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn message_is_kept() {
        let err = AppError::from(StoreError::NotFound("abc".into()));
        assert!(err.to_string().contains("abc"));
    }
}
