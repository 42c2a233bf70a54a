use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::attendance::AttendanceError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Attendance(#[from] AttendanceError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code for clients
    fn code(&self) -> &'static str {
        match self {
            AppError::Attendance(AttendanceError::AlreadyCheckedIn) => "already_checked_in",
            AppError::Attendance(AttendanceError::NotCheckedIn) => "not_checked_in",
            AppError::Attendance(AttendanceError::InvalidRange(_)) => "invalid_range",
            AppError::Attendance(AttendanceError::QrToken(_)) => "invalid_qr_token",
            AppError::Attendance(AttendanceError::Storage(_)) => "storage_error",
            AppError::Validation(_) => "validation_error",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();

        let (status, message) = match self {
            AppError::Attendance(err @ AttendanceError::AlreadyCheckedIn)
            | AppError::Attendance(err @ AttendanceError::NotCheckedIn) => {
                (StatusCode::CONFLICT, err.to_string())
            }
            AppError::Attendance(err @ AttendanceError::InvalidRange(_))
            | AppError::Attendance(err @ AttendanceError::QrToken(_)) => {
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            AppError::Attendance(AttendanceError::Storage(e)) => {
                tracing::error!(error = %e, "Storage failure while handling request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Storage error".to_string(),
                )
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Internal(e) => {
                tracing::error!(error = %e, "Internal error while handling request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
