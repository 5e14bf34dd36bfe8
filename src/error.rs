use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::BackupClass;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("WAL not enabled: store journal mode is '{0}'")]
    WalNotEnabled(String),

    #[error("A {0} backup is already running")]
    BackupInProgress(BackupClass),

    #[error("Retention policy violation: {0}")]
    RetentionViolation(String),

    #[error("Integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("Archive row count mismatch: manifest has {expected}, {actual} rows affected")]
    ArchiveCountMismatch { expected: i64, actual: i64 },

    #[error("Primary store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Backup not found")]
    BackupNotFound,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

/// Implement IntoResponse to convert AppError into HTTP responses
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::Io(ref e) => {
                tracing::error!("I/O error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::Serialization(ref e) => {
                tracing::error!("Serialization error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::TaskJoin(ref e) => {
                tracing::error!("Task join error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::WalNotEnabled(_)
            | AppError::IntegrityFailure(_)
            | AppError::ArchiveCountMismatch { .. }
            | AppError::StoreUnavailable(_) => {
                tracing::error!("{}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::BackupInProgress(_) => (StatusCode::CONFLICT, self.to_string()),
            AppError::RetentionViolation(_) => {
                tracing::warn!("{}", self);
                (StatusCode::CONFLICT, self.to_string())
            }
            AppError::BackupNotFound => (StatusCode::NOT_FOUND, "Backup not found".to_string()),
            AppError::InvalidInput(ref msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Forbidden(ref msg) => {
                tracing::warn!("Forbidden request: {}", msg);
                (StatusCode::FORBIDDEN, msg.clone())
            }
        };

        let body = Json(json!({
            "error": error_message
        }));

        (status, body).into_response()
    }
}

/// Result type alias for application results
pub type Result<T> = std::result::Result<T, AppError>;
