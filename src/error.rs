//! # Error Handling
//!
//! HTTP-facing error type. Job sessions report their failures over the
//! WebSocket as `error` status events (see `pipeline::error::JobError`);
//! everything served over plain HTTP goes through [`AppError`].
//!
//! ## Key Rust Concepts:
//! - **Enums for error types**: one variant per kind of failure, each holding a message
//! - **From trait**: lets `?` convert library errors into `AppError` automatically
//! - **ResponseError trait**: actix turns a returned `AppError` into a JSON response

use crate::pipeline::error::JobError;
use crate::pipeline::storage::DownloadError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by the HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: server-side problems (500)
/// - **BadRequest**: the client sent something unusable (400)
/// - **NotFound**: the requested object does not exist (404)
/// - **Forbidden**: a download link was tampered with or expired (403)
/// - **ConfigError**: configuration problems (500)
/// - **ValidationError**: a config update failed validation (400)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    Forbidden(String),
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        }
    }
}

/// Every error is rendered as:
/// ```json
/// {
///   "error": {
///     "type": "forbidden",
///     "message": "download link expired",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON errors are almost always malformed client input, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Used by the source validation endpoint, which reuses the job pipeline.
impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::InvalidSource(_) | JobError::SourceUnavailable(_) => {
                AppError::BadRequest(err.user_message().to_string())
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<DownloadError> for AppError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::InvalidKey => AppError::NotFound(err.to_string()),
            DownloadError::BadSignature | DownloadError::Expired => AppError::Forbidden(err.to_string()),
        }
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
