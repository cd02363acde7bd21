use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Errors raised by the share store core (policy, registry, blob store,
/// reclaimer).
#[derive(Debug, Error)]
pub enum ShareError {
    #[error("upload denied: {0}")]
    UploadDenied(String),
    #[error("admin access is restricted to internal addresses")]
    AdminOnly,
    #[error("no file received")]
    MissingFile,
    #[error("invalid expiry value `{0}`")]
    InvalidExpiry(String),
    #[error("link not found")]
    NotFound,
    #[error("invalid network `{entry}`: {reason}")]
    InvalidNetwork { entry: String, reason: String },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("invalid storage key")]
    InvalidStorageKey,
    #[error("could not issue a unique token after {0} attempts")]
    TokenSpaceExhausted(usize),
    #[error("the reclaim scan this request joined did not complete")]
    ScanAborted,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Remote(#[from] object_store::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type ShareResult<T> = Result<T, ShareError>;

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

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
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

impl From<ShareError> for AppError {
    fn from(err: ShareError) -> Self {
        let status = match &err {
            ShareError::UploadDenied(_) | ShareError::AdminOnly => StatusCode::FORBIDDEN,
            ShareError::MissingFile
            | ShareError::InvalidExpiry(_)
            | ShareError::InvalidNetwork { .. }
            | ShareError::InvalidSettings(_) => StatusCode::BAD_REQUEST,
            ShareError::NotFound => StatusCode::NOT_FOUND,
            ShareError::ScanAborted => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
            // Backend details stay in the log.
            return AppError::new(status, "internal storage error");
        }
        AppError::new(status, err.to_string())
    }
}
