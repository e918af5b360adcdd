//! Error types for notefed
//!
//! All errors in the crate are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.
//! Inbound federation failures are reported to the remote peer as
//! `{"error": "..."}` with a 4xx status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Invalid input, including malformed activities (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The effect already exists for this dedup key (400)
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Local signing failed, e.g. the private key could not be decrypted (500)
    #[error("Signature failed: {0}")]
    SignatureFailed(String),

    /// Inbound Signature header is missing fields or uses another algorithm (400)
    #[error("Signature parse failed: {0}")]
    SignatureParseFailed(String),

    /// Inbound signature does not match the request (400)
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// The signer's actor document could not provide a usable key (400)
    #[error("Public key fetch failed: {0}")]
    PublicKeyFetchFailed(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Encryption/decryption error (500)
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(anyhow::anyhow!("Migration failed: {}", err))
    }
}

impl AppError {
    /// HTTP status and metric label for this error
    pub fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            AppError::Duplicate(_) => (StatusCode::BAD_REQUEST, "duplicate"),
            AppError::SignatureParseFailed(_) => {
                (StatusCode::BAD_REQUEST, "signature_parse_failed")
            }
            AppError::InvalidSignature(_) => (StatusCode::BAD_REQUEST, "invalid_signature"),
            AppError::PublicKeyFetchFailed(_) => {
                (StatusCode::BAD_REQUEST, "public_key_fetch_failed")
            }
            AppError::SignatureFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "signature_failed")
            }
            AppError::Federation(_) => (StatusCode::BAD_GATEWAY, "federation"),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, "http_client"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
            AppError::Encryption(_) => (StatusCode::INTERNAL_SERVER_ERROR, "encryption"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Client-facing messages are kept for 4xx errors; server-side
    /// failures are reported generically and logged instead.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_type) = self.status_and_type();
        let error_message = match &self {
            AppError::NotFound(msg)
            | AppError::Validation(msg)
            | AppError::Duplicate(msg)
            | AppError::SignatureParseFailed(msg)
            | AppError::InvalidSignature(msg)
            | AppError::PublicKeyFetchFailed(msg) => msg.clone(),
            AppError::Forbidden => self.to_string(),
            AppError::Federation(msg) => msg.clone(),
            AppError::HttpClient(_) => "Upstream request failed".to_string(),
            _ => {
                tracing::error!(error = %self, "Request failed with server error");
                "Internal server error".to_string()
            }
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[error_type])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
