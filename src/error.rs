//! Error types for chatbridge.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

/// Result type alias for chatbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chatbridge.
///
/// Everything here surfaces before the first chunk of a turn is written.
/// Failures after that point travel in-band as a terminal error chunk
/// (see [`crate::translate::spawn_turn`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("No provider serves model '{model}'")]
    UnknownModel { model: String },

    #[error("A turn is already in progress for conversation '{key}'")]
    SessionConflict { key: String },

    #[error("Session '{key}' not found")]
    SessionNotFound { key: String },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Browser binding error: {0}")]
    Browser(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Upstream timed out: {0}")]
    Timeout(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::UnknownModel { .. } => StatusCode::NOT_FOUND,
            Error::SessionConflict { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            Error::Provider(_) => StatusCode::BAD_GATEWAY,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Browser(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        // Return OpenAI-compatible error format
        let body = serde_json::json!({
            "error": {
                "message": message,
                "type": "chatbridge_error",
                "code": status.as_u16()
            }
        });

        let mut response = (status, axum::Json(body)).into_response();
        if matches!(self, Error::SessionConflict { .. }) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
