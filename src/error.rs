//! # Error Handling
//!
//! Every failure a request can hit on its way through the recognition pipeline is one
//! variant of [`AppError`]. Errors are request-scoped: a handler that returns one ends only
//! its own request, and the HTTP layer turns it into a non-2xx plain-text response.
//!
//! ## Response Format:
//! Error bodies are a single line, `<kind>: <message>`, so clients reading the
//! transcription line can tell a failure from a recognition result:
//! ```text
//! worker_unavailable: backend worker exited with exit status: 1
//! ```
//!
//! ## Status Mapping:
//! - BadRequest → 400, PayloadTooLarge → 413
//! - Storage / Internal / ConfigError → 500
//! - Transcode → 502 (the external converter misbehaved)
//! - WorkerUnavailable → 503 (sticky until the backend is restarted externally)
//! - Timeout → 504

use actix_web::http::{header::ContentType, StatusCode};
use actix_web::{HttpResponse, ResponseError};
use std::fmt;
use std::time::Duration;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::BadRequest("missing content type".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// The upload body could not be turned into audio bytes
    BadRequest(String),

    /// The upload exceeded the configured size limit (bytes received, limit)
    PayloadTooLarge { received: usize, limit: usize },

    /// The input directory is missing or unwritable
    Storage(String),

    /// The external converter failed to run, exited non-zero, or left no output
    Transcode(String),

    /// The backend process exited or its streams are closed
    WorkerUnavailable(String),

    /// A pipeline stage ran past its configured budget
    Timeout { stage: &'static str, after: Duration },

    /// Anything else that went wrong on the server side
    Internal(String),

    /// Configuration file or environment variable problems
    ConfigError(String),
}

impl AppError {
    /// Machine-readable error kind, used as the prefix of the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::PayloadTooLarge { .. } => "payload_too_large",
            AppError::Storage(_) => "storage_error",
            AppError::Transcode(_) => "transcode_error",
            AppError::WorkerUnavailable(_) => "worker_unavailable",
            AppError::Timeout { .. } => "timeout",
            AppError::Internal(_) => "internal_error",
            AppError::ConfigError(_) => "config_error",
        }
    }

    /// Human-readable detail without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            AppError::BadRequest(msg)
            | AppError::Storage(msg)
            | AppError::Transcode(msg)
            | AppError::WorkerUnavailable(msg)
            | AppError::Internal(msg)
            | AppError::ConfigError(msg) => msg.clone(),
            AppError::PayloadTooLarge { received, limit } => {
                format!("upload of {} bytes exceeds limit of {} bytes", received, limit)
            }
            AppError::Timeout { stage, after } => {
                format!("{} did not finish within {:.1}s", stage, after.as_secs_f64())
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::PayloadTooLarge { .. } => write!(f, "Payload too large: {}", self.message()),
            AppError::Storage(msg) => write!(f, "Storage error: {}", msg),
            AppError::Transcode(msg) => write!(f, "Transcode error: {}", msg),
            AppError::WorkerUnavailable(msg) => write!(f, "Worker unavailable: {}", msg),
            AppError::Timeout { .. } => write!(f, "Timeout: {}", self.message()),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into plain-text HTTP responses.
///
/// ## Body Format:
/// `<kind>: <message>\n`, e.g. `transcode_error: converter exited with exit status: 1\n`.
/// The body is never empty and never looks like a recognition result.
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Transcode(_) => StatusCode::BAD_GATEWAY,
            AppError::WorkerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .content_type(ContentType::plaintext())
            .body(format!("{}: {}\n", self.kind(), self.message()))
    }
}

/// Configuration loading failures (bad `config.toml`, unparsable environment values).
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_error_body_is_plain_text_with_kind() {
        let err = AppError::Transcode("converter exited with exit status: 1".to_string());
        let response = err.error_response();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let content_type = response
            .headers()
            .get(actix_web::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/plain"));

        let body = to_bytes(response.into_body()).await.unwrap();
        assert_eq!(
            body.as_ref(),
            b"transcode_error: converter exited with exit status: 1\n"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::WorkerUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Timeout { stage: "exchange", after: Duration::from_secs(2) }.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            AppError::PayloadTooLarge { received: 10, limit: 5 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = AppError::Timeout { stage: "transcode", after: Duration::from_millis(1500) };
        assert_eq!(err.message(), "transcode did not finish within 1.5s");
        assert_eq!(err.to_string(), "Timeout: transcode did not finish within 1.5s");
    }
}
