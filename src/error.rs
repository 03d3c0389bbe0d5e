//! Error types for the admission service.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Main error type for admission operations.
///
/// A denial is not an error: it is a normal [`RateLimitDecision`](crate::ratelimit::RateLimitDecision)
/// with `allowed == false`.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Configuration-related errors, including an unreachable backend at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration could not be read or deserialized
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// The shared backend rejected or failed a command
    #[error("Backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// The shared backend did not answer within the deadline
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered with something we could not interpret
    #[error("Unexpected backend reply: {0}")]
    UnexpectedReply(String),

    /// Malformed client input on a management endpoint
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A management request did not name the key it is about
    #[error("{0}")]
    MissingKey(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdmissionError {
    /// Whether this error came from talking to the limiter backend.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            AdmissionError::Backend(_)
                | AdmissionError::Timeout(_)
                | AdmissionError::UnexpectedReply(_)
        )
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            AdmissionError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "Invalid request"),
            AdmissionError::MissingKey(_) => (StatusCode::BAD_REQUEST, "Missing key"),
            e if e.is_backend() => (StatusCode::SERVICE_UNAVAILABLE, "Rate limiter unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
        };

        let body = serde_json::json!({
            "error": error,
            "details": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

/// Result type alias for admission operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_classification() {
        assert!(AdmissionError::Timeout(Duration::from_secs(5)).is_backend());
        assert!(AdmissionError::UnexpectedReply("nil".into()).is_backend());
        assert!(!AdmissionError::Config("bad".into()).is_backend());
        assert!(!AdmissionError::InvalidInput("key".into()).is_backend());
    }

    #[test]
    fn test_status_codes() {
        let response = AdmissionError::InvalidInput("missing key".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = AdmissionError::MissingKey("key parameter is required".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = AdmissionError::Timeout(Duration::from_secs(1)).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = AdmissionError::Config("nope".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
