//! Infrastructure error types with HTTP status code mapping.
//!
//! [`InfraError`] is the central error type for the crate. Database and
//! transaction errors propagate to callers; logging-pipeline errors
//! ([`InfraError::QueueTransport`], [`InfraError::Io`]) are absorbed inside
//! the logging subsystem and never reach application code.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Structured JSON error response body.
///
/// ```json
/// {
///   "error": {
///     "code": 5031,
///     "message": "service temporarily unavailable"
///   }
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and a caller-safe message.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Numeric error code.
    pub code: u32,
    /// Human-readable message. Never contains pool sizing or credentials.
    pub message: String,
}

/// Error enum for the pool, session and logging layers.
///
/// # Error Code Ranges
///
/// | Code | Variant          | HTTP Status                 |
/// |------|------------------|-----------------------------|
/// | 5031 | Connectivity     | 503 Service Unavailable     |
/// | 5032 | PoolExhausted    | 503 Service Unavailable     |
/// | 5001 | Transaction      | 500 Internal Server Error   |
/// | 5002 | QueueTransport   | 500 Internal Server Error   |
/// | 5003 | Config           | 500 Internal Server Error   |
/// | 5004 | Io               | 500 Internal Server Error   |
#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    /// The database (or another backing service) could not be reached.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// No connection became available within the checkout timeout.
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// Begin/commit/rollback failed, or a rollback-only transaction was
    /// asked to commit. The transaction has already been rolled back.
    #[error("transaction failure: {0}")]
    Transaction(String),

    /// Log transport (queue) failure. Internal to the logging pipeline.
    #[error("queue transport error: {0}")]
    QueueTransport(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem failure while persisting logs.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl InfraError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::Connectivity(_) => 5031,
            Self::PoolExhausted { .. } => 5032,
            Self::Transaction(_) => 5001,
            Self::QueueTransport(_) => 5002,
            Self::Config(_) => 5003,
            Self::Io(_) => 5004,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Connectivity(_) | Self::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Transaction(_) | Self::QueueTransport(_) | Self::Config(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns `true` for transient capacity/connectivity failures the
    /// caller may retry with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::PoolExhausted { .. })
    }

    /// Message shown to external callers. Internal details stay in logs.
    fn public_message(&self) -> &'static str {
        match self {
            Self::Connectivity(_) | Self::PoolExhausted { .. } => {
                "service temporarily unavailable"
            }
            _ => "internal server error",
        }
    }
}

impl From<redis::RedisError> for InfraError {
    fn from(err: redis::RedisError) -> Self {
        Self::QueueTransport(err.to_string())
    }
}

impl IntoResponse for InfraError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::error!(error = %self, code = self.error_code(), "request failed on infrastructure error");
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.public_message().to_string(),
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_map_to_service_unavailable() {
        let exhausted = InfraError::PoolExhausted {
            waited: Duration::from_secs(30),
        };
        assert_eq!(exhausted.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(exhausted.is_retryable());

        let down = InfraError::Connectivity("db.internal:5432 refused".to_string());
        assert_eq!(down.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(down.error_code(), 5031);
    }

    #[test]
    fn public_message_hides_internals() {
        let err = InfraError::Connectivity("postgres://app:secret@db:5432".to_string());
        assert!(!err.public_message().contains("secret"));

        let err = InfraError::Transaction("duplicate key".to_string());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.is_retryable());
    }
}
