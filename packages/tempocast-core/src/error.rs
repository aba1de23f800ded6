//! Centralized error types for the Tempocast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to the numeric wire codes carried in `error` messages
//! - Implements `IntoResponse` for the HTTP status API

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable wire codes.
///
/// The numeric codes are part of the protocol: they appear in `error`
/// messages and must stay stable across releases.
pub trait ErrorCode {
    /// Returns the numeric wire code for `error` messages.
    fn code(&self) -> u16;
}

/// Application-wide error type for Tempocast peers.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum TempoError {
    /// Handshake refused: incompatible protocol major version.
    #[error("Protocol version mismatch: {0}")]
    VersionMismatch(String),

    /// Auth token invalid or missing.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// A per-session or per-address rate limit was exceeded.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// A scheduled action arrived past its execution deadline.
    #[error("Action past deadline: {0}")]
    TooLate(String),

    /// A message was not valid in the current session or track state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Scheduler queue depth exceeded its bound (telemetry, non-fatal).
    #[error("Queue pressure on track {0}")]
    QueuePressure(String),

    /// The underlying transport closed; triggers re-bind on clients.
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ErrorCode for TempoError {
    fn code(&self) -> u16 {
        match self {
            Self::VersionMismatch(_) => 1001,
            Self::AuthRejected(_) => 1002,
            Self::RateLimited(_) => 1003,
            Self::TooLate(_) => 1004,
            Self::InvalidState(_) => 1005,
            Self::QueuePressure(_) => 1006,
            Self::TransportClosed(_) => 1007,
            Self::Internal(_) => 1008,
        }
    }
}

impl TempoError {
    /// Whether the session should be closed after reporting this error.
    ///
    /// Rate limiting and state errors keep the session open; handshake and
    /// internal failures terminate it.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::VersionMismatch(_)
                | Self::AuthRejected(_)
                | Self::TransportClosed(_)
                | Self::Internal(_)
        )
    }

    /// Maps the error to an appropriate HTTP status code for the status API.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::VersionMismatch(_) | Self::InvalidState(_) | Self::TooLate(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::AuthRejected(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::QueuePressure(_) | Self::TransportClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Type Aliases
// ─────────────────────────────────────────────────────────────────────────────

/// Convenient Result alias for application-wide operations.
pub type TempoResult<T> = Result<T, TempoError>;

/// JSON response body for HTTP error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: u16,
    message: String,
    status: u16,
}

impl IntoResponse for TempoError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(TempoError::VersionMismatch("x".into()).code(), 1001);
        assert_eq!(TempoError::RateLimited("x".into()).code(), 1003);
        assert_eq!(TempoError::TooLate("x".into()).code(), 1004);
        assert_eq!(TempoError::Internal("x".into()).code(), 1008);
    }

    #[test]
    fn rate_limited_is_not_fatal() {
        assert!(!TempoError::RateLimited("probe flood".into()).is_fatal());
        assert_eq!(
            TempoError::RateLimited("probe flood".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn version_mismatch_is_fatal() {
        assert!(TempoError::VersionMismatch("3.0.0".into()).is_fatal());
    }
}
