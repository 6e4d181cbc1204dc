//! Centralized error types for the ZoneAmp core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the ZoneAmp controller.
///
/// Every public controller operation either commits fully or surfaces exactly
/// one of these; no partial mutation escapes the controller boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Entity id does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Type/range/enum validation failure on input.
    #[error("invalid field: {0}")]
    InvalidField(String),

    /// The candidate post-state would violate a cross-entity invariant.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Delete of a stream currently bound to a source.
    #[error("stream {0} is in use by source {1}")]
    InUse(u64, usize),

    /// Stream command issued while the stream is not attached to any source.
    #[error("stream {0} is not connected to any source")]
    NotBound(u64),

    /// The driver type does not implement the requested command.
    #[error("command {cmd} is not supported by {kind} streams")]
    UnsupportedCommand { kind: &'static str, cmd: String },

    /// Driver I/O exceeded its bound.
    #[error("stream driver timed out: {0}")]
    DriverTimeout(String),

    /// The hardware runtime reported failure; records whether the revert of
    /// already-applied effects succeeded.
    #[error("hardware failure: {reason}{}", if *.rolled_back { "" } else { " (rollback incomplete)" })]
    HardwareFailure { reason: String, rolled_back: bool },

    /// Internal logic error. Surfacing one of these means a bug, not bad input.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Returns a machine-readable error code for logs and API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidField(_) => "invalid_field",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::InUse(_, _) => "in_use",
            Self::NotBound(_) => "not_bound",
            Self::UnsupportedCommand { .. } => "unsupported_command",
            Self::DriverTimeout(_) => "driver_timeout",
            Self::HardwareFailure { .. } => "hardware_failure",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidField(_) | Self::InvariantViolation(_) | Self::UnsupportedCommand { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::InUse(_, _) | Self::NotBound(_) => StatusCode::CONFLICT,
            Self::DriverTimeout(_) | Self::HardwareFailure { .. } | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        log::debug!("[Api] {}: {}", self.code(), self);
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = ApiError::NotFound("zone 42".into());
        assert_eq!(err.code(), "not_found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn in_use_maps_to_409() {
        let err = ApiError::InUse(1000, 0);
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "stream 1000 is in use by source 0");
    }

    #[test]
    fn validation_errors_map_to_422() {
        assert_eq!(
            ApiError::InvalidField("vol out of range".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::InvariantViolation("dangling source".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn hardware_failure_reports_rollback_state() {
        let err = ApiError::HardwareFailure {
            reason: "bus write failed".into(),
            rolled_back: false,
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("rollback incomplete"));
    }
}
