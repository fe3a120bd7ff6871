//! # Error Handling Module
//!
//! Defines the service error taxonomy used throughout the gateway and its
//! mapping onto HTTP responses. Every error that surfaces during route
//! handling is converted into a uniform JSON envelope:
//!
//! ```json
//! { "error": "<kind-tag>", "description": "...", "request_id": "..." }
//! ```
//!
//! Each error carries a client-facing `description` and an optional internal
//! `log` detail. When `log` is present it is what operators see in the logs
//! while `description` remains the payload returned to the caller.

use axum::http::StatusCode;
use thiserror::Error;

/// Main result type used throughout the gateway.
pub type GatewayResult<T> = Result<T, ServiceError>;

/// Raised by the environment when a path cannot be resolved.
///
/// Callers never distinguish sub-causes (missing key, index out of range,
/// malformed path syntax); they only detect-and-report. Operations catch this
/// at their boundary and re-raise it as a configuration [`ServiceError`].
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{0}")]
pub struct ReferenceError(pub String);

impl ReferenceError {
    pub fn new<S: Into<String>>(cause: S) -> Self {
        Self(cause.into())
    }
}

/// The closed error taxonomy for route handling.
///
/// Each variant maps to a fixed HTTP status and a stable `error` tag in the
/// response envelope. Unclassified failures must be wrapped into `Internal`
/// before they reach the response boundary.
#[derive(Debug, Error, Clone)]
pub enum ServiceError {
    #[error("{}", .0.display())]
    BadRequest(ErrorDetail),

    #[error("{}", .0.display())]
    Authorization(ErrorDetail),

    #[error("{}", .0.display())]
    Forbidden(ErrorDetail),

    #[error("{}", .0.display())]
    NotFound(ErrorDetail),

    #[error("{}", .0.display())]
    Conflict(ErrorDetail),

    #[error("{}", .0.display())]
    Internal(ErrorDetail),
}

/// Client-facing description plus optional operator-facing log detail.
#[derive(Debug, Clone, Default)]
pub struct ErrorDetail {
    pub description: String,
    pub log: Option<String>,
}

impl ErrorDetail {
    /// The string used for operator-facing logging: `log` when present,
    /// `description` otherwise.
    pub fn display(&self) -> &str {
        self.log.as_deref().unwrap_or(&self.description)
    }
}

impl ServiceError {
    pub fn bad_request<S: Into<String>>(description: S) -> Self {
        Self::BadRequest(ErrorDetail {
            description: description.into(),
            log: None,
        })
    }

    pub fn authorization<S: Into<String>>(description: S) -> Self {
        Self::Authorization(ErrorDetail {
            description: description.into(),
            log: None,
        })
    }

    pub fn forbidden<S: Into<String>>(description: S) -> Self {
        Self::Forbidden(ErrorDetail {
            description: description.into(),
            log: None,
        })
    }

    pub fn not_found<S: Into<String>>(description: S) -> Self {
        Self::NotFound(ErrorDetail {
            description: description.into(),
            log: None,
        })
    }

    pub fn conflict<S: Into<String>>(description: S) -> Self {
        Self::Conflict(ErrorDetail {
            description: description.into(),
            log: None,
        })
    }

    pub fn internal<S: Into<String>>(description: S) -> Self {
        Self::Internal(ErrorDetail {
            description: description.into(),
            log: None,
        })
    }

    /// An internal error with a separate operator-facing log detail.
    pub fn internal_with_log<S: Into<String>, L: Into<String>>(description: S, log: L) -> Self {
        Self::Internal(ErrorDetail {
            description: description.into(),
            log: Some(log.into()),
        })
    }

    /// A gateway configuration error: the declarative definition referenced
    /// something the environment cannot resolve, or an operation descriptor
    /// is malformed. Surfaces as an internal error to the caller.
    pub fn configuration<L: Into<String>>(log: L) -> Self {
        Self::Internal(ErrorDetail {
            description: "Gateway configuration error".to_string(),
            log: Some(log.into()),
        })
    }

    pub fn detail(&self) -> &ErrorDetail {
        match self {
            Self::BadRequest(d)
            | Self::Authorization(d)
            | Self::Forbidden(d)
            | Self::NotFound(d)
            | Self::Conflict(d)
            | Self::Internal(d) => d,
        }
    }

    /// HTTP status for this error kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Authorization(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable tag used in the `error` key of the response envelope.
    pub fn error_tag(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Authorization(_) => "authorization_error",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found_error",
            Self::Conflict(_) => "conflict_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<ReferenceError> for ServiceError {
    fn from(err: ReferenceError) -> Self {
        Self::Internal(ErrorDetail {
            description: "Gateway route reference error".to_string(),
            log: Some(err.0),
        })
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        Self::internal(format!("Upstream request failed: {err}"))
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            ServiceError::bad_request("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::authorization("x").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServiceError::forbidden("x").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ServiceError::not_found("x").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::conflict("x").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::internal("x").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn log_detail_wins_for_operator_display() {
        let err = ServiceError::internal_with_log("user facing", "operator facing");
        assert_eq!(err.to_string(), "operator facing");
        assert_eq!(err.detail().description, "user facing");
    }

    #[test]
    fn reference_error_converts_to_configuration_error() {
        let err: ServiceError = ReferenceError::new("env does not contain 'x.y'").into();
        assert_eq!(err.error_tag(), "internal_error");
        assert_eq!(err.detail().description, "Gateway route reference error");
        assert!(err.detail().log.as_deref().unwrap().contains("x.y"));
    }
}
