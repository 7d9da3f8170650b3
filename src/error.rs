use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::enforcement::EnforcementError;

/// JSON-RPC error code for policy denials and constraint violations
pub const JSONRPC_POLICY_DENIED: i32 = -32001;
/// JSON-RPC error code for unknown methods
pub const JSONRPC_METHOD_NOT_FOUND: i32 = -32601;
/// JSON-RPC error code for internal errors and timeouts
pub const JSONRPC_INTERNAL_ERROR: i32 = -32603;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// PDP verdict was DENY
    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    /// PDP verdict was INDETERMINATE; treated as DENY at the boundary
    #[error("Policy indeterminate: {0}")]
    PolicyIndeterminate(String),

    /// A constraint processor refused the payload
    #[error("Constraint violation: {0}")]
    ConstraintViolation(#[from] EnforcementError),

    /// An upstream tool server did not answer in time
    #[error("Request timeout for {method}")]
    UpstreamTimeout { method: String },

    /// No upstream owns the requested prefix, or all are disconnected
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Delegation chain violation (depth, cycle, unknown target)
    #[error("delegation error: {0}")]
    Delegation(String),

    /// Unknown JSON-RPC method
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network errors
    #[error("Network error: {0}")]
    Network(String),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Invalid task state transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::PolicyDenied(_) => StatusCode::FORBIDDEN,
            AppError::PolicyIndeterminate(_) => StatusCode::FORBIDDEN,
            AppError::ConstraintViolation(e) => e.status_code(),
            AppError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::Delegation(_) => StatusCode::BAD_REQUEST,
            AppError::MethodNotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Network(_) => StatusCode::BAD_GATEWAY,
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::InvalidStateTransition(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error code string
    pub fn error_code(&self) -> &str {
        match self {
            AppError::PolicyDenied(_) => "POLICY_DENIED",
            AppError::PolicyIndeterminate(_) => "POLICY_INDETERMINATE",
            AppError::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            AppError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            AppError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            AppError::Delegation(_) => "DELEGATION_ERROR",
            AppError::MethodNotFound(_) => "METHOD_NOT_FOUND",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Network(_) => "NETWORK_ERROR",
            AppError::Authentication(_) => "AUTHENTICATION_ERROR",
            AppError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// JSON-RPC error code used when this error crosses the RPC boundary
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            AppError::PolicyDenied(_)
            | AppError::PolicyIndeterminate(_)
            | AppError::ConstraintViolation(_) => JSONRPC_POLICY_DENIED,
            AppError::MethodNotFound(_) => JSONRPC_METHOD_NOT_FOUND,
            _ => JSONRPC_INTERNAL_ERROR,
        }
    }

    /// Structured data attached to the JSON-RPC error, if any
    pub fn jsonrpc_data(&self) -> Option<serde_json::Value> {
        match self {
            AppError::ConstraintViolation(e) => Some(e.violation_data()),
            AppError::UpstreamTimeout { method } => Some(json!({ "method": method })),
            _ => None,
        }
    }
}

/// Convert AppError to HTTP response
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        tracing::error!(
            error_code = error_code,
            status_code = status.as_u16(),
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Conversion from validator::ValidationErrors
impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}

/// Conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

/// Conversion from reqwest::Error
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Network(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AppError::PolicyDenied("no".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::NotFound("test".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::UpstreamTimeout {
                method: "tools/call".to_string()
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            AppError::Authentication("test".to_string()).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_jsonrpc_codes() {
        assert_eq!(
            AppError::PolicyDenied("no".to_string()).jsonrpc_code(),
            JSONRPC_POLICY_DENIED
        );
        assert_eq!(
            AppError::PolicyIndeterminate("unclear".to_string()).jsonrpc_code(),
            JSONRPC_POLICY_DENIED
        );
        assert_eq!(
            AppError::MethodNotFound("tools/burn".to_string()).jsonrpc_code(),
            JSONRPC_METHOD_NOT_FOUND
        );
        assert_eq!(
            AppError::UpstreamTimeout {
                method: "tools/call".to_string()
            }
            .jsonrpc_code(),
            JSONRPC_INTERNAL_ERROR
        );
    }

    #[test]
    fn test_timeout_carries_method() {
        let err = AppError::UpstreamTimeout {
            method: "tools/call".to_string(),
        };
        assert_eq!(err.to_string(), "Request timeout for tools/call");
        assert_eq!(err.jsonrpc_data(), Some(json!({ "method": "tools/call" })));
    }
}
