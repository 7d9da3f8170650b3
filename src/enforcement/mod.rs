//! Policy enforcement point: constraint processors (payload transforms and
//! admission checks) and obligation executors (side effects).

pub mod constraints;
pub mod obligations;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

/// Machine-readable enforcement refusal.
///
/// Only the RPC boundary translates these into JSON-RPC errors.
#[derive(Error, Debug, Clone)]
pub enum EnforcementError {
    #[error("rate limit exceeded: {limit} per {window_ms}ms")]
    RateLimitExceeded {
        limit: u64,
        window_ms: u64,
        reset_at: DateTime<Utc>,
        retry_after_ms: u64,
    },

    #[error("geo-blocked: country '{country}' is not permitted")]
    GeoBlocked { country: String, client_ip: Option<String> },

    #[error("execution time limit of {limit_ms}ms exceeded")]
    Timeout { limit_ms: u64 },

    #[error("required constraint '{directive}' matched no processor")]
    RequiredConstraintUnmatched { directive: String },

    #[error("payload rejected by '{processor}': {message}")]
    Rejected { processor: String, message: String },
}

impl EnforcementError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EnforcementError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            EnforcementError::GeoBlocked { .. } => StatusCode::FORBIDDEN,
            EnforcementError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            EnforcementError::RequiredConstraintUnmatched { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EnforcementError::Rejected { .. } => StatusCode::FORBIDDEN,
        }
    }

    /// Structured violation metadata for the JSON-RPC error `data` field
    pub fn violation_data(&self) -> serde_json::Value {
        match self {
            EnforcementError::RateLimitExceeded {
                limit,
                window_ms,
                reset_at,
                retry_after_ms,
            } => json!({
                "violation": "RATE_LIMIT_EXCEEDED",
                "limit": limit,
                "windowMs": window_ms,
                "resetAt": reset_at.to_rfc3339(),
                "retryAfter": retry_after_ms,
            }),
            EnforcementError::GeoBlocked { country, client_ip } => json!({
                "violation": "GEO_BLOCKED",
                "country": country,
                "clientIP": client_ip,
            }),
            EnforcementError::Timeout { limit_ms } => json!({
                "violation": "EXECUTION_TIMEOUT",
                "limitMs": limit_ms,
            }),
            EnforcementError::RequiredConstraintUnmatched { directive } => json!({
                "violation": "REQUIRED_CONSTRAINT_UNMATCHED",
                "directive": directive,
            }),
            EnforcementError::Rejected { processor, message } => json!({
                "violation": "PAYLOAD_REJECTED",
                "processor": processor,
                "message": message,
            }),
        }
    }
}

/// A parsed constraint directive.
///
/// A `!` prefix marks the directive as required: if no registered processor
/// matches it, enforcement fails instead of skipping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub raw: String,
    pub body: String,
    pub required: bool,
}

impl Directive {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.strip_prefix('!') {
            Some(body) => Self {
                raw: trimmed.to_string(),
                body: body.trim().to_string(),
                required: true,
            },
            None => Self {
                raw: trimmed.to_string(),
                body: trimmed.to_string(),
                required: false,
            },
        }
    }

    /// The directive keyword before the first `:`
    pub fn keyword(&self) -> &str {
        self.body.split(':').next().unwrap_or(&self.body)
    }

    /// Everything after the first `:`
    pub fn argument(&self) -> Option<&str> {
        self.body.split_once(':').map(|(_, rest)| rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_parsing() {
        let plain = Directive::parse("anonymize:mask");
        assert!(!plain.required);
        assert_eq!(plain.keyword(), "anonymize");
        assert_eq!(plain.argument(), Some("mask"));

        let required = Directive::parse("!rateLimit:100/min");
        assert!(required.required);
        assert_eq!(required.keyword(), "rateLimit");
        assert_eq!(required.argument(), Some("100/min"));

        let bare = Directive::parse("audit");
        assert_eq!(bare.keyword(), "audit");
        assert_eq!(bare.argument(), None);
    }

    #[test]
    fn test_rate_limit_violation_payload() {
        let err = EnforcementError::RateLimitExceeded {
            limit: 3,
            window_ms: 100,
            reset_at: Utc::now(),
            retry_after_ms: 40,
        };
        let data = err.violation_data();
        assert_eq!(data["violation"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(data["limit"], 3);
        assert_eq!(data["windowMs"], 100);
        assert!(data["retryAfter"].as_u64().unwrap() <= 100);
    }
}
