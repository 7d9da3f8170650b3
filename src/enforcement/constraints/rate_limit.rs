//! Sliding-window rate limiter.
//!
//! Admits request #k iff fewer than N requests occurred in the last W time
//! units. State is a per-key timestamp list; keys combine agent, action,
//! resource, and client IP when present.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::enforcement::{Directive, EnforcementError};
use crate::models::DecisionContext;

use super::{ConstraintProcessor, ProcessorKind};

/// Fallback rate applied to a bare `rateLimit` directive
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub default_limit: u64,
    pub default_window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            default_window_ms: 60_000,
        }
    }
}

static RATE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)^\s*(\d+)\s*(?:回|requests?|reqs?|calls?)?\s*(?:/|per)\s*
          (\d+)?\s*
          (ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?|h|hours?|d|days?|秒|分|時間|日)\s*$",
    )
    .expect("static regex")
});

/// Parse a rate directive body: `100/min`, `3/100ms`, `100回/分`,
/// `100 requests per minute`.
pub fn parse_rate(s: &str) -> Option<(u64, u64)> {
    let captures = RATE_PATTERN.captures(s)?;
    let limit: u64 = captures.get(1)?.as_str().parse().ok()?;
    let multiplier: u64 = captures
        .get(2)
        .map(|m| m.as_str().parse().ok())
        .unwrap_or(Some(1))?;
    let unit_ms: u64 = match captures.get(3)?.as_str().to_lowercase().as_str() {
        "ms" | "millisecond" | "milliseconds" => 1,
        "s" | "sec" | "secs" | "second" | "seconds" | "秒" => 1_000,
        "m" | "min" | "mins" | "minute" | "minutes" | "分" => 60_000,
        "h" | "hour" | "hours" | "時間" => 3_600_000,
        "d" | "day" | "days" | "日" => 86_400_000,
        _ => return None,
    };
    if limit == 0 {
        return None;
    }
    Some((limit, multiplier.max(1) * unit_ms))
}

/// Sliding-window limiter with bounded per-key state
pub struct SlidingWindowRateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Mutex<VecDeque<Instant>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    fn key(context: &DecisionContext) -> String {
        let mut key = format!(
            "{}\x1f{}\x1f{}",
            context.agent_id, context.action, context.resource
        );
        if let Some(ip) = context.client_ip() {
            key.push('\x1f');
            key.push_str(ip);
        }
        key
    }

    /// Evict aged timestamps, then admit if the window holds fewer than the
    /// limit. Returns the remaining budget on admission.
    fn check(&self, key: &str, limit: u64, window: Duration) -> Result<u64, EnforcementError> {
        let entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut timestamps = entry.lock();

        let now = Instant::now();
        while let Some(oldest) = timestamps.front() {
            if now.duration_since(*oldest) >= window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if (timestamps.len() as u64) < limit {
            timestamps.push_back(now);
            Ok(limit - timestamps.len() as u64)
        } else {
            let oldest = *timestamps.front().expect("window is non-empty at limit");
            let retry_after = window.saturating_sub(now.duration_since(oldest));
            let retry_after_ms = retry_after.as_millis() as u64;
            Err(EnforcementError::RateLimitExceeded {
                limit,
                window_ms: window.as_millis() as u64,
                reset_at: Utc::now() + chrono::Duration::milliseconds(retry_after_ms as i64),
                retry_after_ms,
            })
        }
    }
}

#[async_trait]
impl ConstraintProcessor for SlidingWindowRateLimiter {
    fn name(&self) -> &'static str {
        "rate-limiter"
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Admission
    }

    fn matches(&self, directive: &Directive) -> bool {
        directive.keyword() == "rateLimit" || parse_rate(&directive.body).is_some()
    }

    async fn apply(
        &self,
        directive: &Directive,
        _payload: Value,
        context: &DecisionContext,
    ) -> std::result::Result<Value, EnforcementError> {
        let spec = directive.argument().unwrap_or(&directive.body);
        let (limit, window_ms) = parse_rate(spec)
            .unwrap_or((self.config.default_limit, self.config.default_window_ms));
        let window = Duration::from_millis(window_ms);

        let remaining = self.check(&Self::key(context), limit, window)?;

        tracing::debug!(
            agent_id = %context.agent_id,
            limit,
            window_ms,
            remaining,
            "Rate limit admitted"
        );
        Ok(json!({
            "X-RateLimit-Limit": limit,
            "X-RateLimit-Remaining": remaining,
            "X-RateLimit-Reset": (Utc::now() + chrono::Duration::milliseconds(window_ms as i64)).timestamp(),
        }))
    }
}
