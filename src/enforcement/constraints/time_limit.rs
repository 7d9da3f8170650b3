//! Execution-time limit.
//!
//! The directive is consumed by the pipeline, which wraps the downstream
//! call in a `tokio::time::timeout`; expiry aborts enforcement with a
//! Timeout error. The processor itself is registered so required
//! (`!`-prefixed) time limits count as matched.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::enforcement::{Directive, EnforcementError};
use crate::models::DecisionContext;

use super::{ConstraintProcessor, ProcessorKind};

/// Parse a duration argument: `30s`, `500ms`, `2m`, `1h`, or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(hours) = s.strip_suffix('h') {
        return hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600));
    }
    s.parse::<u64>().ok().map(Duration::from_secs)
}

/// The tightest execution-time limit among the directives, if any
pub fn execution_time_limit(directives: &[Directive]) -> Option<Duration> {
    directives
        .iter()
        .filter(|d| d.keyword() == "executionTimeLimit")
        .filter_map(|d| d.argument().and_then(parse_duration))
        .min()
}

/// Registry entry for the execution-time limit directive
pub struct TimeLimitProcessor;

#[async_trait]
impl ConstraintProcessor for TimeLimitProcessor {
    fn name(&self) -> &'static str {
        "execution-time-limit"
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Wrap
    }

    fn matches(&self, directive: &Directive) -> bool {
        directive.keyword() == "executionTimeLimit"
    }

    async fn apply(
        &self,
        _directive: &Directive,
        payload: Value,
        _context: &DecisionContext,
    ) -> std::result::Result<Value, EnforcementError> {
        // The pipeline enforces the limit around the downstream call
        Ok(payload)
    }
}
