//! Constraint pipeline: an ordered registry of processors applied to each
//! gated request.
//!
//! Admission processors (rate limiter, geo restrictor) run before the
//! downstream call, the execution-time limit wraps the call itself, and
//! transform processors (anonymizer, field/size limits) rewrite the response
//! payload in directive order.

pub mod anonymizer;
pub mod geo;
pub mod limits;
pub mod rate_limit;
pub mod time_limit;

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::enforcement::{Directive, EnforcementError};
use crate::error::Result;
use crate::models::DecisionContext;

pub use anonymizer::{AnonymizerProcessor, TokenStore};
pub use geo::{GeoConfig, GeoRestrictor, MissingIpAction};
pub use limits::{FieldFilterProcessor, RecordCountProcessor, SizeLimitProcessor};
pub use rate_limit::{RateLimitConfig, SlidingWindowRateLimiter};
pub use time_limit::TimeLimitProcessor;

/// Where in the request span a processor runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    /// Before the downstream call; may reject, may emit payload metadata
    Admission,
    /// Wraps the downstream call (execution-time limit)
    Wrap,
    /// After the downstream call; rewrites the response payload
    Transform,
}

/// A constraint processor: a `(match, apply)` pair.
///
/// Processors are pure with respect to the request payload but may hold
/// bounded internal state (rate-limiter windows, tokenization table).
#[async_trait]
pub trait ConstraintProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Transform
    }

    fn matches(&self, directive: &Directive) -> bool;

    async fn apply(
        &self,
        directive: &Directive,
        payload: Value,
        context: &DecisionContext,
    ) -> std::result::Result<Value, EnforcementError>;
}

/// Ordered processor registry, iterated in declaration order
pub struct ConstraintPipeline {
    processors: Vec<Arc<dyn ConstraintProcessor>>,
}

impl ConstraintPipeline {
    pub fn new() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    /// Pipeline with every built-in processor registered
    pub fn with_defaults(
        token_store: Arc<TokenStore>,
        rate_config: RateLimitConfig,
        geo_config: GeoConfig,
    ) -> Self {
        let mut pipeline = Self::new();
        pipeline.register(Arc::new(AnonymizerProcessor::new(token_store)));
        pipeline.register(Arc::new(SlidingWindowRateLimiter::new(rate_config)));
        pipeline.register(Arc::new(GeoRestrictor::new(geo_config)));
        pipeline.register(Arc::new(FieldFilterProcessor));
        pipeline.register(Arc::new(RecordCountProcessor));
        pipeline.register(Arc::new(SizeLimitProcessor));
        pipeline.register(Arc::new(TimeLimitProcessor));
        pipeline
    }

    pub fn register(&mut self, processor: Arc<dyn ConstraintProcessor>) {
        self.processors.push(processor);
    }

    /// Select the first registered processor matching a directive
    fn select(&self, directive: &Directive) -> Option<&Arc<dyn ConstraintProcessor>> {
        self.processors.iter().find(|p| p.matches(directive))
    }

    /// Run the full enforcement span around a downstream call.
    ///
    /// A processor error aborts enforcement with a DENY-equivalent response;
    /// unmatched directives are skipped unless marked required.
    pub async fn execute<F, Fut>(
        &self,
        directives: &[String],
        context: &DecisionContext,
        fetch: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let parsed: Vec<Directive> = directives.iter().map(|d| Directive::parse(d)).collect();

        // Resolve the plan up front so required-but-unmatched directives fail
        // before any side effect.
        let mut plan: Vec<(&Directive, &Arc<dyn ConstraintProcessor>)> = Vec::new();
        for directive in &parsed {
            match self.select(directive) {
                Some(processor) => plan.push((directive, processor)),
                None if directive.required => {
                    return Err(EnforcementError::RequiredConstraintUnmatched {
                        directive: directive.raw.clone(),
                    }
                    .into());
                }
                None => {
                    tracing::warn!(directive = %directive.raw, "Unrecognized constraint skipped");
                }
            }
        }

        // Admission phase: reject early, collect payload annotations.
        let mut annotations = serde_json::Map::new();
        for (directive, processor) in plan.iter().filter(|(_, p)| p.kind() == ProcessorKind::Admission)
        {
            let outcome = processor.apply(directive, Value::Null, context).await?;
            if let Value::Object(map) = outcome {
                annotations.extend(map);
            }
        }

        // Downstream call, optionally wrapped in the execution-time limit.
        let mut payload = match time_limit::execution_time_limit(&parsed) {
            Some(limit) => tokio::time::timeout(limit, fetch())
                .await
                .map_err(|_| EnforcementError::Timeout {
                    limit_ms: limit.as_millis() as u64,
                })??,
            None => fetch().await?,
        };

        // Transform phase, in directive order.
        for (directive, processor) in plan.iter().filter(|(_, p)| p.kind() == ProcessorKind::Transform)
        {
            payload = processor.apply(directive, payload, context).await?;
        }

        if !annotations.is_empty() {
            if let Value::Object(map) = &mut payload {
                map.extend(annotations);
            }
        }
        Ok(payload)
    }

    /// Apply only the transform processors to an existing payload
    pub async fn apply_transforms(
        &self,
        directives: &[String],
        context: &DecisionContext,
        mut payload: Value,
    ) -> Result<Value> {
        for raw in directives {
            let directive = Directive::parse(raw);
            match self.select(&directive) {
                Some(processor) if processor.kind() == ProcessorKind::Transform => {
                    payload = processor.apply(&directive, payload, context).await?;
                }
                Some(_) => {}
                None if directive.required => {
                    return Err(EnforcementError::RequiredConstraintUnmatched {
                        directive: directive.raw,
                    }
                    .into());
                }
                None => {
                    tracing::warn!(directive = %directive.raw, "Unrecognized constraint skipped");
                }
            }
        }
        Ok(payload)
    }
}

impl Default for ConstraintPipeline {
    fn default() -> Self {
        Self::new()
    }
}
