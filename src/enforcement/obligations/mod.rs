//! Obligation pipeline: side effects owed by a decision.
//!
//! Executors are registered in declaration order; dispatch is parallel with
//! a per-call concurrency cap. Each obligation carries a failure policy
//! (ignore, retry(k) with exponential backoff, escalate); failures are never
//! propagated to the caller.

pub mod audit;
pub mod deletion;
pub mod notify;
pub mod report;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::enforcement::Directive;
use crate::models::{Decision, DecisionContext};

pub use audit::AuditObligation;
pub use deletion::DeletionScheduler;
pub use notify::{NotifierConfig, NotifyObligation};
pub use report::ReportObligation;

/// Parallel executions in flight per dispatch call
const DISPATCH_CONCURRENCY: usize = 8;
/// Base delay for retry backoff
const RETRY_BASE_DELAY_MS: u64 = 100;
/// Ceiling for a single backoff sleep
const RETRY_MAX_DELAY_MS: u64 = 5_000;

pub type ObligationResult = std::result::Result<(), String>;

/// How a failed obligation is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    Ignore,
    Retry(u32),
    Escalate,
}

impl FailurePolicy {
    /// Strip a trailing `@ignore` / `@retry(k)` / `@escalate` marker from a
    /// directive body. The split is only taken when the suffix is a valid
    /// marker, so email addresses in notify directives survive.
    pub fn split(body: &str) -> (&str, FailurePolicy) {
        if let Some(at) = body.rfind('@') {
            let (head, tail) = (&body[..at], &body[at + 1..]);
            match tail {
                "ignore" => return (head, FailurePolicy::Ignore),
                "escalate" => return (head, FailurePolicy::Escalate),
                _ => {
                    if let Some(k) = tail
                        .strip_prefix("retry(")
                        .and_then(|rest| rest.strip_suffix(')'))
                        .and_then(|n| n.parse::<u32>().ok())
                    {
                        return (head, FailurePolicy::Retry(k));
                    }
                }
            }
        }
        (body, FailurePolicy::Ignore)
    }
}

/// An obligation executor: a `(match, execute)` pair
#[async_trait]
pub trait ObligationExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Blocking executors run inline before dispatch returns (audit);
    /// everything else runs in the parallel set.
    fn blocking(&self) -> bool {
        false
    }

    fn matches(&self, directive: &Directive) -> bool;

    async fn execute(
        &self,
        directive: &Directive,
        context: &DecisionContext,
        decision: &Decision,
    ) -> ObligationResult;
}

/// Outcome summary of one dispatch call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObligationReport {
    pub executed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub escalated: usize,
}

/// Ordered obligation registry with parallel, contained dispatch
pub struct ObligationPipeline {
    executors: Vec<Arc<dyn ObligationExecutor>>,
    escalation_webhook: Option<String>,
    http: reqwest::Client,
}

impl ObligationPipeline {
    pub fn new(escalation_webhook: Option<String>) -> Self {
        Self {
            executors: Vec::new(),
            escalation_webhook,
            http: reqwest::Client::new(),
        }
    }

    pub fn register(&mut self, executor: Arc<dyn ObligationExecutor>) {
        self.executors.push(executor);
    }

    fn select(&self, directive: &Directive) -> Option<Arc<dyn ObligationExecutor>> {
        self.executors.iter().find(|e| e.matches(directive)).cloned()
    }

    /// Execute every obligation of a decision. Failures are contained per
    /// executor; the report is for observability only.
    pub async fn dispatch(
        &self,
        obligations: &[String],
        context: &DecisionContext,
        decision: &Decision,
    ) -> ObligationReport {
        let mut report = ObligationReport::default();
        let mut parallel = FuturesUnordered::new();
        let mut in_flight = 0usize;

        for raw in obligations {
            let (body, policy) = FailurePolicy::split(raw.trim());
            let directive = Directive::parse(body);

            let Some(executor) = self.select(&directive) else {
                tracing::warn!(directive = %raw, "Unknown obligation skipped");
                report.skipped += 1;
                continue;
            };

            if executor.blocking() {
                match self
                    .run_with_policy(executor, directive, policy, context, decision)
                    .await
                {
                    RunOutcome::Ok => report.executed += 1,
                    RunOutcome::Failed => report.failed += 1,
                    RunOutcome::Escalated => {
                        report.failed += 1;
                        report.escalated += 1;
                    }
                }
                continue;
            }

            parallel.push(self.run_with_policy(executor, directive, policy, context, decision));
            in_flight += 1;
            if in_flight >= DISPATCH_CONCURRENCY {
                if let Some(outcome) = parallel.next().await {
                    Self::tally(&mut report, outcome);
                    in_flight -= 1;
                }
            }
        }

        while let Some(outcome) = parallel.next().await {
            Self::tally(&mut report, outcome);
        }
        report
    }

    fn tally(report: &mut ObligationReport, outcome: RunOutcome) {
        match outcome {
            RunOutcome::Ok => report.executed += 1,
            RunOutcome::Failed => report.failed += 1,
            RunOutcome::Escalated => {
                report.failed += 1;
                report.escalated += 1;
            }
        }
    }

    async fn run_with_policy(
        &self,
        executor: Arc<dyn ObligationExecutor>,
        directive: Directive,
        policy: FailurePolicy,
        context: &DecisionContext,
        decision: &Decision,
    ) -> RunOutcome {
        let attempts = match policy {
            FailurePolicy::Retry(k) => k.max(1),
            _ => 1,
        };

        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = (RETRY_BASE_DELAY_MS << (attempt - 1)).min(RETRY_MAX_DELAY_MS);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            match executor.execute(&directive, context, decision).await {
                Ok(()) => {
                    tracing::debug!(
                        executor = executor.name(),
                        directive = %directive.raw,
                        attempt,
                        "Obligation executed"
                    );
                    return RunOutcome::Ok;
                }
                Err(e) => {
                    tracing::warn!(
                        executor = executor.name(),
                        directive = %directive.raw,
                        attempt,
                        error = %e,
                        "Obligation attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.unwrap_or_default();
        match policy {
            FailurePolicy::Escalate => {
                self.escalate(executor.name(), &directive, &error, context).await;
                RunOutcome::Escalated
            }
            _ => RunOutcome::Failed,
        }
    }

    /// Invoke the configured escalation chain
    async fn escalate(
        &self,
        executor: &str,
        directive: &Directive,
        error: &str,
        context: &DecisionContext,
    ) {
        tracing::error!(
            executor,
            directive = %directive.raw,
            agent_id = %context.agent_id,
            error,
            "Obligation failure escalated"
        );
        if let Some(url) = &self.escalation_webhook {
            let body = json!({
                "kind": "obligation_failure",
                "executor": executor,
                "directive": directive.raw,
                "agentId": context.agent_id,
                "error": error,
            });
            if let Err(e) = self.http.post(url).json(&body).send().await {
                tracing::error!(error = %e, "Escalation webhook unreachable");
            }
        }
    }
}

enum RunOutcome {
    Ok,
    Failed,
    Escalated,
}
