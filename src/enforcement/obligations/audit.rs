//! Audit obligation: write the decision to the append-only audit trail.

use async_trait::async_trait;
use std::sync::Arc;

use crate::audit::{AuditOutcome, AuditRecorder};
use crate::enforcement::Directive;
use crate::models::{Decision, DecisionContext};

use super::{ObligationExecutor, ObligationResult};

/// Blocking executor feeding the audit recorder
pub struct AuditObligation {
    recorder: Arc<AuditRecorder>,
}

impl AuditObligation {
    pub fn new(recorder: Arc<AuditRecorder>) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl ObligationExecutor for AuditObligation {
    fn name(&self) -> &'static str {
        "audit-logger"
    }

    /// Audit records must exist before the response leaves the gateway
    fn blocking(&self) -> bool {
        true
    }

    fn matches(&self, directive: &Directive) -> bool {
        directive.keyword() == "audit"
    }

    async fn execute(
        &self,
        _directive: &Directive,
        context: &DecisionContext,
        decision: &Decision,
    ) -> ObligationResult {
        let outcome = if decision.verdict.is_permit() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.recorder
            .record_decision(context, decision, decision.metadata.evaluation_ms, outcome);
        Ok(())
    }
}
