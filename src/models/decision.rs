use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Outcome of a policy evaluation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Permit,
    Deny,
    Indeterminate,
    NotApplicable,
}

impl Verdict {
    /// DENY is conservative and cannot be overridden downstream
    pub fn is_deny(&self) -> bool {
        matches!(self, Verdict::Deny)
    }

    /// Whether this verdict allows the request to proceed past the boundary
    pub fn is_permit(&self) -> bool {
        matches!(self, Verdict::Permit)
    }
}

/// Evaluation metadata attached to every decision
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DecisionMetadata {
    /// Which engine(s) produced the verdict: `declarative`, `llm`, `hybrid`,
    /// or `cache`
    pub engine: String,

    /// Evaluation latency in milliseconds
    pub evaluation_ms: u64,

    /// Number of rules that matched the request
    pub matched_rules: usize,

    /// Originating policy uid, when a single policy decided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_uid: Option<String>,
}

/// The PDP's answer to "may this happen?"
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub verdict: Verdict,

    /// Human-readable explanation
    pub reason: String,

    /// Confidence in [0, 1]
    pub confidence: f64,

    /// Opaque directives to apply to the response payload
    #[serde(default)]
    pub constraints: Vec<String>,

    /// Opaque directives to execute as side effects
    #[serde(default)]
    pub obligations: Vec<String>,

    #[serde(default)]
    pub metadata: DecisionMetadata,

    /// When the decision was produced
    #[serde(default = "Utc::now")]
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(verdict: Verdict, reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            verdict,
            reason: reason.into(),
            confidence,
            constraints: Vec::new(),
            obligations: Vec::new(),
            metadata: DecisionMetadata::default(),
            decided_at: Utc::now(),
        }
    }

    pub fn permit(reason: impl Into<String>) -> Self {
        Self::new(Verdict::Permit, reason, 1.0)
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self::new(Verdict::Deny, reason, 1.0)
    }

    pub fn not_applicable(reason: impl Into<String>) -> Self {
        Self::new(Verdict::NotApplicable, reason, 1.0)
    }

    pub fn indeterminate(reason: impl Into<String>, confidence: f64) -> Self {
        Self::new(Verdict::Indeterminate, reason, confidence)
    }

    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_obligations(mut self, obligations: Vec<String>) -> Self {
        self.obligations = obligations;
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.metadata.engine = engine.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_wire_form() {
        assert_eq!(
            serde_json::to_value(Verdict::NotApplicable).unwrap(),
            serde_json::json!("NOT_APPLICABLE")
        );
        assert_eq!(Verdict::Permit.to_string(), "PERMIT");
        assert_eq!("DENY".parse::<Verdict>().unwrap(), Verdict::Deny);
    }

    #[test]
    fn test_constructors() {
        let permit = Decision::permit("business hours");
        assert!(permit.verdict.is_permit());
        assert_eq!(permit.confidence, 1.0);

        let deny = Decision::deny("confidential resource");
        assert!(deny.verdict.is_deny());
        assert!(deny.constraints.is_empty());
    }

    #[test]
    fn test_builder_attachments() {
        let decision = Decision::permit("ok")
            .with_constraints(vec!["anonymize:mask".to_string()])
            .with_obligations(vec!["audit".to_string()])
            .with_engine("declarative");

        assert_eq!(decision.constraints.len(), 1);
        assert_eq!(decision.obligations.len(), 1);
        assert_eq!(decision.metadata.engine, "declarative");
    }
}
