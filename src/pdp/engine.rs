//! Hybrid policy decision point.
//!
//! Orchestrates the declarative rule evaluator and the LLM judgment engine:
//! rules first, LLM when the rule outcome is non-definitive, conservative
//! weighted merge when neither alone decides. Decisions are cached per
//! policy-set version.

use std::sync::Arc;

use crate::models::{Decision, DecisionContext, DeclarativePolicy, PolicyBody, PolicyRecord, Verdict};
use crate::pdp::cache::{CacheKey, DecisionCache};
use crate::pdp::detect::{detect_format, PolicyFormat};
use crate::pdp::llm::JudgmentEngine;
use crate::pdp::rules::RuleEvaluator;
use crate::policy::PolicySnapshot;

/// Confidence at which an LLM verdict is accepted without merging
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.8;
/// Weight of the rule engine in a merged confidence
pub const RULE_ENGINE_WEIGHT: f64 = 0.4;
/// Auto-detection only overrides the stored shape at this confidence
pub const DETECTION_OVERRIDE_THRESHOLD: f64 = 0.7;
/// Default maximum delegation-chain length
pub const DEFAULT_MAX_DELEGATION_DEPTH: usize = 3;

/// PDP tuning knobs
#[derive(Debug, Clone)]
pub struct PdpConfig {
    pub confidence_threshold: f64,
    /// When set, format auto-detection may reroute natural-language bodies
    /// that are actually declarative JSON
    pub auto_detect_format: bool,
    pub max_delegation_depth: usize,
}

impl Default for PdpConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            auto_detect_format: true,
            max_delegation_depth: DEFAULT_MAX_DELEGATION_DEPTH,
        }
    }
}

/// The central decision point: `decide(context, policies)`
pub struct HybridPdp {
    rules: RuleEvaluator,
    llm: Option<Arc<JudgmentEngine>>,
    cache: Arc<DecisionCache>,
    config: PdpConfig,
}

impl HybridPdp {
    pub fn new(
        llm: Option<Arc<JudgmentEngine>>,
        cache: Arc<DecisionCache>,
        config: PdpConfig,
    ) -> Self {
        Self {
            rules: RuleEvaluator::new(),
            llm,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<DecisionCache> {
        &self.cache
    }

    /// Evaluate a context against the active policy snapshot.
    ///
    /// Never returns an error: indeterminate outcomes are decisions too and
    /// become DENY at the enforcement boundary.
    pub async fn decide(&self, context: &DecisionContext, snapshot: &PolicySnapshot) -> Decision {
        // Delegation invariants are checked before any engine runs.
        if let Some(reason) = self.delegation_violation(context) {
            tracing::warn!(agent_id = %context.agent_id, reason = %reason, "Delegation denied");
            return Decision::deny(reason).with_engine("delegation");
        }

        let key = CacheKey::digest(context, snapshot.version);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(cache_key = %key, "Decision cache hit");
            return hit;
        }

        // Single-flight: identical concurrent requests compute once.
        let _flight = self.cache.flight_guard(&key).await;
        if let Some(hit) = self.cache.get(&key) {
            return hit;
        }

        let decision = self.evaluate(context, snapshot).await;
        self.cache.put(key, decision.clone());
        decision
    }

    async fn evaluate(&self, context: &DecisionContext, snapshot: &PolicySnapshot) -> Decision {
        let (declarative, natural) = self.partition(&snapshot.policies);

        let use_rules = !declarative.is_empty();
        let use_llm = self.llm.is_some() && !natural.is_empty();

        if !use_rules && !use_llm {
            return Decision::not_applicable("no applicable policies in the active set")
                .with_engine("pdp");
        }

        // Step 3: the rule engine is definitive on PERMIT or DENY.
        let rule_decision = use_rules.then(|| self.rules.evaluate(&declarative, context));
        if let Some(decision) = &rule_decision {
            if matches!(decision.verdict, Verdict::Permit | Verdict::Deny) {
                return decision.clone();
            }
        }

        // Step 4: the LLM is definitive above the confidence threshold.
        let llm_decision = if use_llm {
            let engine = self.llm.as_ref().expect("checked above");
            let text = natural.join("\n---\n");
            Some(engine.judge(context, &text).await)
        } else {
            None
        };
        if let Some(decision) = &llm_decision {
            if decision.confidence >= self.config.confidence_threshold {
                return decision.clone();
            }
        }

        // Step 5: conservative weighted merge.
        self.merge(rule_decision, llm_decision)
    }

    /// Split the active set into declarative bodies and natural-language
    /// texts. With auto-detection enabled, a natural-language body that is
    /// confidently declarative JSON is parsed and rerouted to the rule
    /// engine.
    fn partition(&self, policies: &[PolicyRecord]) -> (Vec<PolicyRecord>, Vec<String>) {
        let mut declarative = Vec::new();
        let mut natural = Vec::new();

        for record in policies {
            match &record.policy {
                PolicyBody::Declarative(_) => declarative.push(record.clone()),
                PolicyBody::NaturalLanguage(text) => {
                    if self.config.auto_detect_format {
                        let detection = detect_format(text);
                        if detection.format == PolicyFormat::Declarative
                            && detection.confidence >= DETECTION_OVERRIDE_THRESHOLD
                        {
                            if let Ok(parsed) = serde_json::from_str::<DeclarativePolicy>(text) {
                                let mut rerouted = record.clone();
                                rerouted.policy = PolicyBody::Declarative(parsed);
                                declarative.push(rerouted);
                                continue;
                            }
                        }
                    }
                    natural.push(text.clone());
                }
            }
        }
        (declarative, natural)
    }

    /// Compose both engines' outputs. DENY from either engine dominates;
    /// otherwise a PERMIT survives with confidence `wC1·1.0 + wC2·confC2`.
    /// If neither engine reached a verdict the result stays INDETERMINATE,
    /// which the boundary treats as DENY.
    fn merge(&self, rule: Option<Decision>, llm: Option<Decision>) -> Decision {
        let rule_applicable = rule
            .as_ref()
            .map(|d| d.verdict != Verdict::NotApplicable)
            .unwrap_or(false);
        let w_rules = if rule_applicable { RULE_ENGINE_WEIGHT } else { 0.0 };
        let llm_confidence = llm.as_ref().map(|d| d.confidence).unwrap_or(0.0);
        let confidence = (w_rules + (1.0 - w_rules) * llm_confidence).clamp(0.0, 1.0);

        let any_deny = [&rule, &llm]
            .iter()
            .any(|d| d.as_ref().map(|d| d.verdict.is_deny()).unwrap_or(false));
        let any_permit = [&rule, &llm]
            .iter()
            .any(|d| d.as_ref().map(|d| d.verdict.is_permit()).unwrap_or(false));

        let (verdict, reason) = if any_deny {
            let reason = [&llm, &rule]
                .iter()
                .find_map(|d| d.as_ref().filter(|d| d.verdict.is_deny()))
                .map(|d| d.reason.clone())
                .unwrap_or_else(|| "denied by policy".to_string());
            (Verdict::Deny, reason)
        } else if any_permit {
            let reason = [&llm, &rule]
                .iter()
                .find_map(|d| d.as_ref().filter(|d| d.verdict.is_permit()))
                .map(|d| d.reason.clone())
                .unwrap_or_else(|| "permitted by policy".to_string());
            (Verdict::Permit, reason)
        } else {
            (
                Verdict::Indeterminate,
                "no engine reached a definitive verdict".to_string(),
            )
        };

        let mut decision = Decision::new(verdict, reason, confidence);
        for source in [&rule, &llm].into_iter().flatten() {
            decision.constraints.extend(source.constraints.iter().cloned());
            decision.obligations.extend(source.obligations.iter().cloned());
            decision.metadata.matched_rules += source.metadata.matched_rules;
            if decision.metadata.policy_uid.is_none() {
                decision.metadata.policy_uid = source.metadata.policy_uid.clone();
            }
        }
        decision.constraints.dedup();
        decision.obligations.dedup();
        decision.metadata.engine = "hybrid".to_string();
        decision
    }

    fn delegation_violation(&self, context: &DecisionContext) -> Option<String> {
        let chain = &context.delegation_chain;
        if chain.len() > self.config.max_delegation_depth {
            return Some(format!(
                "delegation chain length {} exceeds maximum {}",
                chain.len(),
                self.config.max_delegation_depth
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in chain {
            if !seen.insert(agent) {
                return Some(format!("delegation chain contains duplicate agent '{}'", agent));
            }
        }
        None
    }
}
