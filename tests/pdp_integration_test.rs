//! End-to-end PDP scenarios: declarative evaluation, hybrid fallback, cache
//! behavior, and delegation safety.

use std::sync::Arc;

use aegis_gateway::models::{
    AgentType, Constraint, ConstraintExpr, ConstraintOperator, DecisionContext, DeclarativePolicy,
    PolicyBody, PolicyMetadata, PolicyRecord, PolicyStatus, ResourceClassification, Rule, Verdict,
};
use aegis_gateway::pdp::{
    DecisionCache, HybridPdp, JudgmentEngine, LlmConfig, PdpConfig,
};
use aegis_gateway::policy::PolicySnapshot;
use chrono::{TimeZone, Utc};
use serde_json::json;

fn record(id: &str, priority: i64, permission: Vec<Rule>, prohibition: Vec<Rule>) -> PolicyRecord {
    PolicyRecord {
        id: id.to_string(),
        name: id.to_string(),
        version: "1.0.0".to_string(),
        status: PolicyStatus::Active,
        description: None,
        policy: PolicyBody::Declarative(DeclarativePolicy {
            uid: id.to_string(),
            priority,
            permission,
            prohibition,
            duty: vec![],
        }),
        metadata: PolicyMetadata {
            priority,
            tags: vec![],
            created_at: Utc::now(),
            created_by: "test".to_string(),
            last_modified: None,
            last_modified_by: None,
        },
    }
}

fn snapshot(version: u64, policies: Vec<PolicyRecord>) -> PolicySnapshot {
    PolicySnapshot {
        version,
        policies: policies.into(),
    }
}

fn atom(left: &str, op: ConstraintOperator, right: serde_json::Value) -> ConstraintExpr {
    ConstraintExpr::Atom(Constraint::new(left, op, right))
}

fn pdp() -> HybridPdp {
    HybridPdp::new(
        None,
        Arc::new(DecisionCache::with_defaults()),
        PdpConfig::default(),
    )
}

fn business_hours_rule(with_emergency_override: bool) -> Rule {
    let window = ConstraintExpr::And {
        and: vec![
            atom("timeOfDay", ConstraintOperator::Gteq, json!("09:00:00")),
            atom("timeOfDay", ConstraintOperator::Lteq, json!("18:00:00")),
        ],
    };
    let constraints = if with_emergency_override {
        vec![ConstraintExpr::Or {
            or: vec![window, atom("emergency", ConstraintOperator::Eq, json!(true))],
        }]
    } else {
        vec![window]
    };
    Rule {
        action: "filesystem:read".to_string(),
        constraints,
        ..Default::default()
    }
}

#[tokio::test]
async fn business_hours_permit() {
    let snap = snapshot(
        1,
        vec![record("hours", 10, vec![business_hours_rule(false)], vec![])],
    );
    let context = DecisionContext::new("a", AgentType::Research, "filesystem:read", "file:test.txt")
        .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());

    let decision = pdp().decide(&context, &snap).await;
    assert_eq!(decision.verdict, Verdict::Permit);
    assert_eq!(decision.confidence, 1.0);
    assert_eq!(decision.metadata.engine, "declarative");
}

#[tokio::test]
async fn after_hours_deny_with_emergency_override() {
    let snap = snapshot(
        1,
        vec![record("hours", 10, vec![business_hours_rule(true)], vec![])],
    );

    // 20:00 without the emergency flag: not permitted
    let late = DecisionContext::new("a", AgentType::Research, "filesystem:read", "file:test.txt")
        .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap());
    let decision = pdp().decide(&late, &snap).await;
    assert_ne!(decision.verdict, Verdict::Permit);

    // Same time, emergency flag set: the or-branch permits
    let emergency = late.clone().with_env("emergency", json!(true));
    let decision = pdp().decide(&emergency, &snap).await;
    assert_eq!(decision.verdict, Verdict::Permit);
}

#[tokio::test]
async fn trust_threshold_deny_names_the_classification() {
    // Neither the rule target nor the resource mentions the classification;
    // the reason must surface it from the constraint that fired.
    let prohibition = Rule {
        action: "*".to_string(),
        constraints: vec![ConstraintExpr::And {
            and: vec![
                atom(
                    "resourceClassification",
                    ConstraintOperator::Eq,
                    json!("confidential"),
                ),
                atom("trustScore", ConstraintOperator::Lt, json!(0.7)),
            ],
        }],
        ..Default::default()
    };
    let snap = snapshot(1, vec![record("guard", 50, vec![], vec![prohibition])]);

    let context = DecisionContext::new(
        "ext",
        AgentType::External,
        "filesystem:read",
        "file:reports/q3.xlsx",
    )
    .with_trust_score(0.3)
    .with_classification(ResourceClassification::Confidential);

    let decision = pdp().decide(&context, &snap).await;
    assert_eq!(decision.verdict, Verdict::Deny);
    assert!(decision.reason.contains("confidential"), "reason: {}", decision.reason);
    assert!(decision.reason.contains("trustScore"), "reason: {}", decision.reason);
}

#[tokio::test]
async fn empty_policy_set_is_not_applicable() {
    let decision = pdp()
        .decide(
            &DecisionContext::new("a", AgentType::System, "tool:call", "tool:x"),
            &snapshot(1, vec![]),
        )
        .await;
    assert_eq!(decision.verdict, Verdict::NotApplicable);
}

#[tokio::test]
async fn delegation_depth_exactly_max_plus_one_denied() {
    // max depth 3: a chain of 4 is rejected with a delegation reason
    let chain: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
    let context = DecisionContext::new("d", AgentType::Coordinator, "task:delegate", "task:x")
        .with_delegation_chain(chain);

    let decision = pdp().decide(&context, &snapshot(1, vec![])).await;
    assert_eq!(decision.verdict, Verdict::Deny);
    assert!(decision.reason.contains("delegation"));
}

#[tokio::test]
async fn llm_unreachable_fails_safe_to_deny() {
    // A natural-language policy with an unreachable provider endpoint: the
    // judgment engine must deny with the fail-safe reason.
    let llm = Arc::new(JudgmentEngine::new(LlmConfig {
        base_url: Some("http://127.0.0.1:1".to_string()),
        timeout_secs: 1,
        ..Default::default()
    }));
    let pdp = HybridPdp::new(
        Some(llm),
        Arc::new(DecisionCache::with_defaults()),
        PdpConfig::default(),
    );

    let natural = PolicyRecord {
        id: "nl".to_string(),
        name: "nl".to_string(),
        version: "1.0.0".to_string(),
        status: PolicyStatus::Active,
        description: None,
        policy: PolicyBody::NaturalLanguage(
            "Agents must never read confidential documents after hours.".to_string(),
        ),
        metadata: PolicyMetadata {
            priority: 0,
            tags: vec![],
            created_at: Utc::now(),
            created_by: "test".to_string(),
            last_modified: None,
            last_modified_by: None,
        },
    };

    let context = DecisionContext::new("a", AgentType::External, "filesystem:read", "file:x");
    let decision = pdp.decide(&context, &snapshot(1, vec![natural])).await;
    assert_eq!(decision.verdict, Verdict::Deny);
    assert_eq!(decision.reason, "LLM unavailable");
    assert_eq!(decision.confidence, 1.0);
}

#[tokio::test]
async fn cache_hit_returns_identical_decision_and_respects_version() {
    let cache = Arc::new(DecisionCache::with_defaults());
    let pdp = HybridPdp::new(None, cache.clone(), PdpConfig::default());

    let permit = Rule {
        action: "tool:call".to_string(),
        ..Default::default()
    };
    let v1 = snapshot(1, vec![record("p", 1, vec![permit.clone()], vec![])]);
    let context = DecisionContext::new("a", AgentType::Research, "tool:call", "tool:fs__read");

    let first = pdp.decide(&context, &v1).await;
    let second = pdp.decide(&context, &v1).await;
    assert_eq!(first.verdict, second.verdict);
    assert_eq!(first.reason, second.reason);
    assert_eq!(first.metadata.engine, second.metadata.engine);
    assert_eq!(cache.stats().hits, 1);

    // A new policy-set version must not reuse the old entry
    let v2 = snapshot(2, vec![record("p", 1, vec![], vec![permit.clone()])]);
    let third = pdp.decide(&context, &v2).await;
    assert_eq!(third.verdict, Verdict::Deny);
}

#[tokio::test]
async fn cache_overflow_evicts_oldest_fifth() {
    let capacity = 10;
    let cache = Arc::new(DecisionCache::new(true, 300, capacity));
    let pdp = HybridPdp::new(None, cache.clone(), PdpConfig::default());

    let permit = Rule {
        action: "tool:call".to_string(),
        ..Default::default()
    };
    let snap = snapshot(1, vec![record("p", 1, vec![permit], vec![])]);

    for i in 0..=capacity {
        let context = DecisionContext::new(
            format!("agent-{:02}", i),
            AgentType::Research,
            "tool:call",
            "tool:x",
        );
        pdp.decide(&context, &snap).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    // capacity + 1 distinct contexts: the oldest 20% were discarded
    assert_eq!(cache.len(), capacity - 1);
}
