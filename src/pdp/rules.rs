//! Declarative rule evaluation.
//!
//! Policies are flattened into a rule list sorted by descending priority,
//! prohibitions ahead of permissions at equal priority, declaration order
//! last. The first matching rule whose constraints are satisfied determines
//! the outcome.

use chrono::{NaiveTime, Timelike};
use chrono_tz::Tz;
use serde_json::Value;

use crate::models::{
    Constraint, ConstraintExpr, ConstraintOperator, Decision, DecisionContext, PolicyRecord, Rule,
    Verdict,
};

/// Tri-state constraint outcome.
///
/// Indeterminate propagates as false in `and` compositions; an `or` is
/// satisfied only if at least one sibling is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConstraintOutcome {
    Satisfied,
    NotSatisfied,
    Indeterminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    Prohibition,
    Permission,
}

/// Evaluates declarative policy sets against a decision context
#[derive(Debug, Clone, Default)]
pub struct RuleEvaluator;

impl RuleEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate the active policy set against a context.
    ///
    /// PERMIT if a permission matched with all constraints satisfied; DENY if
    /// a prohibition did; NOT_APPLICABLE if no rule had a matching action;
    /// INDETERMINATE otherwise. Confidence is 1.0 for PERMIT/DENY.
    pub fn evaluate(&self, policies: &[PolicyRecord], context: &DecisionContext) -> Decision {
        let started = std::time::Instant::now();

        // Flatten into (priority, kind, declaration order) and sort: higher
        // priority first, prohibition before permission on ties, then
        // declaration order.
        let mut rules: Vec<(i64, RuleKind, usize, &Rule, &str)> = Vec::new();
        let mut order = 0usize;
        for record in policies {
            let Some(declarative) = record.policy.as_declarative() else {
                continue;
            };
            let priority = record.priority();
            for rule in &declarative.prohibition {
                rules.push((priority, RuleKind::Prohibition, order, rule, record.id.as_str()));
                order += 1;
            }
            for rule in &declarative.permission {
                rules.push((priority, RuleKind::Permission, order, rule, record.id.as_str()));
                order += 1;
            }
        }
        rules.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| match (a.1, b.1) {
                    (RuleKind::Prohibition, RuleKind::Permission) => std::cmp::Ordering::Less,
                    (RuleKind::Permission, RuleKind::Prohibition) => std::cmp::Ordering::Greater,
                    _ => std::cmp::Ordering::Equal,
                })
                .then_with(|| a.2.cmp(&b.2))
        });

        let mut matched_rules = 0usize;

        for (_, kind, _, rule, policy_uid) in &rules {
            if !rule.matches_action(&context.action) || !rule.matches_target(&context.resource) {
                continue;
            }
            matched_rules += 1;

            if self.constraints_satisfied(rule, context) != ConstraintOutcome::Satisfied {
                continue;
            }

            let policy_duties = policies
                .iter()
                .find(|p| p.id == *policy_uid)
                .and_then(|p| p.policy.as_declarative())
                .map(|d| d.duty.clone())
                .unwrap_or_default();

            let mut decision = match kind {
                RuleKind::Prohibition => Decision::deny(self.describe(rule, context, "prohibited")),
                RuleKind::Permission => Decision::permit(self.describe(rule, context, "permitted")),
            };
            decision.constraints = enforcement_directives(rule);
            decision.obligations = rule
                .duties
                .iter()
                .cloned()
                .chain(policy_duties)
                .collect();
            decision.metadata.engine = "declarative".to_string();
            decision.metadata.matched_rules = matched_rules;
            decision.metadata.policy_uid = Some(policy_uid.to_string());
            decision.metadata.evaluation_ms = started.elapsed().as_millis() as u64;

            tracing::debug!(
                agent_id = %context.agent_id,
                action = %context.action,
                verdict = %decision.verdict,
                policy_uid = %policy_uid,
                "Declarative rule matched"
            );
            return decision;
        }

        let mut decision = if matched_rules == 0 {
            Decision::not_applicable("no rule matched the requested action")
        } else {
            Decision::indeterminate(
                "rules matched the action but no constraint set was satisfied",
                0.0,
            )
        };
        decision.metadata.engine = "declarative".to_string();
        decision.metadata.matched_rules = matched_rules;
        decision.metadata.evaluation_ms = started.elapsed().as_millis() as u64;
        decision
    }

    /// Human-readable reason naming the grounds: the constraint atoms that
    /// actually held for the match, not just the resource string.
    fn describe(&self, rule: &Rule, context: &DecisionContext, verb: &str) -> String {
        let mut grounds = Vec::new();
        for expr in &rule.constraints {
            self.collect_grounds(expr, context, &mut grounds);
        }

        let base = format!("action '{}' on '{}' {}", context.action, context.resource, verb);
        if grounds.is_empty() {
            base
        } else {
            format!("{} ({})", base, grounds.join(", "))
        }
    }

    /// Collect renderings of the satisfied context-constraint atoms. For an
    /// `or`, only the branch that carried the match contributes.
    fn collect_grounds(
        &self,
        expr: &ConstraintExpr,
        context: &DecisionContext,
        out: &mut Vec<String>,
    ) {
        match expr {
            ConstraintExpr::Atom(constraint) => {
                if !constraint.is_enforcement_directive()
                    && self.eval_constraint(constraint, context) == ConstraintOutcome::Satisfied
                {
                    out.push(render_ground(constraint));
                }
            }
            ConstraintExpr::And { and } => {
                for child in and {
                    self.collect_grounds(child, context, out);
                }
            }
            ConstraintExpr::Or { or } => {
                for child in or {
                    if self.eval_expr(child, context) == ConstraintOutcome::Satisfied {
                        self.collect_grounds(child, context, out);
                        break;
                    }
                }
            }
        }
    }

    /// All constraints of the rule, `and`-composed. Enforcement directives
    /// are skipped here; they travel with the decision instead.
    fn constraints_satisfied(&self, rule: &Rule, context: &DecisionContext) -> ConstraintOutcome {
        let mut outcome = ConstraintOutcome::Satisfied;
        for expr in &rule.constraints {
            match self.eval_expr(expr, context) {
                ConstraintOutcome::Satisfied => {}
                ConstraintOutcome::NotSatisfied => return ConstraintOutcome::NotSatisfied,
                ConstraintOutcome::Indeterminate => outcome = ConstraintOutcome::Indeterminate,
            }
        }
        if outcome == ConstraintOutcome::Indeterminate {
            ConstraintOutcome::NotSatisfied
        } else {
            outcome
        }
    }

    fn eval_expr(&self, expr: &ConstraintExpr, context: &DecisionContext) -> ConstraintOutcome {
        match expr {
            ConstraintExpr::Atom(constraint) => {
                if constraint.is_enforcement_directive() {
                    // Payload directives never gate the match
                    ConstraintOutcome::Satisfied
                } else {
                    self.eval_constraint(constraint, context)
                }
            }
            ConstraintExpr::And { and } => {
                let mut indeterminate = false;
                for child in and {
                    match self.eval_expr(child, context) {
                        ConstraintOutcome::Satisfied => {}
                        ConstraintOutcome::NotSatisfied => {
                            return ConstraintOutcome::NotSatisfied
                        }
                        ConstraintOutcome::Indeterminate => indeterminate = true,
                    }
                }
                if indeterminate {
                    ConstraintOutcome::NotSatisfied
                } else {
                    ConstraintOutcome::Satisfied
                }
            }
            ConstraintExpr::Or { or } => {
                for child in or {
                    if self.eval_expr(child, context) == ConstraintOutcome::Satisfied {
                        return ConstraintOutcome::Satisfied;
                    }
                }
                ConstraintOutcome::NotSatisfied
            }
        }
    }

    fn eval_constraint(
        &self,
        constraint: &Constraint,
        context: &DecisionContext,
    ) -> ConstraintOutcome {
        if constraint.left_operand == "timeOfDay" {
            return self.eval_time_of_day(constraint, context);
        }

        let Some(left) = resolve_operand(&constraint.left_operand, context) else {
            return ConstraintOutcome::Indeterminate;
        };

        compare(&left, constraint.operator, &constraint.right_operand)
    }

    /// Time-of-day comparisons treat the right operand as `HH:MM:SS` in the
    /// context's timezone.
    fn eval_time_of_day(
        &self,
        constraint: &Constraint,
        context: &DecisionContext,
    ) -> ConstraintOutcome {
        let Some(rhs) = constraint.right_operand.as_str() else {
            return ConstraintOutcome::Indeterminate;
        };
        let Ok(bound) = NaiveTime::parse_from_str(rhs, "%H:%M:%S") else {
            return ConstraintOutcome::Indeterminate;
        };

        let local = match context.timezone().and_then(|name| name.parse::<Tz>().ok()) {
            Some(tz) => context.timestamp.with_timezone(&tz).time(),
            None => context.timestamp.time(),
        };
        let local = NaiveTime::from_hms_opt(local.hour(), local.minute(), local.second())
            .unwrap_or(local);

        let holds = match constraint.operator {
            ConstraintOperator::Eq => local == bound,
            ConstraintOperator::Neq => local != bound,
            ConstraintOperator::Lt => local < bound,
            ConstraintOperator::Lteq => local <= bound,
            ConstraintOperator::Gt => local > bound,
            ConstraintOperator::Gteq => local >= bound,
            _ => return ConstraintOutcome::Indeterminate,
        };
        if holds {
            ConstraintOutcome::Satisfied
        } else {
            ConstraintOutcome::NotSatisfied
        }
    }
}

/// Render one satisfied constraint for a decision reason, e.g.
/// `resourceClassification eq confidential`
fn render_ground(constraint: &Constraint) -> String {
    let value = match &constraint.right_operand {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    format!("{} {} {}", constraint.left_operand, constraint.operator, value)
}

/// Enforcement-directive constraints of a rule, rendered as pipeline strings
fn enforcement_directives(rule: &Rule) -> Vec<String> {
    fn walk(expr: &ConstraintExpr, out: &mut Vec<String>) {
        match expr {
            ConstraintExpr::Atom(c) if c.is_enforcement_directive() => {
                out.push(c.to_directive());
            }
            ConstraintExpr::Atom(_) => {}
            ConstraintExpr::And { and } => and.iter().for_each(|e| walk(e, out)),
            ConstraintExpr::Or { or } => or.iter().for_each(|e| walk(e, out)),
        }
    }
    let mut out = Vec::new();
    for expr in &rule.constraints {
        walk(expr, &mut out);
    }
    out
}

/// Resolve a left operand against the context: named fields first, then the
/// environment map. Missing values resolve to None (unknown, never
/// permissive).
fn resolve_operand(name: &str, context: &DecisionContext) -> Option<Value> {
    match name {
        "agentId" => Some(Value::String(context.agent_id.clone())),
        "agentType" => Some(Value::String(context.agent_type.to_string())),
        "action" => Some(Value::String(context.action.clone())),
        "resource" => Some(Value::String(context.resource.clone())),
        "resourceClassification" => context
            .resource_classification
            .map(|c| Value::String(c.to_string())),
        "trustScore" => context
            .trust_score
            .and_then(|s| serde_json::Number::from_f64(s).map(Value::Number)),
        "clearanceLevel" => context.clearance_level.clone().map(Value::String),
        "delegationDepth" => Some(Value::Number(context.delegation_chain.len().into())),
        _ => context.environment.get(name).cloned(),
    }
}

/// Compare two JSON values under an operator. Type mismatches yield
/// Indeterminate. All numeric comparisons use IEEE-754 doubles; float
/// equality is strict bit equality after rounding to 1e-9.
fn compare(left: &Value, operator: ConstraintOperator, right: &Value) -> ConstraintOutcome {
    use ConstraintOperator::*;

    let verdict = |b: bool| {
        if b {
            ConstraintOutcome::Satisfied
        } else {
            ConstraintOutcome::NotSatisfied
        }
    };

    match operator {
        In | IsAnyOf | IsNoneOf => {
            let Some(set) = right.as_array() else {
                return ConstraintOutcome::Indeterminate;
            };
            let contained = set.iter().any(|candidate| values_equal(left, candidate));
            verdict(if operator == IsNoneOf { !contained } else { contained })
        }
        Eq => verdict(values_equal(left, right)),
        Neq => verdict(!values_equal(left, right)),
        Lt | Lteq | Gt | Gteq => match (as_f64(left), as_f64(right)) {
            (Some(a), Some(b)) => verdict(match operator {
                Lt => a < b,
                Lteq => a <= b,
                Gt => a > b,
                Gteq => a >= b,
                _ => unreachable!(),
            }),
            _ => match (left.as_str(), right.as_str()) {
                (Some(a), Some(b)) => verdict(match operator {
                    Lt => a < b,
                    Lteq => a <= b,
                    Gt => a > b,
                    Gteq => a >= b,
                    _ => unreachable!(),
                }),
                _ => ConstraintOutcome::Indeterminate,
            },
        },
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_f64(left), as_f64(right)) {
        return float_eq(a, b);
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        // "true"/"false" strings interoperate with booleans across the wire
        (Value::String(a), Value::Bool(b)) | (Value::Bool(b), Value::String(a)) => {
            a.parse::<bool>().map(|parsed| parsed == *b).unwrap_or(false)
        }
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Strict bit equality after rounding to 1e-9
fn float_eq(a: f64, b: f64) -> bool {
    let round = |x: f64| (x * 1e9).round();
    round(a).to_bits() == round(b).to_bits()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentType, DeclarativePolicy, PolicyBody, PolicyMetadata, PolicyStatus};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record(id: &str, priority: i64, body: DeclarativePolicy) -> PolicyRecord {
        PolicyRecord {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".to_string(),
            status: PolicyStatus::Active,
            description: None,
            policy: PolicyBody::Declarative(DeclarativePolicy {
                uid: id.to_string(),
                priority,
                ..body
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

    fn atom(left: &str, op: ConstraintOperator, right: serde_json::Value) -> ConstraintExpr {
        ConstraintExpr::Atom(Constraint::new(left, op, right))
    }

    fn business_hours_policy() -> PolicyRecord {
        record(
            "business-hours",
            10,
            DeclarativePolicy {
                permission: vec![Rule {
                    action: "filesystem:read".to_string(),
                    constraints: vec![ConstraintExpr::And {
                        and: vec![
                            atom("timeOfDay", ConstraintOperator::Gteq, json!("09:00:00")),
                            atom("timeOfDay", ConstraintOperator::Lteq, json!("18:00:00")),
                        ],
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_business_hours_permit() {
        let evaluator = RuleEvaluator::new();
        let context = DecisionContext::new(
            "a",
            AgentType::Research,
            "filesystem:read",
            "file:test.txt",
        )
        .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());

        let decision = evaluator.evaluate(&[business_hours_policy()], &context);
        assert_eq!(decision.verdict, Verdict::Permit);
        assert_eq!(decision.confidence, 1.0);
        assert_eq!(decision.metadata.engine, "declarative");
    }

    #[test]
    fn test_after_hours_is_indeterminate() {
        let evaluator = RuleEvaluator::new();
        let context = DecisionContext::new(
            "a",
            AgentType::Research,
            "filesystem:read",
            "file:test.txt",
        )
        .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap());

        let decision = evaluator.evaluate(&[business_hours_policy()], &context);
        assert_eq!(decision.verdict, Verdict::Indeterminate);
    }

    #[test]
    fn test_emergency_override_permits_after_hours() {
        let policy = record(
            "business-hours-emergency",
            10,
            DeclarativePolicy {
                permission: vec![Rule {
                    action: "filesystem:read".to_string(),
                    constraints: vec![ConstraintExpr::Or {
                        or: vec![
                            ConstraintExpr::And {
                                and: vec![
                                    atom("timeOfDay", ConstraintOperator::Gteq, json!("09:00:00")),
                                    atom("timeOfDay", ConstraintOperator::Lteq, json!("18:00:00")),
                                ],
                            },
                            atom("emergency", ConstraintOperator::Eq, json!(true)),
                        ],
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            },
        );

        let evaluator = RuleEvaluator::new();
        let context = DecisionContext::new(
            "a",
            AgentType::Research,
            "filesystem:read",
            "file:test.txt",
        )
        .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap())
        .with_env("emergency", json!(true));

        let decision = evaluator.evaluate(&[policy], &context);
        assert_eq!(decision.verdict, Verdict::Permit);
    }

    #[test]
    fn test_trust_threshold_deny() {
        let policy = record(
            "confidential-guard",
            50,
            DeclarativePolicy {
                prohibition: vec![Rule {
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
                    duties: vec!["audit".to_string()],
                    ..Default::default()
                }],
                ..Default::default()
            },
        );

        let evaluator = RuleEvaluator::new();
        let context = DecisionContext::new(
            "ext-1",
            AgentType::External,
            "filesystem:read",
            "file:secret.txt",
        )
        .with_trust_score(0.3)
        .with_classification(crate::models::ResourceClassification::Confidential);

        let decision = evaluator.evaluate(&[policy], &context);
        assert_eq!(decision.verdict, Verdict::Deny);
        assert_eq!(decision.confidence, 1.0);
        assert_eq!(decision.obligations, vec!["audit".to_string()]);
        // The reason names the grounds, not just the resource string
        assert!(decision.reason.contains("confidential"), "reason: {}", decision.reason);
        assert!(decision.reason.contains("trustScore lt 0.7"), "reason: {}", decision.reason);
    }

    #[test]
    fn test_prohibition_wins_at_equal_priority() {
        let permit = record(
            "allow-all",
            10,
            DeclarativePolicy {
                permission: vec![Rule {
                    action: "tool:call".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        let deny = record(
            "deny-tools",
            10,
            DeclarativePolicy {
                prohibition: vec![Rule {
                    action: "tool:call".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );

        let evaluator = RuleEvaluator::new();
        let context = DecisionContext::new("a", AgentType::Admin, "tool:call", "tool:fs__read");

        // Declaration order must not matter
        let d1 = evaluator.evaluate(&[permit.clone(), deny.clone()], &context);
        let d2 = evaluator.evaluate(&[deny, permit], &context);
        assert_eq!(d1.verdict, Verdict::Deny);
        assert_eq!(d2.verdict, Verdict::Deny);
    }

    #[test]
    fn test_higher_priority_permission_beats_lower_prohibition() {
        let permit = record(
            "admin-override",
            100,
            DeclarativePolicy {
                permission: vec![Rule {
                    action: "tool:call".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        let deny = record(
            "default-deny-tools",
            1,
            DeclarativePolicy {
                prohibition: vec![Rule {
                    action: "tool:call".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );

        let evaluator = RuleEvaluator::new();
        let context = DecisionContext::new("a", AgentType::Admin, "tool:call", "tool:fs__read");
        let decision = evaluator.evaluate(&[deny, permit], &context);
        assert_eq!(decision.verdict, Verdict::Permit);
        assert_eq!(decision.metadata.policy_uid.as_deref(), Some("admin-override"));
    }

    #[test]
    fn test_empty_policy_set_is_not_applicable() {
        let evaluator = RuleEvaluator::new();
        let context = DecisionContext::new("a", AgentType::System, "network:fetch", "https://x");
        let decision = evaluator.evaluate(&[], &context);
        assert_eq!(decision.verdict, Verdict::NotApplicable);
        assert_eq!(decision.metadata.matched_rules, 0);
    }

    #[test]
    fn test_type_mismatch_is_indeterminate_in_and() {
        // trustScore is unknown in the context, so the and-composition cannot
        // be satisfied and the permission must not fire.
        let policy = record(
            "needs-trust",
            10,
            DeclarativePolicy {
                permission: vec![Rule {
                    action: "tool:call".to_string(),
                    constraints: vec![atom("trustScore", ConstraintOperator::Gteq, json!(0.5))],
                    ..Default::default()
                }],
                ..Default::default()
            },
        );

        let evaluator = RuleEvaluator::new();
        let context = DecisionContext::new("a", AgentType::Unknown, "tool:call", "tool:x");
        let decision = evaluator.evaluate(&[policy], &context);
        assert_eq!(decision.verdict, Verdict::Indeterminate);
    }

    #[test]
    fn test_membership_operators() {
        assert_eq!(
            compare(
                &json!("research"),
                ConstraintOperator::IsAnyOf,
                &json!(["research", "writing"])
            ),
            ConstraintOutcome::Satisfied
        );
        assert_eq!(
            compare(
                &json!("admin"),
                ConstraintOperator::IsNoneOf,
                &json!(["research", "writing"])
            ),
            ConstraintOutcome::Satisfied
        );
        assert_eq!(
            compare(&json!("x"), ConstraintOperator::In, &json!("not-a-set")),
            ConstraintOutcome::Indeterminate
        );
    }

    #[test]
    fn test_float_equality_rounds_to_nanos() {
        assert!(float_eq(0.1 + 0.2, 0.3));
        assert!(!float_eq(0.3, 0.300000002));
    }

    #[test]
    fn test_timezone_aware_time_of_day() {
        let policy = business_hours_policy();
        let evaluator = RuleEvaluator::new();

        // 01:00 UTC is 10:00 in Tokyo
        let context = DecisionContext::new(
            "a",
            AgentType::Research,
            "filesystem:read",
            "file:test.txt",
        )
        .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap())
        .with_env("timezone", json!("Asia/Tokyo"));

        let decision = evaluator.evaluate(&[policy], &context);
        assert_eq!(decision.verdict, Verdict::Permit);
    }

    #[test]
    fn test_enforcement_directives_travel_with_decision() {
        let policy = record(
            "anonymized-reads",
            10,
            DeclarativePolicy {
                permission: vec![Rule {
                    action: "filesystem:read".to_string(),
                    constraints: vec![
                        atom("anonymize", ConstraintOperator::Eq, json!("mask")),
                        atom("rateLimit", ConstraintOperator::Eq, json!("100/min")),
                    ],
                    duties: vec!["audit".to_string()],
                    ..Default::default()
                }],
                ..Default::default()
            },
        );

        let evaluator = RuleEvaluator::new();
        let context =
            DecisionContext::new("a", AgentType::Research, "filesystem:read", "file:x.txt");
        let decision = evaluator.evaluate(&[policy], &context);

        assert_eq!(decision.verdict, Verdict::Permit);
        assert_eq!(
            decision.constraints,
            vec!["anonymize:mask".to_string(), "rateLimit:100/min".to_string()]
        );
        assert_eq!(decision.obligations, vec!["audit".to_string()]);
    }
}
