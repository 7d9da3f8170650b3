use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use validator::Validate;

/// Constraint comparison operators (ODRL-shaped)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ConstraintOperator {
    Eq,
    Neq,
    Lt,
    Lteq,
    Gt,
    Gteq,
    In,
    IsAnyOf,
    IsNoneOf,
}

/// A single constraint: `leftOperand operator rightOperand`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub left_operand: String,
    pub operator: ConstraintOperator,
    pub right_operand: serde_json::Value,
}

impl Constraint {
    pub fn new(
        left: impl Into<String>,
        operator: ConstraintOperator,
        right: serde_json::Value,
    ) -> Self {
        Self {
            left_operand: left.into(),
            operator,
            right_operand: right,
        }
    }

    /// Operands in this set are payload-enforcement directives, not context
    /// attributes: they are never evaluated for rule matching and are copied
    /// into the decision's constraint list instead.
    pub fn is_enforcement_directive(&self) -> bool {
        matches!(
            self.left_operand.as_str(),
            "anonymize"
                | "rateLimit"
                | "geoRestriction"
                | "fieldFilter"
                | "maxRecords"
                | "maxSize"
                | "executionTimeLimit"
        )
    }

    /// Render this constraint as an opaque pipeline directive string.
    ///
    /// `eq` renders as `left:value`; other operators keep their infix form so
    /// the pipeline can log what it skipped.
    pub fn to_directive(&self) -> String {
        let value = match &self.right_operand {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match self.operator {
            ConstraintOperator::Eq => format!("{}:{}", self.left_operand, value),
            op => format!("{} {} {}", self.left_operand, op, value),
        }
    }
}

/// Constraint expression tree: a leaf comparison or an and/or composition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConstraintExpr {
    And {
        and: Vec<ConstraintExpr>,
    },
    Or {
        or: Vec<ConstraintExpr>,
    },
    Atom(Constraint),
}

/// A permission or prohibition rule
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Action pattern: literal (`filesystem:read`) or prefix (`filesystem:*`)
    pub action: String,

    /// Optional target resource pattern
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Constraints that must hold for the rule to apply
    #[serde(default)]
    pub constraints: Vec<ConstraintExpr>,

    /// Obligation directives owed when this rule determines the outcome
    #[serde(default)]
    pub duties: Vec<String>,

    /// Original natural-language wording, when the rule was derived from text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub natural_language_source: Option<String>,
}

impl Rule {
    /// Whether this rule's action pattern matches the requested action
    pub fn matches_action(&self, action: &str) -> bool {
        if let Some(prefix) = self.action.strip_suffix('*') {
            action.starts_with(prefix)
        } else {
            self.action == action || self.action == "*"
        }
    }

    /// Whether this rule's target pattern (if any) matches the resource
    pub fn matches_target(&self, resource: &str) -> bool {
        match &self.target {
            None => true,
            Some(pattern) => {
                if let Some(prefix) = pattern.strip_suffix('*') {
                    resource.starts_with(prefix)
                } else {
                    pattern == resource
                }
            }
        }
    }
}

/// A declarative (ODRL-shaped) policy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeclarativePolicy {
    pub uid: String,

    /// Higher priority wins on conflict
    #[serde(default)]
    pub priority: i64,

    #[serde(default)]
    pub permission: Vec<Rule>,

    #[serde(default)]
    pub prohibition: Vec<Rule>,

    /// Policy-level obligation directives, owed whenever the policy decides
    #[serde(default)]
    pub duty: Vec<String>,
}

/// The two interoperable policy shapes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyBody {
    Declarative(DeclarativePolicy),
    NaturalLanguage(String),
}

impl PolicyBody {
    pub fn as_declarative(&self) -> Option<&DeclarativePolicy> {
        match self {
            PolicyBody::Declarative(p) => Some(p),
            PolicyBody::NaturalLanguage(_) => None,
        }
    }

    pub fn as_natural_language(&self) -> Option<&str> {
        match self {
            PolicyBody::Declarative(_) => None,
            PolicyBody::NaturalLanguage(text) => Some(text),
        }
    }
}

/// Lifecycle status of a stored policy
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PolicyStatus {
    #[default]
    Active,
    Inactive,
    Draft,
}

/// Store-level policy metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetadata {
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<String>,
}

/// A stored policy: body plus administrative envelope
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRecord {
    pub id: String,

    #[validate(length(min = 1, max = 255))]
    pub name: String,

    /// Semantic version, patch-bumped on update
    pub version: String,

    #[serde(default)]
    pub status: PolicyStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub policy: PolicyBody,

    pub metadata: PolicyMetadata,
}

impl PolicyRecord {
    pub fn is_active(&self) -> bool {
        self.status == PolicyStatus::Active
    }

    /// Effective priority: declarative body priority wins over envelope priority
    pub fn priority(&self) -> i64 {
        match &self.policy {
            PolicyBody::Declarative(p) if p.priority != 0 => p.priority,
            _ => self.metadata.priority,
        }
    }
}
