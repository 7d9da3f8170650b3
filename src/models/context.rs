use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use strum::{Display, EnumString};
use validator::Validate;

/// Classification of the agent originating a request
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentType {
    Research,
    Writing,
    Coordinator,
    Admin,
    System,
    External,
    #[default]
    Unknown,
}

/// Sensitivity classification of the requested resource
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResourceClassification {
    Public,
    Internal,
    Confidential,
    Critical,
}

/// The input to every PDP evaluation.
///
/// Every field except the first four is optional; missing values are treated
/// as unknown, never as a permissive default.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DecisionContext {
    /// Caller identity (authenticated at the network edge)
    #[validate(length(min = 1, max = 255))]
    pub agent_id: String,

    /// Origin classification
    pub agent_type: AgentType,

    /// Dotted action taxonomy, e.g. `filesystem:read`, `tool:call`, `task:delegate`
    #[validate(length(min = 1, max = 255))]
    pub action: String,

    /// URI-shaped resource identifier
    #[validate(length(max = 2048))]
    pub resource: String,

    /// Sensitivity of the resource, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_classification: Option<ResourceClassification>,

    /// Request timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Trust score in [0, 1], when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_score: Option<f64>,

    /// Clearance level, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clearance_level: Option<String>,

    /// Ordered agent IDs from origin to current
    #[serde(default)]
    pub delegation_chain: Vec<String>,

    /// Permissions asserted by the caller; advisory only
    #[serde(default)]
    pub permissions: BTreeSet<String>,

    /// Free-form environment attributes (clientIP, location, sessionId,
    /// emergency flag, extensions)
    #[serde(default)]
    pub environment: HashMap<String, serde_json::Value>,
}

impl DecisionContext {
    /// Create a context with the four mandatory fields; everything else unknown
    pub fn new(
        agent_id: impl Into<String>,
        agent_type: AgentType,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type,
            action: action.into(),
            resource: resource.into(),
            resource_classification: None,
            timestamp: Utc::now(),
            trust_score: None,
            clearance_level: None,
            delegation_chain: Vec::new(),
            permissions: BTreeSet::new(),
            environment: HashMap::new(),
        }
    }

    /// Set an environment attribute
    pub fn with_env(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.environment.insert(key.into(), value);
        self
    }

    pub fn with_trust_score(mut self, score: f64) -> Self {
        self.trust_score = Some(score);
        self
    }

    pub fn with_classification(mut self, classification: ResourceClassification) -> Self {
        self.resource_classification = Some(classification);
        self
    }

    pub fn with_delegation_chain(mut self, chain: Vec<String>) -> Self {
        self.delegation_chain = chain;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Client IP from the environment map, if present
    pub fn client_ip(&self) -> Option<&str> {
        self.environment.get("clientIP").and_then(|v| v.as_str())
    }

    /// IANA timezone from the environment map, if present
    pub fn timezone(&self) -> Option<&str> {
        self.environment.get("timezone").and_then(|v| v.as_str())
    }

    /// Whether the emergency flag is set in the environment
    pub fn is_emergency(&self) -> bool {
        self.environment
            .get("emergency")
            .map(|v| v.as_bool().unwrap_or(false) || v.as_str() == Some("true"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_defaults_are_unknown() {
        let ctx = DecisionContext::new(
            "agent-1",
            AgentType::Research,
            "filesystem:read",
            "file:///tmp/report.txt",
        );

        assert!(ctx.trust_score.is_none());
        assert!(ctx.resource_classification.is_none());
        assert!(ctx.clearance_level.is_none());
        assert!(ctx.delegation_chain.is_empty());
        assert!(ctx.permissions.is_empty());
        assert!(!ctx.is_emergency());
    }

    #[test]
    fn test_environment_accessors() {
        let ctx = DecisionContext::new("a", AgentType::External, "tool:call", "tool:fs__read")
            .with_env("clientIP", json!("203.0.113.7"))
            .with_env("emergency", json!(true))
            .with_env("timezone", json!("Asia/Tokyo"));

        assert_eq!(ctx.client_ip(), Some("203.0.113.7"));
        assert_eq!(ctx.timezone(), Some("Asia/Tokyo"));
        assert!(ctx.is_emergency());
    }

    #[test]
    fn test_wire_shape_is_camel_case() {
        let ctx = DecisionContext::new("a", AgentType::Coordinator, "task:delegate", "task:child")
            .with_trust_score(0.9);
        let value = serde_json::to_value(&ctx).unwrap();

        assert_eq!(value["agentId"], "a");
        assert_eq!(value["agentType"], "coordinator");
        assert_eq!(value["trustScore"], 0.9);
        assert!(value["delegationChain"].is_array());
    }

    #[test]
    fn test_agent_type_parses_from_string() {
        assert_eq!("external".parse::<AgentType>().unwrap(), AgentType::External);
        assert_eq!("admin".parse::<AgentType>().unwrap(), AgentType::Admin);
        assert!("alien".parse::<AgentType>().is_err());
    }
}
