//! The agent's capabilities document, served at `GET /agent/card`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProvider {
    pub organization: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub streaming: bool,
    pub push_notifications: bool,
    pub state_transition_history: bool,
    pub max_concurrent_tasks: usize,
    pub supported_task_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub url: String,
    pub provider: AgentProvider,
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AgentCard {
    pub fn new(name: impl Into<String>, url: impl Into<String>, max_concurrent_tasks: usize) -> Self {
        Self {
            name: name.into(),
            description: "Policy-gated agent behind the Aegis gateway".to_string(),
            url: url.into(),
            provider: AgentProvider {
                organization: "Aegis".to_string(),
                url: "https://github.com/aegis-gateway/aegis-gateway".to_string(),
            },
            capabilities: AgentCapabilities {
                streaming: true,
                push_notifications: false,
                state_transition_history: true,
                max_concurrent_tasks,
                supported_task_types: vec!["prompt".to_string(), "delegation".to_string()],
            },
            metadata: serde_json::json!({}),
        }
    }
}
