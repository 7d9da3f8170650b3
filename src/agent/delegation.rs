//! Task delegation with a verifiable chain.
//!
//! The delegating agent appends its own name to the chain *before* the
//! outbound dispatch; chain length and duplicate checks run synchronously
//! ahead of any network I/O.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::models::{DecisionContext, TaskPriority};
use crate::pdp::DEFAULT_MAX_DELEGATION_DEPTH;

/// Outbound delegation parameters
#[derive(Debug, Clone)]
pub struct DelegationParams {
    pub prompt: String,
    pub context: Value,
    pub priority: TaskPriority,
    pub policy_context: DecisionContext,
    pub parent_task_id: Option<Uuid>,
}

/// Client side of agent-to-agent delegation
pub struct DelegationClient {
    agent_name: String,
    /// Targets must be known at startup; name -> base URL
    known_targets: HashMap<String, String>,
    max_depth: usize,
    http: reqwest::Client,
}

impl DelegationClient {
    pub fn new(agent_name: impl Into<String>, known_targets: HashMap<String, String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            known_targets,
            max_depth: DEFAULT_MAX_DELEGATION_DEPTH,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn known_targets(&self) -> Vec<&str> {
        self.known_targets.keys().map(|k| k.as_str()).collect()
    }

    /// Validate the chain after appending this agent, without dispatching
    fn extended_chain(&self, policy_context: &DecisionContext) -> Result<Vec<String>> {
        let mut chain = policy_context.delegation_chain.clone();
        chain.push(self.agent_name.clone());

        if chain.len() > self.max_depth {
            return Err(AppError::Delegation(format!(
                "delegation chain length {} exceeds maximum {}",
                chain.len(),
                self.max_depth
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &chain {
            if !seen.insert(agent.clone()) {
                return Err(AppError::Delegation(format!(
                    "delegation chain already contains '{}'",
                    agent
                )));
            }
        }
        Ok(chain)
    }

    /// Perform an outbound `tasks/send` against a known target.
    ///
    /// Invariant on success: the forwarded chain ends with this agent's
    /// name, is duplicate-free, and is within the depth bound.
    pub async fn delegate_task(&self, target: &str, params: DelegationParams) -> Result<Value> {
        let url = self.known_targets.get(target).ok_or_else(|| {
            AppError::Delegation(format!("delegation target '{}' is not known", target))
        })?;

        let chain = self.extended_chain(&params.policy_context)?;
        let mut policy_context = params.policy_context.clone();
        policy_context.delegation_chain = chain;

        let request = JsonRpcRequest::new(
            "tasks/send",
            json!({
                "prompt": params.prompt,
                "context": params.context,
                "priority": params.priority,
                "policyContext": policy_context,
                "parentTaskId": params.parent_task_id,
            }),
            Uuid::new_v4().to_string(),
        );

        tracing::info!(
            target,
            chain_len = policy_context.delegation_chain.len(),
            "Delegating task"
        );

        let response = self
            .http
            .post(format!("{}/rpc", url.trim_end_matches('/')))
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Network(format!("delegation to '{}' failed: {}", target, e)))?;

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| AppError::Network(format!("malformed delegation response: {}", e)))?;

        match body.error {
            Some(error) => Err(AppError::Delegation(format!(
                "target rejected delegation: {}",
                error.message
            ))),
            None => Ok(body.result.unwrap_or(Value::Null)),
        }
    }
}
