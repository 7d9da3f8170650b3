//! JSON-RPC 2.0 wire types and the MCP header envelope.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::models::{AgentType, DecisionContext};

/// Separator between the upstream prefix and the tool name
pub const TOOL_PREFIX_SEPARATOR: &str = "__";

pub const HEADER_AGENT_ID: &str = "x-agent-id";
pub const HEADER_AGENT_TYPE: &str = "x-agent-type";
pub const HEADER_AGENT_METADATA: &str = "x-agent-metadata";
pub const HEADER_AGENT_INSTANCE: &str = "x-agent-instance";
pub const HEADER_TASK_ID: &str = "x-task-id";
pub const HEADER_DELEGATION_CHAIN: &str = "x-delegation-chain";
pub const HEADER_PRIORITY: &str = "x-priority";
pub const HEADER_PERMISSIONS: &str = "x-permissions";

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: impl Into<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(id.into()),
        }
    }

    /// Notifications carry no id and expect no response
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }

    /// Translate an application error at the RPC boundary
    pub fn from_app_error(id: Option<Value>, err: &AppError) -> Self {
        let message = match err {
            AppError::PolicyDenied(reason) => format!("Policy denied: {}", reason),
            AppError::PolicyIndeterminate(reason) => format!("Policy denied: {}", reason),
            AppError::ConstraintViolation(e) => format!("Policy denied: {}", e),
            other => other.to_string(),
        };
        Self::error(id, err.jsonrpc_code(), message, err.jsonrpc_data())
    }
}

/// Rewrite a tool name with its owning upstream's prefix
pub fn prefixed_tool(upstream: &str, tool: &str) -> String {
    format!("{}{}{}", upstream, TOOL_PREFIX_SEPARATOR, tool)
}

/// Split `<upstream>__<tool>` back into its parts
pub fn split_prefixed_tool(name: &str) -> Option<(&str, &str)> {
    name.split_once(TOOL_PREFIX_SEPARATOR)
        .filter(|(upstream, tool)| !upstream.is_empty() && !tool.is_empty())
}

/// The agent-identity envelope carried on `POST /mcp/messages`
#[derive(Debug, Clone, Default)]
pub struct McpHeaders {
    pub agent_id: Option<String>,
    pub agent_type: Option<AgentType>,
    pub agent_metadata: Option<Value>,
    pub agent_instance: Option<String>,
    pub task_id: Option<String>,
    pub delegation_chain: Vec<String>,
    pub priority: Option<String>,
    pub permissions: Vec<String>,
}

impl McpHeaders {
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };

        Self {
            agent_id: text(HEADER_AGENT_ID),
            agent_type: text(HEADER_AGENT_TYPE).and_then(|s| s.parse().ok()),
            agent_metadata: text(HEADER_AGENT_METADATA)
                .and_then(|s| serde_json::from_str(&s).ok()),
            agent_instance: text(HEADER_AGENT_INSTANCE),
            task_id: text(HEADER_TASK_ID),
            delegation_chain: text(HEADER_DELEGATION_CHAIN)
                .and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
                .unwrap_or_default(),
            priority: text(HEADER_PRIORITY),
            permissions: text(HEADER_PERMISSIONS)
                .and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
                .unwrap_or_default(),
        }
    }

    /// Build the PDP context for an action/resource pair. An absent agent
    /// identity maps to the unknown agent, never to a permissive default.
    pub fn to_context(&self, action: &str, resource: &str) -> DecisionContext {
        let mut context = DecisionContext::new(
            self.agent_id.clone().unwrap_or_else(|| "anonymous".to_string()),
            self.agent_type.unwrap_or_default(),
            action,
            resource,
        );
        context.delegation_chain = self.delegation_chain.clone();
        context.permissions = self.permissions.iter().cloned().collect();
        if let Some(task_id) = &self.task_id {
            context
                .environment
                .insert("taskId".to_string(), Value::String(task_id.clone()));
        }
        if let Some(priority) = &self.priority {
            context
                .environment
                .insert("priority".to_string(), Value::String(priority.clone()));
        }
        if let Some(instance) = &self.agent_instance {
            context
                .environment
                .insert("agentInstance".to_string(), Value::String(instance.clone()));
        }
        if let Some(metadata) = &self.agent_metadata {
            context
                .environment
                .insert("agentMetadata".to_string(), metadata.clone());
        }
        context
    }
}
