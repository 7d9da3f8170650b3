//! MCP-enabled agent helpers.
//!
//! Wraps the gateway's `POST /mcp/messages` endpoint with filesystem and
//! command helpers. Every call pre-populates the MCP identity headers from
//! the task's policy context; a policy denial surfaces as a typed
//! POLICY_DENIED task error.

use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::error::JSONRPC_POLICY_DENIED;
use crate::mcp::protocol::{
    JsonRpcRequest, JsonRpcResponse, HEADER_AGENT_ID, HEADER_AGENT_TYPE, HEADER_DELEGATION_CHAIN,
    HEADER_PERMISSIONS, HEADER_PRIORITY, HEADER_TASK_ID,
};
use crate::models::{DecisionContext, TaskError};

/// Tool client bound to a policy proxy endpoint
pub struct McpToolClient {
    gateway_url: String,
    /// Upstream prefix owning filesystem tools
    fs_prefix: String,
    /// Upstream prefix owning command execution
    exec_prefix: String,
    http: reqwest::Client,
}

impl McpToolClient {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            fs_prefix: "fs".to_string(),
            exec_prefix: "exec".to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(35))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_prefixes(mut self, fs: impl Into<String>, exec: impl Into<String>) -> Self {
        self.fs_prefix = fs.into();
        self.exec_prefix = exec.into();
        self
    }

    pub async fn read_file(
        &self,
        path: &str,
        policy_context: &DecisionContext,
    ) -> std::result::Result<Value, TaskError> {
        self.call_tool(
            &format!("{}__read_file", self.fs_prefix),
            json!({ "path": path }),
            policy_context,
        )
        .await
    }

    pub async fn write_file(
        &self,
        path: &str,
        content: &str,
        policy_context: &DecisionContext,
    ) -> std::result::Result<Value, TaskError> {
        self.call_tool(
            &format!("{}__write_file", self.fs_prefix),
            json!({ "path": path, "content": content }),
            policy_context,
        )
        .await
    }

    pub async fn list_directory(
        &self,
        path: &str,
        policy_context: &DecisionContext,
    ) -> std::result::Result<Value, TaskError> {
        self.call_tool(
            &format!("{}__list_directory", self.fs_prefix),
            json!({ "path": path }),
            policy_context,
        )
        .await
    }

    pub async fn execute_command(
        &self,
        command: &str,
        policy_context: &DecisionContext,
    ) -> std::result::Result<Value, TaskError> {
        self.call_tool(
            &format!("{}__run", self.exec_prefix),
            json!({ "command": command }),
            policy_context,
        )
        .await
    }

    /// One policy-gated `tools/call` through the proxy
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        policy_context: &DecisionContext,
    ) -> std::result::Result<Value, TaskError> {
        let request = JsonRpcRequest::new(
            "tools/call",
            json!({ "name": tool, "arguments": arguments }),
            Uuid::new_v4().to_string(),
        );

        let mut builder = self
            .http
            .post(format!(
                "{}/mcp/messages",
                self.gateway_url.trim_end_matches('/')
            ))
            .header(HEADER_AGENT_ID, policy_context.agent_id.as_str())
            .header(HEADER_AGENT_TYPE, policy_context.agent_type.to_string())
            .json(&request);

        if !policy_context.delegation_chain.is_empty() {
            builder = builder.header(
                HEADER_DELEGATION_CHAIN,
                serde_json::to_string(&policy_context.delegation_chain)
                    .unwrap_or_else(|_| "[]".to_string()),
            );
        }
        if !policy_context.permissions.is_empty() {
            let permissions: Vec<&String> = policy_context.permissions.iter().collect();
            builder = builder.header(
                HEADER_PERMISSIONS,
                serde_json::to_string(&permissions).unwrap_or_else(|_| "[]".to_string()),
            );
        }
        if let Some(task_id) = policy_context.environment.get("taskId").and_then(|v| v.as_str()) {
            builder = builder.header(HEADER_TASK_ID, task_id);
        }
        if let Some(priority) = policy_context
            .environment
            .get("priority")
            .and_then(|v| v.as_str())
        {
            builder = builder.header(HEADER_PRIORITY, priority);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TaskError::new("MCP_UNREACHABLE", e.to_string()))?;
        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| TaskError::new("MCP_PROTOCOL", e.to_string()))?;

        match body.error {
            Some(error) if error.code == JSONRPC_POLICY_DENIED => {
                Err(TaskError::policy_denied(error.message))
            }
            Some(error) => Err(TaskError::new("MCP_ERROR", error.message)),
            None => Ok(body.result.unwrap_or(Value::Null)),
        }
    }
}
