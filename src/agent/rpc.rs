//! JSON-RPC dispatch for the per-agent RPC surface.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, JSONRPC_INTERNAL_ERROR};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::models::{DecisionContext, TaskPriority};

use super::card::AgentCard;
use super::tasks::{TaskManager, TaskSubmission};

/// Coarse duration estimate returned by `tasks/send`, per priority
fn estimated_duration_secs(priority: TaskPriority) -> u64 {
    match priority {
        TaskPriority::Urgent => 10,
        TaskPriority::High => 30,
        TaskPriority::Normal => 60,
        TaskPriority::Low => 300,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendParams {
    prompt: String,
    #[serde(default)]
    context: Value,
    #[serde(default)]
    priority: TaskPriority,
    #[serde(default)]
    policy_context: Option<DecisionContext>,
    #[serde(default)]
    parent_task_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskIdParams {
    task_id: Uuid,
}

/// Agent-side JSON-RPC handler
pub struct AgentRpc {
    tasks: Arc<TaskManager>,
    card: AgentCard,
}

impl AgentRpc {
    pub fn new(tasks: Arc<TaskManager>, card: AgentCard) -> Self {
        Self { tasks, card }
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn card(&self) -> &AgentCard {
        &self.card
    }

    pub async fn dispatch(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        match request.method.as_str() {
            "tasks/send" => self.tasks_send(id, request.params),
            "tasks/get" => self.tasks_get(id, request.params),
            "tasks/cancel" => self.tasks_cancel(id, request.params),
            "agent/card" => match serde_json::to_value(&self.card) {
                Ok(card) => JsonRpcResponse::success(id, card),
                Err(e) => JsonRpcResponse::error(id, JSONRPC_INTERNAL_ERROR, e.to_string(), None),
            },
            "health/check" => JsonRpcResponse::success(
                id,
                json!({
                    "status": "ok",
                    "agent": self.tasks.agent_name(),
                    "activeTasks": self.tasks.task_count(),
                }),
            ),
            other => JsonRpcResponse::from_app_error(
                id,
                &AppError::MethodNotFound(other.to_string()),
            ),
        }
    }

    fn tasks_send(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let params: SendParams = match parse_params(params) {
            Ok(params) => params,
            Err(response) => return response(id),
        };
        if params.prompt.trim().is_empty() {
            return JsonRpcResponse::from_app_error(
                id,
                &AppError::Validation("prompt must not be empty".to_string()),
            );
        }

        let priority = params.priority;
        let task = self.tasks.submit(TaskSubmission {
            prompt: params.prompt,
            context: params.context,
            priority,
            policy_context: params.policy_context,
            parent_task_id: params.parent_task_id,
        });

        JsonRpcResponse::success(
            id,
            json!({
                "taskId": task.id,
                "state": task.state,
                "acceptedAt": Utc::now(),
                "estimatedDuration": estimated_duration_secs(priority),
            }),
        )
    }

    fn tasks_get(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let params: TaskIdParams = match parse_params(params) {
            Ok(params) => params,
            Err(response) => return response(id),
        };
        match self.tasks.get(&params.task_id) {
            Some(task) => match serde_json::to_value(&task) {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(e) => JsonRpcResponse::error(id, JSONRPC_INTERNAL_ERROR, e.to_string(), None),
            },
            None => JsonRpcResponse::success(id, Value::Null),
        }
    }

    fn tasks_cancel(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let params: TaskIdParams = match parse_params(params) {
            Ok(params) => params,
            Err(response) => return response(id),
        };
        match self.tasks.cancel(&params.task_id, "rpc") {
            Ok(task) => JsonRpcResponse::success(
                id,
                json!({ "taskId": task.id, "state": task.state }),
            ),
            Err(err) => JsonRpcResponse::from_app_error(id, &err),
        }
    }
}

type DeferredError = Box<dyn FnOnce(Option<Value>) -> JsonRpcResponse>;

fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<Value>,
) -> std::result::Result<T, DeferredError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| {
        let message = format!("invalid params: {}", e);
        Box::new(move |id: Option<Value>| {
            JsonRpcResponse::from_app_error(id, &AppError::Validation(message))
        }) as DeferredError
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tasks::EchoProcessor;
    use crate::models::TaskState;
    use std::time::Duration;

    fn rpc() -> AgentRpc {
        let tasks = Arc::new(TaskManager::new("rpc-agent", Arc::new(EchoProcessor), 4));
        AgentRpc::new(tasks, AgentCard::new("rpc-agent", "http://localhost:0", 4))
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(method, params, 1)
    }

    #[tokio::test]
    async fn test_send_then_get_round_trip() {
        let rpc = rpc();
        let sent = rpc
            .dispatch(request("tasks/send", json!({ "prompt": "hello" })))
            .await;
        let result = sent.result.unwrap();
        assert_eq!(result["state"], "SUBMITTED");
        assert!(result["estimatedDuration"].as_u64().unwrap() > 0);

        let task_id = result["taskId"].as_str().unwrap().to_string();
        let fetched = rpc
            .dispatch(request("tasks/get", json!({ "taskId": task_id })))
            .await;
        let task = fetched.result.unwrap();
        assert_eq!(task["prompt"], "hello");
    }

    #[tokio::test]
    async fn test_get_unknown_task_returns_null() {
        let rpc = rpc();
        let response = rpc
            .dispatch(request("tasks/get", json!({ "taskId": Uuid::new_v4() })))
            .await;
        assert_eq!(response.result, Some(Value::Null));
    }

    #[tokio::test]
    async fn test_cancel_non_terminal_task() {
        let rpc = rpc();
        // Submit with an empty slot budget? No: cancel races completion with
        // the echo processor, so submit and cancel immediately.
        let sent = rpc
            .dispatch(request("tasks/send", json!({ "prompt": "cancel me" })))
            .await;
        let task_id = sent.result.unwrap()["taskId"].as_str().unwrap().to_string();

        let cancelled = rpc
            .dispatch(request("tasks/cancel", json!({ "taskId": task_id.clone() })))
            .await;
        match cancelled.error {
            // Either the cancel won the race...
            None => {
                assert_eq!(cancelled.result.unwrap()["state"], "CANCELLED");
            }
            // ...or the echo worker already completed the task.
            Some(error) => assert!(error.message.contains("state transition")),
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_minus_32601() {
        let rpc = rpc();
        let response = rpc.dispatch(request("tasks/burn", json!({}))).await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let rpc = rpc();
        let response = rpc
            .dispatch(request("tasks/send", json!({ "prompt": "  " })))
            .await;
        assert!(response.error.unwrap().message.contains("prompt"));
    }

    #[tokio::test]
    async fn test_health_and_card() {
        let rpc = rpc();
        let health = rpc.dispatch(request("health/check", json!({}))).await;
        assert_eq!(health.result.unwrap()["status"], "ok");

        let card = rpc.dispatch(request("agent/card", json!({}))).await;
        assert_eq!(card.result.unwrap()["name"], "rpc-agent");
    }

    #[tokio::test]
    async fn test_submitted_task_completes_in_background() {
        let rpc = rpc();
        let sent = rpc
            .dispatch(request("tasks/send", json!({ "prompt": "bg" })))
            .await;
        let task_id = sent.result.unwrap()["taskId"].as_str().unwrap().to_string();

        for _ in 0..100 {
            let fetched = rpc
                .dispatch(request("tasks/get", json!({ "taskId": task_id.clone() })))
                .await;
            let state = fetched.result.as_ref().unwrap()["state"].as_str().unwrap().to_string();
            if state == TaskState::Completed.to_string() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never completed");
    }
}
