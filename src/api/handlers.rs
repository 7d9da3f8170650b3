//! Request handlers for the gateway's HTTP surface.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::audit::AuditQuery;
use crate::mcp::protocol::{JsonRpcRequest, McpHeaders};
use crate::metrics;
use crate::models::TaskUpdate;

use super::AppState;

/// `GET /health`
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "upstreams": state.router.connected_upstreams(),
        "activeTasks": state.agent_rpc.tasks().task_count(),
    }))
}

/// `GET /agent/card`
pub async fn agent_card(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::to_value(state.agent_rpc.card()).unwrap_or(json!({})))
}

/// `POST /rpc` — agent task methods
pub async fn agent_rpc(
    State(state): State<AppState>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let response = state.agent_rpc.dispatch(request).await;
    Json(response)
}

/// `POST /mcp/messages` — proxied tool-invocation RPC
pub async fn mcp_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let envelope = McpHeaders::from_header_map(&headers);
    let response = state.router.handle(request, &envelope).await;
    Json(response)
}

/// `GET /mcp/messages` — SSE control channel with a session id
pub async fn mcp_control_channel() -> impl IntoResponse {
    let session_id = Uuid::new_v4().to_string();

    let endpoint_event = stream::once(async {
        Ok::<Event, Infallible>(Event::default().event("endpoint").data("/mcp/messages"))
    });
    let sse = Sse::new(endpoint_event.chain(stream::pending()))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)));

    ([("mcp-session-id", session_id)], sse)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeParams {
    pub task_id: Uuid,
    #[serde(default)]
    pub include_history: bool,
}

/// `GET /tasks/subscribe?taskId=..&includeHistory=..` — task-update SSE.
/// History events precede live events when requested.
pub async fn subscribe_tasks(
    State(state): State<AppState>,
    Query(params): Query<SubscribeParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let manager = state.agent_rpc.tasks().clone();
    let task_id = params.task_id;

    let history: Vec<TaskUpdate> = if params.include_history {
        manager.history_updates(&task_id)
    } else {
        Vec::new()
    };
    let history_stream = stream::iter(history.into_iter().map(to_sse_event));

    let live = BroadcastStream::new(manager.subscribe()).filter_map(move |update| async move {
        match update {
            Ok(update) if update.task_id == task_id => Some(to_sse_event(update)),
            _ => None,
        }
    });

    Sse::new(history_stream.chain(live))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn to_sse_event(update: TaskUpdate) -> Result<Event, Infallible> {
    let data = serde_json::to_string(&update).unwrap_or_else(|_| "{}".to_string());
    Ok(Event::default().data(data))
}

/// `GET /metrics`
pub async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

/// `GET /audit/entries`
pub async fn audit_entries(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> impl IntoResponse {
    Json(state.audit.query(&query))
}

/// `GET /audit/statistics`
pub async fn audit_statistics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.audit.statistics())
}

/// Bearer-token check applied to everything except health and metrics
pub async fn require_auth(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    if !state.auth.enabled {
        return next.run(request).await;
    }

    let path = request.uri().path();
    if path.starts_with("/health") || path.starts_with("/metrics") {
        return next.run(request).await;
    }

    let authorized = state.auth.token.as_deref().is_some_and(|token| {
        request
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            == Some(token)
    });

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": {
                    "code": "AUTHENTICATION_ERROR",
                    "message": "missing or invalid bearer token",
                }
            })),
        )
            .into_response()
    }
}
