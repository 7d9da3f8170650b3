use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use super::{handlers, AppState};

/// Build the main API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/health/live", get(handlers::health_check))
        .route("/health/ready", get(handlers::health_check))
        // Agent RPC surface
        .route("/rpc", post(handlers::agent_rpc))
        .route("/agent/card", get(handlers::agent_card))
        .route("/tasks/subscribe", get(handlers::subscribe_tasks))
        // MCP proxy surface
        .route(
            "/mcp/messages",
            post(handlers::mcp_messages).get(handlers::mcp_control_channel),
        )
        // Observability
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/audit/entries", get(handlers::audit_entries))
        .route("/audit/statistics", get(handlers::audit_statistics))
        // Auth applies to everything except health and metrics
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::require_auth,
        ))
        // Add state
        .with_state(state)
        // Add middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false))
                .on_response(DefaultOnResponse::new()),
        )
        .layer(CorsLayer::permissive())
}
