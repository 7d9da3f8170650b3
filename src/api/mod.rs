//! HTTP surface: the JSON-RPC endpoints, SSE streams, and health/metrics.

pub mod handlers;
pub mod routes;

use std::sync::Arc;

use crate::agent::AgentRpc;
use crate::audit::AuditRecorder;
use crate::config::AuthSection;
use crate::mcp::McpRouter;

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<McpRouter>,
    pub agent_rpc: Arc<AgentRpc>,
    pub audit: Arc<AuditRecorder>,
    pub auth: Arc<AuthSection>,
}

impl AppState {
    pub fn new(
        router: Arc<McpRouter>,
        agent_rpc: Arc<AgentRpc>,
        audit: Arc<AuditRecorder>,
        auth: AuthSection,
    ) -> Self {
        Self {
            router,
            agent_rpc,
            audit,
            auth: Arc::new(auth),
        }
    }
}

pub use routes::build_router;
