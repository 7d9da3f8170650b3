//! MCP router: multiplexes one logical tool namespace over the configured
//! upstreams, gating every request through the PDP and the enforcement
//! pipelines.

use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};

use crate::audit::{AuditOutcome, AuditRecorder};
use crate::enforcement::constraints::ConstraintPipeline;
use crate::enforcement::obligations::ObligationPipeline;
use crate::error::{AppError, Result, JSONRPC_INTERNAL_ERROR};
use crate::mcp::protocol::{
    prefixed_tool, split_prefixed_tool, JsonRpcRequest, JsonRpcResponse, McpHeaders,
};
use crate::mcp::supervisor::spawn_supervisor;
use crate::mcp::upstream::{UpstreamConfig, UpstreamHandle};
use crate::metrics;
use crate::models::{Decision, DecisionContext};
use crate::pdp::HybridPdp;
use crate::policy::PolicyStore;

/// Default budget for one forwarded request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `start` waits for the initial upstream handshakes
const STARTUP_CONNECT_WAIT: Duration = Duration::from_secs(10);

/// The policy-enforcing proxy core
pub struct McpRouter {
    upstreams: Vec<Arc<UpstreamHandle>>,
    by_name: HashMap<String, Arc<UpstreamHandle>>,
    pdp: Arc<HybridPdp>,
    policy_store: Arc<PolicyStore>,
    constraints: Arc<ConstraintPipeline>,
    obligations: Arc<ObligationPipeline>,
    audit: Arc<AuditRecorder>,
    request_timeout: Duration,
    stop_tx: watch::Sender<bool>,
    supervisors: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl McpRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        configs: Vec<UpstreamConfig>,
        pdp: Arc<HybridPdp>,
        policy_store: Arc<PolicyStore>,
        constraints: Arc<ConstraintPipeline>,
        obligations: Arc<ObligationPipeline>,
        audit: Arc<AuditRecorder>,
        request_timeout: Duration,
    ) -> Self {
        let upstreams: Vec<Arc<UpstreamHandle>> = configs
            .into_iter()
            .map(|config| Arc::new(UpstreamHandle::new(config)))
            .collect();
        let by_name = upstreams
            .iter()
            .map(|u| (u.name().to_string(), u.clone()))
            .collect();
        let (stop_tx, _) = watch::channel(false);

        Self {
            upstreams,
            by_name,
            pdp,
            policy_store,
            constraints,
            obligations,
            audit,
            request_timeout,
            stop_tx,
            supervisors: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one supervisor per upstream and wait (bounded) for the initial
    /// handshakes. Upstreams that fail to come up keep retrying under their
    /// supervisor; start itself only reports.
    pub async fn start(&self) {
        {
            let mut supervisors = self.supervisors.lock().await;
            for handle in &self.upstreams {
                supervisors.push(spawn_supervisor(handle.clone(), self.stop_tx.subscribe()));
            }
        }

        let deadline = Instant::now() + STARTUP_CONNECT_WAIT;
        loop {
            let connected = self.upstreams.iter().filter(|u| u.is_connected()).count();
            if connected == self.upstreams.len() || Instant::now() >= deadline {
                tracing::info!(
                    connected,
                    total = self.upstreams.len(),
                    "MCP router started"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop every child and discard pending work
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let mut supervisors = self.supervisors.lock().await;
        for task in supervisors.drain(..) {
            let _ = task.await;
        }
        tracing::info!("MCP router stopped");
    }

    pub fn connected_upstreams(&self) -> Vec<String> {
        self.upstreams
            .iter()
            .filter(|u| u.is_connected())
            .map(|u| u.name().to_string())
            .collect()
    }

    /// Dispatch one JSON-RPC request from a caller
    pub async fn handle(&self, request: JsonRpcRequest, headers: &McpHeaders) -> JsonRpcResponse {
        let timer = metrics::REQUEST_DURATION_SECONDS
            .with_label_values(&[request.method.as_str()])
            .start_timer();
        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(request.id.clone(), self.proxy_capabilities()),
            "tools/list" => self.handle_tools_list(request.id.clone()).await,
            "tools/call" => self.handle_tools_call(&request, headers).await,
            _ => self.handle_capability_route(&request).await,
        };
        timer.observe_duration();
        response
    }

    fn proxy_capabilities(&self) -> Value {
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "tools": { "listChanged": true },
                "resources": {},
            },
            "serverInfo": {
                "name": "aegis-gateway",
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    /// Fan out to every connected upstream in parallel, rewrite each tool
    /// name with the upstream prefix, return the union. No ordering promise
    /// across upstreams.
    async fn handle_tools_list(&self, id: Option<Value>) -> JsonRpcResponse {
        let connected: Vec<Arc<UpstreamHandle>> = self
            .upstreams
            .iter()
            .filter(|u| u.is_connected())
            .cloned()
            .collect();

        let lists = join_all(connected.iter().map(|upstream| {
            let upstream = upstream.clone();
            let timeout = self.request_timeout;
            async move {
                let result = upstream.request("tools/list", json!({}), timeout).await;
                (upstream, result)
            }
        }))
        .await;

        let mut tools = Vec::new();
        for (upstream, result) in lists {
            match result {
                Ok(value) => {
                    let upstream_tools = value
                        .get("tools")
                        .and_then(|t| t.as_array())
                        .cloned()
                        .unwrap_or_default();
                    for mut tool in upstream_tools {
                        if let Some(name) = tool.get("name").and_then(|n| n.as_str()) {
                            let renamed = prefixed_tool(upstream.name(), name);
                            tool["name"] = Value::String(renamed);
                            tools.push(tool);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(upstream = %upstream.name(), error = %e, "tools/list fan-out failed");
                }
            }
        }

        JsonRpcResponse::success(id, json!({ "tools": tools }))
    }

    /// PDP-gated forward of a `tools/call` to the owning upstream
    async fn handle_tools_call(
        &self,
        request: &JsonRpcRequest,
        headers: &McpHeaders,
    ) -> JsonRpcResponse {
        let started = Instant::now();
        let params = request.params.clone().unwrap_or(Value::Null);
        let Some(full_name) = params.get("name").and_then(|n| n.as_str()).map(String::from) else {
            return JsonRpcResponse::error(
                request.id.clone(),
                JSONRPC_INTERNAL_ERROR,
                "tools/call requires a tool name",
                None,
            );
        };

        let Some((prefix, tool)) = split_prefixed_tool(&full_name) else {
            return JsonRpcResponse::from_app_error(
                request.id.clone(),
                &AppError::UpstreamUnavailable(format!(
                    "tool '{}' carries no upstream prefix",
                    full_name
                )),
            );
        };
        let Some(upstream) = self.by_name.get(prefix) else {
            return JsonRpcResponse::from_app_error(
                request.id.clone(),
                &AppError::UpstreamUnavailable(format!("no upstream owns prefix '{}'", prefix)),
            );
        };

        let context = headers.to_context("tool:call", &full_name);
        match self.authorize_and_forward(&context, upstream, tool, &params, started).await {
            Ok(result) => {
                metrics::ROUTED_CALLS_TOTAL
                    .with_label_values(&[prefix, "success"])
                    .inc();
                JsonRpcResponse::success(request.id.clone(), result)
            }
            Err(err) => {
                metrics::ROUTED_CALLS_TOTAL
                    .with_label_values(&[prefix, "error"])
                    .inc();
                JsonRpcResponse::from_app_error(request.id.clone(), &err)
            }
        }
    }

    async fn authorize_and_forward(
        &self,
        context: &DecisionContext,
        upstream: &Arc<UpstreamHandle>,
        tool: &str,
        params: &Value,
        started: Instant,
    ) -> Result<Value> {
        let snapshot = self.policy_store.snapshot();
        let decision = self.pdp.decide(context, &snapshot).await;
        metrics::DECISIONS_TOTAL
            .with_label_values(&[&decision.verdict.to_string(), &decision.metadata.engine])
            .inc();

        // Every decision lands in the audit trail within the request span.
        self.record_audit(context, &decision, started);

        if !decision.verdict.is_permit() {
            self.fire_obligations(&decision, context);
            return Err(deny_error(&decision));
        }

        let forwarded = json!({
            "name": tool,
            "arguments": params.get("arguments").cloned().unwrap_or(json!({})),
        });
        let timeout = self.request_timeout;
        let upstream = upstream.clone();
        let result = self
            .constraints
            .execute(&decision.constraints, context, move || async move {
                upstream.request("tools/call", forwarded, timeout).await
            })
            .await?;

        self.fire_obligations(&decision, context);
        Ok(result)
    }

    fn record_audit(&self, context: &DecisionContext, decision: &Decision, started: Instant) {
        let outcome = if decision.verdict.is_permit() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.audit.record_decision(
            context,
            decision,
            started.elapsed().as_millis() as u64,
            outcome,
        );
    }

    /// Obligations run off the request path; failures are contained inside
    /// the pipeline.
    fn fire_obligations(&self, decision: &Decision, context: &DecisionContext) {
        if decision.obligations.is_empty() {
            return;
        }
        let obligations = self.obligations.clone();
        let directives = decision.obligations.clone();
        let context = context.clone();
        let decision = decision.clone();
        tokio::spawn(async move {
            let report = obligations.dispatch(&directives, &context, &decision).await;
            tracing::debug!(
                executed = report.executed,
                failed = report.failed,
                skipped = report.skipped,
                "Obligations dispatched"
            );
        });
    }

    /// Non-tool methods route to the first upstream advertising the
    /// capability; there is no broadcast.
    async fn handle_capability_route(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let capability = request.method.split('/').next().unwrap_or_default();

        for upstream in &self.upstreams {
            if !upstream.is_connected() {
                continue;
            }
            let advertises = upstream
                .capabilities()
                .await
                .map(|caps| caps.get(capability).is_some())
                .unwrap_or(false);
            if !advertises {
                continue;
            }

            let result = upstream
                .request(
                    &request.method,
                    request.params.clone().unwrap_or(json!({})),
                    self.request_timeout,
                )
                .await;
            return match result {
                Ok(value) => JsonRpcResponse::success(request.id.clone(), value),
                Err(err) => JsonRpcResponse::from_app_error(request.id.clone(), &err),
            };
        }

        JsonRpcResponse::from_app_error(
            request.id.clone(),
            &AppError::UpstreamUnavailable(format!(
                "no connected upstream advertises '{}'",
                capability
            )),
        )
    }
}

/// Map a non-PERMIT decision to the boundary error
fn deny_error(decision: &Decision) -> AppError {
    if decision.verdict.is_deny() {
        AppError::PolicyDenied(decision.reason.clone())
    } else {
        // INDETERMINATE and NOT_APPLICABLE become DENY at the boundary but
        // are logged distinctly for audit.
        AppError::PolicyIndeterminate(decision.reason.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Verdict;

    #[test]
    fn test_deny_error_mapping() {
        let deny = Decision::deny("external agents may not call tools");
        match deny_error(&deny) {
            AppError::PolicyDenied(reason) => {
                assert_eq!(reason, "external agents may not call tools")
            }
            other => panic!("unexpected mapping: {:?}", other),
        }

        let indeterminate = Decision::indeterminate("nothing matched", 0.0);
        assert!(matches!(
            deny_error(&indeterminate),
            AppError::PolicyIndeterminate(_)
        ));

        let na = Decision::not_applicable("empty set");
        assert_eq!(na.verdict, Verdict::NotApplicable);
        assert!(matches!(deny_error(&na), AppError::PolicyIndeterminate(_)));
    }
}
