//! MCP router scenarios against fake stdio upstreams: prefix routing,
//! list aggregation, policy gating, and forwarded-request timeouts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aegis_gateway::audit::AuditRecorder;
use aegis_gateway::enforcement::constraints::{
    ConstraintPipeline, GeoConfig, RateLimitConfig, TokenStore,
};
use aegis_gateway::enforcement::obligations::ObligationPipeline;
use aegis_gateway::mcp::protocol::{JsonRpcRequest, McpHeaders};
use aegis_gateway::mcp::{McpRouter, UpstreamConfig};
use aegis_gateway::models::{
    DeclarativePolicy, PolicyBody, PolicyMetadata, PolicyRecord, PolicyStatus, Rule, Verdict,
};
use aegis_gateway::pdp::{DecisionCache, HybridPdp, PdpConfig};
use aegis_gateway::policy::{PolicyFile, PolicyStore};
use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;

/// A line-oriented fake MCP server: records every request it receives and
/// answers by method, echoing the caller's id.
const FAKE_SERVER: &str = r#"
while read -r line; do
  printf '%s\n' "$line" >> "$CAPTURE_FILE"
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","result":{"capabilities":{"tools":{},"resources":{}}},"id":%s}\n' "$id";;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","result":{"tools":[%s]},"id":%s}\n' "$TOOLS" "$id";;
    *'"tools/call"'*) printf '{"jsonrpc":"2.0","result":{"servedBy":"%s"},"id":%s}\n' "$SERVER_NAME" "$id";;
    *) printf '{"jsonrpc":"2.0","result":{},"id":%s}\n' "$id";;
  esac
done
"#;

/// Variant that never answers tool calls, to exercise the request timeout.
const STALLING_SERVER: &str = r#"
while read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","result":{"capabilities":{"tools":{}}},"id":%s}\n' "$id";;
    *'"tools/call"'*) ;;
    *) printf '{"jsonrpc":"2.0","result":{},"id":%s}\n' "$id";;
  esac
done
"#;

fn fake_upstream(name: &str, script: &str, capture: &PathBuf, tools: &str) -> UpstreamConfig {
    let mut env = HashMap::new();
    env.insert("CAPTURE_FILE".to_string(), capture.display().to_string());
    env.insert("TOOLS".to_string(), tools.to_string());
    env.insert("SERVER_NAME".to_string(), name.to_string());
    UpstreamConfig {
        name: name.to_string(),
        transport: None,
        command: Some("/bin/sh".to_string()),
        args: vec!["-c".to_string(), script.to_string()],
        env,
        url: None,
    }
}

fn policy_record(id: &str, permission: Vec<Rule>, prohibition: Vec<Rule>, priority: i64) -> PolicyRecord {
    PolicyRecord {
        id: id.to_string(),
        name: id.to_string(),
        version: "1.0.0".to_string(),
        status: PolicyStatus::Active,
        description: None,
        policy: PolicyBody::Declarative(DeclarativePolicy {
            uid: id.to_string(),
            priority,
            permission,
            prohibition,
            duty: vec![],
        }),
        metadata: PolicyMetadata {
            priority,
            tags: vec![],
            created_at: Utc::now(),
            created_by: "test".to_string(),
            last_modified: None,
            last_modified_by: None,
        },
    }
}

struct TestGateway {
    router: McpRouter,
    audit: Arc<AuditRecorder>,
    _dir: TempDir,
}

async fn gateway(
    upstreams: Vec<UpstreamConfig>,
    policies: Vec<PolicyRecord>,
    request_timeout: Duration,
) -> TestGateway {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(PolicyStore::open(dir.path().join("policies.json")).unwrap());
    store.import(PolicyFile { policies }).unwrap();

    let audit = Arc::new(AuditRecorder::in_memory());
    let pdp = Arc::new(HybridPdp::new(
        None,
        Arc::new(DecisionCache::with_defaults()),
        PdpConfig::default(),
    ));
    let constraints = Arc::new(ConstraintPipeline::with_defaults(
        Arc::new(TokenStore::new()),
        RateLimitConfig::default(),
        GeoConfig::default(),
    ));
    let obligations = Arc::new(ObligationPipeline::new(None));

    let router = McpRouter::new(
        upstreams,
        pdp,
        store,
        constraints,
        obligations,
        audit.clone(),
        request_timeout,
    );
    router.start().await;

    TestGateway {
        router,
        audit,
        _dir: dir,
    }
}

fn permit_tool_calls() -> PolicyRecord {
    policy_record(
        "allow-tools",
        vec![Rule {
            action: "tool:call".to_string(),
            ..Default::default()
        }],
        vec![],
        1,
    )
}

fn headers(agent: &str) -> McpHeaders {
    McpHeaders {
        agent_id: Some(agent.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn tools_list_aggregates_with_prefixes() {
    let dir = TempDir::new().unwrap();
    let fs_capture = dir.path().join("fs.log");
    let exec_capture = dir.path().join("exec.log");

    let gw = gateway(
        vec![
            fake_upstream(
                "fs",
                FAKE_SERVER,
                &fs_capture,
                r#"{"name":"read"},{"name":"write"}"#,
            ),
            fake_upstream("exec", FAKE_SERVER, &exec_capture, r#"{"name":"run"}"#),
        ],
        vec![permit_tool_calls()],
        Duration::from_secs(5),
    )
    .await;

    let response = gw
        .router
        .handle(
            JsonRpcRequest::new("tools/list", json!({}), 7),
            &headers("lister"),
        )
        .await;

    let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
    let mut names: Vec<String> = tools
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["exec__run", "fs__read", "fs__write"]);

    gw.router.stop().await;
}

#[tokio::test]
async fn tools_call_reaches_only_the_owning_upstream_with_stripped_name() {
    let dir = TempDir::new().unwrap();
    let fs_capture = dir.path().join("fs.log");
    let exec_capture = dir.path().join("exec.log");

    let gw = gateway(
        vec![
            fake_upstream("fs", FAKE_SERVER, &fs_capture, r#"{"name":"read"}"#),
            fake_upstream("exec", FAKE_SERVER, &exec_capture, r#"{"name":"run"}"#),
        ],
        vec![permit_tool_calls()],
        Duration::from_secs(5),
    )
    .await;

    let response = gw
        .router
        .handle(
            JsonRpcRequest::new(
                "tools/call",
                json!({ "name": "fs__read", "arguments": { "path": "/tmp/x" } }),
                42,
            ),
            &headers("caller"),
        )
        .await;

    assert!(response.error.is_none(), "call should succeed: {:?}", response.error);
    assert_eq!(response.result.unwrap()["servedBy"], "fs");
    assert_eq!(response.id, Some(42.into()));

    // The fs server saw the stripped tool name; exec saw no tools/call at all.
    let fs_log = std::fs::read_to_string(&fs_capture).unwrap();
    assert!(fs_log.contains(r#""name":"read""#));
    assert!(!fs_log.contains("fs__read"));
    let exec_log = std::fs::read_to_string(&exec_capture).unwrap_or_default();
    assert!(!exec_log.contains("tools/call"));

    // The PERMIT decision was recorded in the audit trail within the span.
    let entries = gw.audit.recent(10);
    assert!(entries.iter().any(|e| {
        e.decision.verdict == Verdict::Permit
            && e.context.action == "tool:call"
            && e.context.resource == "fs__read"
    }));

    gw.router.stop().await;
}

#[tokio::test]
async fn policy_denial_blocks_forwarding_with_32001() {
    let dir = TempDir::new().unwrap();
    let exec_capture = dir.path().join("exec.log");

    let prohibition = policy_record(
        "no-exec",
        vec![],
        vec![Rule {
            action: "tool:call".to_string(),
            target: Some("exec__*".to_string()),
            ..Default::default()
        }],
        10,
    );

    let gw = gateway(
        vec![fake_upstream(
            "exec",
            FAKE_SERVER,
            &exec_capture,
            r#"{"name":"run"}"#,
        )],
        vec![permit_tool_calls(), prohibition],
        Duration::from_secs(5),
    )
    .await;

    let response = gw
        .router
        .handle(
            JsonRpcRequest::new(
                "tools/call",
                json!({ "name": "exec__run", "arguments": {} }),
                9,
            ),
            &headers("caller"),
        )
        .await;

    let error = response.error.expect("denied call must error");
    assert_eq!(error.code, -32001);
    assert!(error.message.starts_with("Policy denied: "));

    // No unauthorized upstream traffic
    let exec_log = std::fs::read_to_string(&exec_capture).unwrap_or_default();
    assert!(!exec_log.contains("tools/call"));

    // The denial is in the audit trail
    assert!(gw
        .audit
        .recent(10)
        .iter()
        .any(|e| e.decision.verdict == Verdict::Deny && e.context.resource == "exec__run"));

    gw.router.stop().await;
}

#[tokio::test]
async fn unknown_prefix_is_unavailable_not_policy_denied() {
    let gw = gateway(vec![], vec![permit_tool_calls()], Duration::from_secs(1)).await;

    let response = gw
        .router
        .handle(
            JsonRpcRequest::new("tools/call", json!({ "name": "ghost__run" }), 1),
            &headers("caller"),
        )
        .await;

    let error = response.error.unwrap();
    assert_eq!(error.code, -32603);
    assert!(error.message.contains("ghost"));
}

#[tokio::test]
async fn forwarded_call_times_out_with_32603() {
    let dir = TempDir::new().unwrap();
    let capture = dir.path().join("stall.log");

    let gw = gateway(
        vec![fake_upstream("slow", STALLING_SERVER, &capture, "")],
        vec![permit_tool_calls()],
        Duration::from_millis(300),
    )
    .await;

    let response = gw
        .router
        .handle(
            JsonRpcRequest::new("tools/call", json!({ "name": "slow__run", "arguments": {} }), 2),
            &headers("caller"),
        )
        .await;

    let error = response.error.unwrap();
    assert_eq!(error.code, -32603);
    assert_eq!(error.message, "Request timeout for tools/call");

    gw.router.stop().await;
}

#[tokio::test]
async fn initialize_reports_proxy_capabilities() {
    let gw = gateway(vec![], vec![], Duration::from_secs(1)).await;
    let response = gw
        .router
        .handle(JsonRpcRequest::new("initialize", json!({}), 1), &headers("x"))
        .await;

    let result = response.result.unwrap();
    assert_eq!(result["serverInfo"]["name"], "aegis-gateway");
    assert!(result["capabilities"]["tools"].is_object());
}
