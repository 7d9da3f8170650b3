//! Upstream tool-server connections.
//!
//! A stdio upstream is a supervised child process speaking line-framed
//! JSON-RPC on stdin/stdout; an HTTP upstream is a JSON-RPC peer behind a
//! URL. Both are initialized with an `initialize` handshake before use.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, watch, Mutex, RwLock};

use crate::error::{AppError, Result};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};

/// Handshake budget for a freshly spawned upstream
pub const UPSTREAM_INIT_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period between stdin close and kill on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Upstream transport kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
}

/// One upstream server definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub transport: Option<Transport>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl UpstreamConfig {
    /// Explicit transport wins; otherwise a URL means HTTP, a command stdio
    pub fn transport(&self) -> Transport {
        match self.transport {
            Some(t) => t,
            None if self.url.is_some() => Transport::Http,
            None => Transport::Stdio,
        }
    }
}

/// The upstream-servers document named by AEGIS_MCP_CONFIG
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpstreamsFile {
    #[serde(alias = "mcpServers", alias = "upstreams")]
    pub servers: HashMap<String, UpstreamConfig>,
}

/// Load upstream definitions, stamping each with its map key as name
pub fn load_upstreams(path: &Path) -> Result<Vec<UpstreamConfig>> {
    let raw = std::fs::read_to_string(path)?;
    let file: UpstreamsFile = serde_json::from_str(&raw).map_err(|e| {
        AppError::Configuration(format!("upstreams file {} is not valid: {}", path.display(), e))
    })?;
    let mut configs: Vec<UpstreamConfig> = file
        .servers
        .into_iter()
        .map(|(name, mut config)| {
            config.name = name;
            config
        })
        .collect();
    configs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(configs)
}

/// A live stdio child connection
#[derive(Debug)]
pub struct StdioConnection {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Arc<DashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    next_id: AtomicU64,
    closed_rx: watch::Receiver<bool>,
    capabilities: Value,
}

impl StdioConnection {
    /// Spawn the child with piped stdio, start the reader and stderr drains,
    /// and perform the `initialize` handshake.
    pub async fn spawn(config: &UpstreamConfig) -> Result<Self> {
        let command = config.command.as_deref().ok_or_else(|| {
            AppError::Configuration(format!("stdio upstream '{}' has no command", config.name))
        })?;

        let mut child = Command::new(command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::UpstreamUnavailable(format!(
                    "failed to spawn upstream '{}': {}",
                    config.name, e
                ))
            })?;

        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let pending: Arc<DashMap<u64, oneshot::Sender<JsonRpcResponse>>> = Arc::new(DashMap::new());
        let (closed_tx, closed_rx) = watch::channel(false);

        // Reader: one JSON-RPC object per line, matched to pending by id.
        let reader_pending = pending.clone();
        let upstream_name = config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(&line) {
                    Ok(response) => {
                        match response.id.as_ref().and_then(|v| v.as_u64()) {
                            Some(id) => {
                                if let Some((_, tx)) = reader_pending.remove(&id) {
                                    let _ = tx.send(response);
                                } else {
                                    tracing::debug!(upstream = %upstream_name, id, "Unmatched response dropped");
                                }
                            }
                            None => {
                                tracing::debug!(upstream = %upstream_name, "Upstream notification ignored")
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(upstream = %upstream_name, error = %e, line = %line, "Unparseable upstream line")
                    }
                }
            }

            // EOF: the child is gone. Fail everything still pending.
            let _ = closed_tx.send(true);
            let keys: Vec<u64> = reader_pending.iter().map(|entry| *entry.key()).collect();
            for key in keys {
                if let Some((_, tx)) = reader_pending.remove(&key) {
                    let _ = tx.send(JsonRpcResponse::error(
                        Some(key.into()),
                        crate::error::JSONRPC_INTERNAL_ERROR,
                        "shutting down",
                        None,
                    ));
                }
            }
        });

        let stderr_name = config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(upstream = %stderr_name, "stderr: {}", line);
            }
        });

        let mut connection = Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            closed_rx,
            capabilities: Value::Null,
        };

        let init_result = connection
            .request(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {
                        "name": "aegis-gateway",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
                UPSTREAM_INIT_TIMEOUT,
            )
            .await
            .map_err(|e| {
                AppError::UpstreamUnavailable(format!(
                    "upstream '{}' failed to initialize: {}",
                    config.name, e
                ))
            })?;
        connection.capabilities = init_result
            .get("capabilities")
            .cloned()
            .unwrap_or(Value::Null);
        Ok(connection)
    }

    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    /// Send a request and await its response. The caller's JSON-RPC id is
    /// never forwarded; ids are remapped to an internal counter so parallel
    /// callers cannot collide.
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let request = JsonRpcRequest::new(method, params, id);
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(line.as_bytes()).await.map_err(|e| {
                self.pending.remove(&id);
                AppError::UpstreamUnavailable(format!("upstream write failed: {}", e))
            })?;
            stdin.flush().await?;
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(AppError::UpstreamUnavailable("upstream closed".to_string()))
            }
            Err(_) => {
                self.pending.remove(&id);
                return Err(AppError::UpstreamTimeout {
                    method: method.to_string(),
                });
            }
        };

        match response.error {
            Some(error) => Err(AppError::Internal(format!(
                "upstream error {}: {}",
                error.code, error.message
            ))),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    /// Resolves when the child's stdout reaches EOF
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Graceful stop: close stdin so a well-behaved server exits, then kill
    /// after the grace period. Pending requests are failed by the reader.
    pub async fn shutdown(&self) {
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

/// A JSON-RPC peer behind a URL
pub struct HttpConnection {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
    capabilities: Value,
}

impl HttpConnection {
    pub async fn connect(config: &UpstreamConfig) -> Result<Self> {
        let url = config.url.clone().ok_or_else(|| {
            AppError::Configuration(format!("http upstream '{}' has no url", config.name))
        })?;
        let mut connection = Self {
            url,
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            capabilities: Value::Null,
        };
        let init = connection
            .request(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {
                        "name": "aegis-gateway",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
                UPSTREAM_INIT_TIMEOUT,
            )
            .await
            .map_err(|e| {
                AppError::UpstreamUnavailable(format!(
                    "upstream '{}' failed to initialize: {}",
                    config.name, e
                ))
            })?;
        connection.capabilities = init.get("capabilities").cloned().unwrap_or(Value::Null);
        Ok(connection)
    }

    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(method, params, id);

        let send = self.http.post(&self.url).json(&request).send();
        let response = match tokio::time::timeout(timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(AppError::UpstreamUnavailable(format!(
                    "upstream unreachable: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(AppError::UpstreamTimeout {
                    method: method.to_string(),
                })
            }
        };

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("malformed upstream response: {}", e)))?;
        match body.error {
            Some(error) => Err(AppError::Internal(format!(
                "upstream error {}: {}",
                error.code, error.message
            ))),
            None => Ok(body.result.unwrap_or(Value::Null)),
        }
    }
}

/// Either transport behind one handle
pub enum Connection {
    Stdio(StdioConnection),
    Http(HttpConnection),
}

impl Connection {
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        match self {
            Connection::Stdio(c) => c.request(method, params, timeout).await,
            Connection::Http(c) => c.request(method, params, timeout).await,
        }
    }

    pub fn capabilities(&self) -> &Value {
        match self {
            Connection::Stdio(c) => c.capabilities(),
            Connection::Http(c) => c.capabilities(),
        }
    }
}

/// A named upstream slot whose connection is replaced across restarts
pub struct UpstreamHandle {
    pub config: UpstreamConfig,
    connection: RwLock<Option<Arc<Connection>>>,
    connected: AtomicBool,
}

impl UpstreamHandle {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Establish (or re-establish) the connection and record status
    pub async fn connect(&self) -> Result<()> {
        let connection = match self.config.transport() {
            Transport::Stdio => Connection::Stdio(StdioConnection::spawn(&self.config).await?),
            Transport::Http => Connection::Http(HttpConnection::connect(&self.config).await?),
        };
        *self.connection.write().await = Some(Arc::new(connection));
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(upstream = %self.config.name, "Upstream connected");
        Ok(())
    }

    pub async fn capabilities(&self) -> Option<Value> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|c| c.capabilities().clone())
    }

    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let connection = {
            let guard = self.connection.read().await;
            guard.clone()
        };
        match connection {
            Some(connection) => connection.request(method, params, timeout).await,
            None => Err(AppError::UpstreamUnavailable(format!(
                "upstream '{}' is not connected",
                self.config.name
            ))),
        }
    }

    /// For the supervisor: resolve when the live stdio child dies.
    /// HTTP upstreams never resolve here.
    pub async fn wait_closed(&self) {
        let connection = {
            let guard = self.connection.read().await;
            guard.clone()
        };
        match connection {
            Some(connection) => match connection.as_ref() {
                Connection::Stdio(stdio) => stdio.wait_closed().await,
                Connection::Http(_) => std::future::pending().await,
            },
            None => {}
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    pub async fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.connection.write().await = None;
    }

    pub async fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let connection = self.connection.write().await.take();
        if let Some(connection) = connection {
            if let Connection::Stdio(stdio) = connection.as_ref() {
                stdio.shutdown().await;
            }
        }
        tracing::info!(upstream = %self.config.name, "Upstream stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_config(name: &str, script: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            transport: None,
            command: Some("/bin/sh".to_string()),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            url: None,
        }
    }

    // Replies to the initialize request (internal id 1), then swallows input.
    const INIT_ONLY_SERVER: &str = r#"read -r line; echo '{"jsonrpc":"2.0","result":{"capabilities":{"tools":{}}},"id":1}'; while read -r line; do :; done"#;

    #[test]
    fn test_transport_inference() {
        let stdio = stdio_config("a", "true");
        assert_eq!(stdio.transport(), Transport::Stdio);

        let http = UpstreamConfig {
            name: "b".to_string(),
            transport: None,
            command: None,
            args: vec![],
            env: HashMap::new(),
            url: Some("http://localhost:9999".to_string()),
        };
        assert_eq!(http.transport(), Transport::Http);
    }

    #[test]
    fn test_load_upstreams_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("upstreams.json");
        std::fs::write(
            &path,
            r#"{
                "mcpServers": {
                    "fs": { "command": "fs-server", "args": ["--root", "/data"] },
                    "search": { "url": "http://localhost:8200/rpc" }
                }
            }"#,
        )
        .unwrap();

        let configs = load_upstreams(&path).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].name, "fs");
        assert_eq!(configs[0].transport(), Transport::Stdio);
        assert_eq!(configs[1].name, "search");
        assert_eq!(configs[1].transport(), Transport::Http);
    }

    #[tokio::test]
    async fn test_stdio_spawn_and_initialize() {
        let connection = StdioConnection::spawn(&stdio_config("echoer", INIT_ONLY_SERVER))
            .await
            .expect("spawn and handshake");
        assert_eq!(connection.capabilities()["tools"], serde_json::json!({}));
        assert!(!connection.is_closed());
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_stdio_request_timeout() {
        let connection = StdioConnection::spawn(&stdio_config("sluggish", INIT_ONLY_SERVER))
            .await
            .unwrap();

        let err = connection
            .request("tools/list", json!({}), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UpstreamTimeout { ref method } if method == "tools/list"));
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_stdio_crash_is_observed() {
        // Server answers initialize then exits immediately.
        let script = r#"read -r line; echo '{"jsonrpc":"2.0","result":{"capabilities":{}},"id":1}'"#;
        let connection = StdioConnection::spawn(&stdio_config("brief", script))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), connection.wait_closed())
            .await
            .expect("closure observed");
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_unavailable() {
        let config = UpstreamConfig {
            name: "ghost".to_string(),
            transport: None,
            command: Some("/no/such/binary".to_string()),
            args: vec![],
            env: HashMap::new(),
            url: None,
        };
        let err = StdioConnection::spawn(&config).await.unwrap_err();
        assert!(matches!(err, AppError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn test_http_upstream_round_trip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "result": { "capabilities": { "tools": {} } },
                    "id": 1
                })
                .to_string(),
            )
            .create_async()
            .await;

        let config = UpstreamConfig {
            name: "web".to_string(),
            transport: Some(Transport::Http),
            command: None,
            args: vec![],
            env: HashMap::new(),
            url: Some(server.url()),
        };
        let connection = HttpConnection::connect(&config).await.unwrap();
        assert_eq!(connection.capabilities()["tools"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_handle_request_without_connection() {
        let handle = UpstreamHandle::new(stdio_config("idle", "true"));
        let err = handle
            .request("tools/list", json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UpstreamUnavailable(_)));
    }
}
