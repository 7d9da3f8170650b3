use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// LLM judgment engine configuration
    #[serde(default)]
    pub llm: LlmSection,

    /// Decision cache configuration
    #[serde(default)]
    pub cache: CacheSection,

    /// PDP tuning
    #[serde(default)]
    pub pdp: PdpSection,

    /// Persistence paths
    #[serde(default)]
    pub storage: StorageSection,

    /// MCP upstream configuration
    #[serde(default)]
    pub mcp: McpSection,

    /// API authentication
    #[serde(default)]
    pub auth: AuthSection,

    /// Agent identity and delegation
    #[serde(default)]
    pub agent: AgentSection,

    /// Notification and escalation channels
    #[serde(default)]
    pub notifications: NotificationSection,

    /// Rate-limit fallbacks
    #[serde(default)]
    pub rate_limit: RateLimitSection,
}

impl Config {
    /// Load configuration: built-in defaults, an optional file named by
    /// CONFIG_PATH, the AEGIS__-prefixed environment tree, and finally the
    /// flat well-known environment variables (PORT, LLM_MODEL, ...).
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/default.toml".to_string());

        let mut config: Config = config::Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(
                config::Environment::with_prefix("AEGIS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.apply_flat_env();
        Ok(config)
    }

    /// The flat environment variables enumerated by the deployment surface.
    /// They override both file and prefixed-env settings.
    fn apply_flat_env(&mut self) {
        let var = |name: &str| std::env::var(name).ok();

        if let Some(port) = var("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(provider) = var("LLM_PROVIDER") {
            self.llm.provider = provider;
        }
        if let Some(model) = var("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(timeout) = var("LLM_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.llm.timeout_secs = timeout;
        }
        if let Some(enabled) = var("CACHE_ENABLED").and_then(|v| v.parse().ok()) {
            self.cache.enabled = enabled;
        }
        if let Some(ttl) = var("CACHE_TTL").and_then(|v| v.parse().ok()) {
            self.cache.ttl_secs = ttl;
        }
        if let Some(size) = var("CACHE_MAX_SIZE").and_then(|v| v.parse().ok()) {
            self.cache.max_size = size;
        }
        if let Some(max) = var("MAX_CONCURRENT_REQUESTS").and_then(|v| v.parse().ok()) {
            self.server.max_concurrent_requests = max;
        }
        if let Some(timeout) = var("REQUEST_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.server.request_timeout_secs = timeout;
        }
        if let Some(enabled) = var("API_AUTH_ENABLED").and_then(|v| v.parse().ok()) {
            self.auth.enabled = enabled;
        }
        if let Some(token) = var("API_AUTH_TOKEN") {
            self.auth.token = Some(token);
        }
        if let Some(path) = var("AEGIS_MCP_CONFIG") {
            self.mcp.config_path = Some(PathBuf::from(path));
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Max concurrent in-flight requests
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON-formatted logs
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    /// Provider label: `anthropic` or an OpenAI-compatible gateway
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,

    /// Base URL override
    pub base_url: Option<String>,

    #[serde(default)]
    pub temperature: f64,

    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Disable to run the PDP purely declaratively
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key_env: default_llm_api_key_env(),
            base_url: None,
            temperature: 0.0,
            max_tokens: default_llm_max_tokens(),
            timeout_secs: default_llm_timeout(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl(),
            max_size: default_cache_max_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdpSection {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    #[serde(default = "default_true")]
    pub auto_detect_format: bool,

    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: usize,
}

impl Default for PdpSection {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            auto_detect_format: true,
            max_delegation_depth: default_max_delegation_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Policy document path
    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,

    /// Audit JSON-lines sink; unset keeps audit in memory only
    pub audit_log_path: Option<PathBuf>,

    /// Directory for report obligation artifacts
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            policy_path: default_policy_path(),
            audit_log_path: None,
            reports_dir: default_reports_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpSection {
    /// Upstream-servers file (AEGIS_MCP_CONFIG)
    pub config_path: Option<PathBuf>,

    /// Per-forwarded-request timeout (seconds)
    #[serde(default = "default_mcp_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthSection {
    #[serde(default)]
    pub enabled: bool,

    /// Bearer token; health endpoints stay open
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_name")]
    pub name: String,

    /// Externally reachable base URL, advertised on the agent card
    #[serde(default = "default_agent_url")]
    pub url: String,

    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Delegation targets known at startup; name -> base URL
    #[serde(default)]
    pub known_targets: HashMap<String, String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            url: default_agent_url(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            known_targets: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationSection {
    pub smtp_server: Option<String>,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    /// SMTP credentials come from the named environment variables
    pub smtp_username_env: Option<String>,
    pub smtp_password_env: Option<String>,

    pub email_from: Option<String>,

    /// Webhook used for chat notifications
    pub chat_webhook_url: Option<String>,

    /// Obligation escalation chain endpoint
    pub escalation_webhook: Option<String>,

    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_rate_limit")]
    pub default_limit: u64,

    #[serde(default = "default_rate_window_ms")]
    pub default_window_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            default_limit: default_rate_limit(),
            default_window_ms: default_rate_window_ms(),
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_concurrent_requests() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_llm_provider() -> String {
    "anthropic".to_string()
}

fn default_llm_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}

fn default_llm_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}

fn default_llm_max_tokens() -> u32 {
    1024
}

fn default_llm_timeout() -> u64 {
    15
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_max_size() -> usize {
    1000
}

fn default_confidence_threshold() -> f64 {
    0.8
}

fn default_max_delegation_depth() -> usize {
    3
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("./data/policies.json")
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("./data/reports")
}

fn default_mcp_timeout() -> u64 {
    30
}

fn default_agent_name() -> String {
    "aegis-agent".to_string()
}

fn default_agent_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_max_concurrent_tasks() -> usize {
    16
}

fn default_smtp_port() -> u16 {
    587
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_rate_limit() -> u64 {
    100
}

fn default_rate_window_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}
