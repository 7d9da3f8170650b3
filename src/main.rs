use aegis_gateway::{
    agent::{AgentCard, AgentRpc, EchoProcessor, TaskManager},
    api::{build_router, AppState},
    audit::AuditRecorder,
    config::Config,
    enforcement::constraints::{ConstraintPipeline, GeoConfig, RateLimitConfig, TokenStore},
    enforcement::obligations::{
        AuditObligation, DeletionScheduler, NotifierConfig, NotifyObligation, ObligationPipeline,
        ReportObligation,
    },
    mcp::{load_upstreams, McpRouter},
    pdp::{DecisionCache, HybridPdp, JudgmentEngine, LlmConfig, PdpConfig},
    policy::PolicyStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit codes: 0 clean, 1 config/startup failure, 2 unrecoverable runtime
/// failure.
#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    // Load configuration before tracing so LOG_LEVEL applies
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return 1;
        }
    };

    init_tracing(&config);
    tracing::info!("Starting Aegis Gateway v{}", env!("CARGO_PKG_VERSION"));

    // Policy store
    let policy_store = match PolicyStore::open(&config.storage.policy_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "Policy store initialization failed");
            return 1;
        }
    };
    tracing::info!(
        active_policies = policy_store.list_active().len(),
        path = %config.storage.policy_path.display(),
        "✅ Policy store loaded"
    );

    // Decision cache, invalidated on every policy change
    let cache = Arc::new(DecisionCache::new(
        config.cache.enabled,
        config.cache.ttl_secs,
        config.cache.max_size,
    ));
    {
        let cache = cache.clone();
        policy_store.on_change(move || cache.invalidate_all());
    }

    // LLM judgment engine
    let llm = if config.llm.enabled {
        let api_key = std::env::var(&config.llm.api_key_env).ok();
        if api_key.is_none() && config.llm.base_url.is_none() {
            tracing::warn!(
                "⚠️  LLM engine enabled but {} is unset; natural-language policies will fail safe",
                config.llm.api_key_env
            );
        }
        Some(Arc::new(JudgmentEngine::new(LlmConfig {
            provider: config.llm.provider.clone(),
            api_key,
            model: config.llm.model.clone(),
            base_url: config.llm.base_url.clone(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
            timeout_secs: config.llm.timeout_secs,
        })))
    } else {
        None
    };

    let pdp = Arc::new(HybridPdp::new(
        llm,
        cache.clone(),
        PdpConfig {
            confidence_threshold: config.pdp.confidence_threshold,
            auto_detect_format: config.pdp.auto_detect_format,
            max_delegation_depth: config.pdp.max_delegation_depth,
        },
    ));
    tracing::info!("✅ Hybrid PDP initialized");

    // Audit recorder
    let audit = match &config.storage.audit_log_path {
        Some(path) => match AuditRecorder::with_sink(path) {
            Ok(recorder) => Arc::new(recorder),
            Err(e) => {
                tracing::error!(error = %e, "Audit sink initialization failed");
                return 1;
            }
        },
        None => Arc::new(AuditRecorder::in_memory()),
    };
    tracing::info!("✅ Audit recorder initialized");

    // Constraint pipeline
    let token_store = Arc::new(TokenStore::new());
    let constraints = Arc::new(ConstraintPipeline::with_defaults(
        token_store.clone(),
        RateLimitConfig {
            default_limit: config.rate_limit.default_limit,
            default_window_ms: config.rate_limit.default_window_ms,
        },
        GeoConfig::default(),
    ));
    tracing::info!("✅ Constraint pipeline initialized");

    // Obligation pipeline
    let mut obligations =
        ObligationPipeline::new(config.notifications.escalation_webhook.clone());
    obligations.register(Arc::new(AuditObligation::new(audit.clone())));
    obligations.register(Arc::new(NotifyObligation::new(NotifierConfig {
        smtp_server: config.notifications.smtp_server.clone(),
        smtp_port: config.notifications.smtp_port,
        smtp_username: config
            .notifications
            .smtp_username_env
            .as_ref()
            .and_then(|env| std::env::var(env).ok()),
        smtp_password: config
            .notifications
            .smtp_password_env
            .as_ref()
            .and_then(|env| std::env::var(env).ok()),
        email_from: config.notifications.email_from.clone(),
        chat_webhook_url: config.notifications.chat_webhook_url.clone(),
        webhook_timeout_secs: config.notifications.webhook_timeout_secs,
    })));
    match DeletionScheduler::new(None).await {
        Ok(scheduler) => obligations.register(Arc::new(scheduler)),
        Err(e) => {
            tracing::warn!(error = %e, "⚠️  Deletion scheduler unavailable, scheduleDeletion obligations will be skipped");
        }
    }
    obligations.register(Arc::new(ReportObligation::new(&config.storage.reports_dir)));
    let obligations = Arc::new(obligations);
    tracing::info!("✅ Obligation pipeline initialized");

    // Upstream tool servers
    let upstream_configs = match &config.mcp.config_path {
        Some(path) => match load_upstreams(path) {
            Ok(configs) => configs,
            Err(e) => {
                tracing::error!(error = %e, "Upstream configuration failed");
                return 1;
            }
        },
        None => {
            tracing::info!("⚠️  AEGIS_MCP_CONFIG not set, running without upstreams");
            Vec::new()
        }
    };

    let router = Arc::new(McpRouter::new(
        upstream_configs,
        pdp.clone(),
        policy_store.clone(),
        constraints.clone(),
        obligations.clone(),
        audit.clone(),
        Duration::from_secs(config.mcp.request_timeout_secs),
    ));
    router.start().await;
    tracing::info!("✅ MCP router started");

    // Agent RPC core
    let tasks = Arc::new(TaskManager::new(
        config.agent.name.clone(),
        Arc::new(EchoProcessor),
        config.agent.max_concurrent_tasks,
    ));
    let agent_rpc = Arc::new(AgentRpc::new(
        tasks,
        AgentCard::new(
            config.agent.name.clone(),
            config.agent.url.clone(),
            config.agent.max_concurrent_tasks,
        ),
    ));
    tracing::info!(agent = %config.agent.name, "✅ Agent RPC core initialized");

    // HTTP server
    let state = AppState::new(
        router.clone(),
        agent_rpc,
        audit.clone(),
        config.auth.clone(),
    );
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Bind failed");
            return 1;
        }
    };

    tracing::info!("🚀 Aegis Gateway listening on http://{}", addr);
    tracing::info!("   Agent RPC: http://{}/rpc", addr);
    tracing::info!("   MCP proxy: http://{}/mcp/messages", addr);
    tracing::info!("   Task SSE:  http://{}/tasks/subscribe", addr);
    tracing::info!("   Health:    http://{}/health", addr);

    let server = tokio::spawn(async move {
        axum::serve(listener, app).await
    });

    let exit_code;
    tokio::select! {
        result = server => {
            match result {
                Ok(Ok(())) => {
                    tracing::warn!("HTTP server stopped");
                    exit_code = 0;
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "HTTP server failed");
                    exit_code = 2;
                }
                Err(e) => {
                    tracing::error!(error = %e, "HTTP server task failed");
                    exit_code = 2;
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            exit_code = 0;
        }
    }

    tracing::info!("Shutting down gracefully...");
    router.stop().await;
    token_store.clear();
    tracing::info!("Shutdown complete");
    exit_code
}

fn init_tracing(config: &aegis_gateway::config::Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("aegis_gateway={},tower_http=info", config.observability.log_level).into()
    });

    if config.observability.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
