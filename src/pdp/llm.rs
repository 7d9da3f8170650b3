//! Natural-language judgment engine.
//!
//! Turns (context, policy text) into a structured decision by consulting an
//! external language model. The adapter is strictly fail-safe: network
//! errors, timeouts, and schema deviations all collapse to a DENY with
//! confidence 1.0. It never caches; that is the PDP's job.

use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::models::{Decision, DecisionContext, Verdict};

/// Default wall-clock budget for one judgment call
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 15;

/// Concurrency cap for batched judgments
const BATCH_CONCURRENCY: usize = 4;

/// Configuration for the judgment engine
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Provider label: `anthropic` (default) or an OpenAI-compatible endpoint
    pub provider: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Base URL override, used by tests and self-hosted gateways
    pub base_url: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            api_key: None,
            model: "claude-3-5-sonnet-20241022".to_string(),
            base_url: None,
            temperature: 0.0,
            max_tokens: 1024,
            timeout_secs: DEFAULT_LLM_TIMEOUT_SECS,
        }
    }
}

/// The strict response schema expected from the model.
///
/// Any deviation from this shape is treated as a timeout-equivalent failure.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LlmVerdict {
    verdict: Verdict,
    reason: String,
    confidence: f64,
    #[serde(default)]
    constraints: Vec<String>,
    #[serde(default)]
    obligations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f64,
    system: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: String,
}

/// Judgment engine backed by an external language model
pub struct JudgmentEngine {
    config: LlmConfig,
    http: Client,
}

impl JudgmentEngine {
    const ANTHROPIC_BASE_URL: &'static str = "https://api.anthropic.com";
    const ANTHROPIC_VERSION: &'static str = "2023-06-01";

    pub fn new(config: LlmConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    /// Judge a single request against a policy text. Infallible by design.
    pub async fn judge(&self, context: &DecisionContext, policy_text: &str) -> Decision {
        let started = std::time::Instant::now();

        let decision = match self.call_model(context, policy_text).await {
            Ok(verdict) => {
                let mut decision =
                    Decision::new(verdict.verdict, verdict.reason, verdict.confidence.clamp(0.0, 1.0))
                        .with_constraints(verdict.constraints)
                        .with_obligations(verdict.obligations);
                decision.metadata.engine = "llm".to_string();
                decision
            }
            Err(cause) => {
                tracing::warn!(
                    agent_id = %context.agent_id,
                    action = %context.action,
                    cause = %cause,
                    "LLM judgment failed, denying fail-safe"
                );
                Decision::deny("LLM unavailable").with_engine("llm")
            }
        };

        let mut decision = decision;
        decision.metadata.evaluation_ms = started.elapsed().as_millis() as u64;
        decision
    }

    /// Judge several co-located contexts against the same policy text.
    /// Results keep the input order.
    pub async fn batch(&self, contexts: &[DecisionContext], policy_text: &str) -> Vec<Decision> {
        stream::iter(contexts)
            .map(|context| self.judge(context, policy_text))
            .buffered(BATCH_CONCURRENCY)
            .collect()
            .await
    }

    async fn call_model(
        &self,
        context: &DecisionContext,
        policy_text: &str,
    ) -> std::result::Result<LlmVerdict, String> {
        let prompt = build_prompt(context, policy_text)?;
        let text = if self.config.provider == "anthropic" {
            self.call_anthropic(&prompt).await?
        } else {
            self.call_openai_compatible(&prompt).await?
        };
        parse_verdict(&text)
    }

    async fn call_anthropic(&self, prompt: &str) -> std::result::Result<String, String> {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(Self::ANTHROPIC_BASE_URL);
        let request = AnthropicRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt.to_string(),
            }],
        };

        let response = self
            .http
            .post(format!("{}/v1/messages", base))
            .header("x-api-key", self.config.api_key.as_deref().unwrap_or(""))
            .header("anthropic-version", Self::ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("provider returned {}", response.status()));
        }

        let body: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| format!("malformed provider response: {}", e))?;
        body.content
            .into_iter()
            .find_map(|c| c.text)
            .ok_or_else(|| "empty provider response".to_string())
    }

    async fn call_openai_compatible(&self, prompt: &str) -> std::result::Result<String, String> {
        let base = self
            .config
            .base_url
            .as_deref()
            .ok_or_else(|| "no base URL configured for OpenAI-compatible provider".to_string())?;

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", base))
            .bearer_auth(self.config.api_key.as_deref().unwrap_or(""))
            .json(&json!({
                "model": self.config.model,
                "temperature": self.config.temperature,
                "max_tokens": self.config.max_tokens,
                "messages": [
                    { "role": "system", "content": SYSTEM_PROMPT },
                    { "role": "user", "content": prompt },
                ],
            }))
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("provider returned {}", response.status()));
        }

        let body: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| format!("malformed provider response: {}", e))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| "empty provider response".to_string())
    }
}

const SYSTEM_PROMPT: &str = "You are a policy decision engine. Evaluate the request \
against the policy and answer with a single JSON object of the exact shape \
{\"verdict\": \"PERMIT\"|\"DENY\"|\"INDETERMINATE\"|\"NOT_APPLICABLE\", \
\"reason\": string, \"confidence\": number, \"constraints\": [string], \
\"obligations\": [string]}. No prose, no markdown fences.";

fn build_prompt(
    context: &DecisionContext,
    policy_text: &str,
) -> std::result::Result<String, String> {
    let context_json = serde_json::to_string_pretty(context)
        .map_err(|e| format!("context serialization failed: {}", e))?;
    Ok(format!(
        "POLICY:\n{}\n\nREQUEST CONTEXT:\n{}\n\nDecide whether the request is permitted.",
        policy_text, context_json
    ))
}

/// Parse and validate the model's answer against the strict schema.
fn parse_verdict(text: &str) -> std::result::Result<LlmVerdict, String> {
    // Models occasionally wrap the object in fences despite instructions;
    // accept the first top-level JSON object and nothing looser.
    let start = text.find('{').ok_or_else(|| "no JSON object in response".to_string())?;
    let end = text.rfind('}').ok_or_else(|| "no JSON object in response".to_string())?;
    if end < start {
        return Err("no JSON object in response".to_string());
    }

    let verdict: LlmVerdict = serde_json::from_str(&text[start..=end])
        .map_err(|e| format!("schema violation: {}", e))?;
    if !(0.0..=1.0).contains(&verdict.confidence) {
        return Err(format!("confidence out of range: {}", verdict.confidence));
    }
    Ok(verdict)
}
