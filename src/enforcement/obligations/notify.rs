//! Notification obligation: email, webhook, and chat channels.
//!
//! Messages are templated from the decision context and tagged with the
//! request priority.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use std::time::Duration;

use crate::enforcement::Directive;
use crate::models::{Decision, DecisionContext};

use super::{ObligationExecutor, ObligationResult};

/// Notification channel configuration
#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    pub smtp_server: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub email_from: Option<String>,
    /// Webhook used for `notify:chat:<channel>` directives
    pub chat_webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
}

/// Multi-channel notification executor
pub struct NotifyObligation {
    config: NotifierConfig,
    http: reqwest::Client,
}

impl NotifyObligation {
    pub fn new(config: NotifierConfig) -> Self {
        let timeout = Duration::from_secs(config.webhook_timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    fn render_subject(&self, context: &DecisionContext, decision: &Decision) -> String {
        format!(
            "[{}] policy {} for {} on {}",
            priority_tag(context),
            decision.verdict,
            context.agent_id,
            context.action
        )
    }

    fn render_body(&self, context: &DecisionContext, decision: &Decision) -> String {
        format!(
            "Agent: {}\nAction: {}\nResource: {}\nVerdict: {}\nReason: {}\nConfidence: {:.2}\nAt: {}",
            context.agent_id,
            context.action,
            context.resource,
            decision.verdict,
            decision.reason,
            decision.confidence,
            decision.decided_at.to_rfc3339(),
        )
    }

    async fn send_email(
        &self,
        to: &str,
        context: &DecisionContext,
        decision: &Decision,
    ) -> ObligationResult {
        let server = self
            .config
            .smtp_server
            .as_deref()
            .ok_or_else(|| "SMTP server not configured".to_string())?;
        let from = self
            .config
            .email_from
            .as_deref()
            .ok_or_else(|| "email sender not configured".to_string())?;

        let message = Message::builder()
            .from(from.parse().map_err(|e| format!("bad from address: {}", e))?)
            .to(to.parse().map_err(|e| format!("bad to address: {}", e))?)
            .subject(self.render_subject(context, decision))
            .header(ContentType::TEXT_PLAIN)
            .body(self.render_body(context, decision))
            .map_err(|e| format!("message build failed: {}", e))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(server)
            .map_err(|e| format!("SMTP relay setup failed: {}", e))?
            .port(self.config.smtp_port);
        if let (Some(user), Some(pass)) = (
            self.config.smtp_username.clone(),
            self.config.smtp_password.clone(),
        ) {
            builder = builder.credentials(Credentials::new(user, pass));
        }
        let transport = builder.build();

        transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| format!("SMTP send failed: {}", e))
    }

    async fn send_webhook(
        &self,
        url: &str,
        context: &DecisionContext,
        decision: &Decision,
    ) -> ObligationResult {
        let body = json!({
            "priority": priority_tag(context),
            "agentId": context.agent_id,
            "action": context.action,
            "resource": context.resource,
            "verdict": decision.verdict,
            "reason": decision.reason,
            "confidence": decision.confidence,
            "decidedAt": decision.decided_at,
        });
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("webhook unreachable: {}", e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned {}", response.status()))
        }
    }

    async fn send_chat(
        &self,
        channel: &str,
        context: &DecisionContext,
        decision: &Decision,
    ) -> ObligationResult {
        let url = self
            .config
            .chat_webhook_url
            .as_deref()
            .ok_or_else(|| "chat webhook not configured".to_string())?;
        let body = json!({
            "channel": channel,
            "text": format!(
                "{} {}: {}",
                priority_emoji(context),
                self.render_subject(context, decision),
                decision.reason
            ),
        });
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("chat webhook unreachable: {}", e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("chat webhook returned {}", response.status()))
        }
    }
}

fn priority_tag(context: &DecisionContext) -> String {
    context
        .environment
        .get("priority")
        .and_then(|v| v.as_str())
        .unwrap_or("normal")
        .to_uppercase()
}

fn priority_emoji(context: &DecisionContext) -> &'static str {
    match priority_tag(context).as_str() {
        "URGENT" => "🚨",
        "HIGH" => "⚠️",
        _ => "ℹ️",
    }
}

#[async_trait]
impl ObligationExecutor for NotifyObligation {
    fn name(&self) -> &'static str {
        "notifier"
    }

    fn matches(&self, directive: &Directive) -> bool {
        directive.keyword() == "notify"
    }

    async fn execute(
        &self,
        directive: &Directive,
        context: &DecisionContext,
        decision: &Decision,
    ) -> ObligationResult {
        let argument = directive
            .argument()
            .ok_or_else(|| "notify directive needs a channel".to_string())?;
        let (channel, target) = argument
            .split_once(':')
            .ok_or_else(|| format!("malformed notify directive '{}'", argument))?;

        match channel {
            "email" => self.send_email(target, context, decision).await,
            "webhook" => self.send_webhook(target, context, decision).await,
            "chat" => self.send_chat(target, context, decision).await,
            other => Err(format!("unknown notification channel '{}'", other)),
        }
    }
}
