//! Payload anonymization: redact, mask, hash, or tokenize sensitive fields.
//!
//! Recurses into objects and arrays. Masks are format-preserving for email,
//! phone, card, and SSN-shaped values.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::enforcement::{Directive, EnforcementError};
use crate::models::DecisionContext;

use super::{ConstraintProcessor, ProcessorKind};

/// Default sensitive-field vocabulary
pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "name",
    "email",
    "phone",
    "address",
    "ssn",
    "creditCard",
    "passport",
    "bankAccount",
    "taxId",
];

/// Session-scoped tokenization table.
///
/// Tokens are stable for equal inputs within a session and unique across
/// distinct inputs. Cleared on shutdown; never persisted.
pub struct TokenStore {
    tokens: DashMap<String, String>,
    counter: AtomicU64,
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
            counter: AtomicU64::new(0),
        }
    }

    /// Stable token for a value: equal inputs map to equal tokens, distinct
    /// inputs never collide (tokens are counter-allocated).
    pub fn tokenize(&self, value: &str) -> String {
        self.tokens
            .entry(value.to_string())
            .or_insert_with(|| {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                format!("tok_{:012x}", n)
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn clear(&self) {
        self.tokens.clear();
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Redact,
    Mask,
    Hash,
    Tokenize,
}

impl Mode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "redact" => Some(Mode::Redact),
            "mask" => Some(Mode::Mask),
            "hash" => Some(Mode::Hash),
            "tokenize" => Some(Mode::Tokenize),
            _ => None,
        }
    }
}

/// Recursive payload anonymizer
pub struct AnonymizerProcessor {
    sensitive_fields: HashSet<String>,
    token_store: Arc<TokenStore>,
}

impl AnonymizerProcessor {
    pub fn new(token_store: Arc<TokenStore>) -> Self {
        Self {
            sensitive_fields: DEFAULT_SENSITIVE_FIELDS
                .iter()
                .map(|f| f.to_lowercase())
                .collect(),
            token_store,
        }
    }

    pub fn with_fields(token_store: Arc<TokenStore>, fields: &[String]) -> Self {
        Self {
            sensitive_fields: fields.iter().map(|f| f.to_lowercase()).collect(),
            token_store,
        }
    }

    fn is_sensitive(&self, field: &str) -> bool {
        let normalized: String = field
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        self.sensitive_fields
            .iter()
            .any(|s| normalized == s.chars().filter(|c| c.is_ascii_alphanumeric()).collect::<String>())
    }

    fn anonymize(&self, value: Value, mode: Mode, field_hint: Option<&str>) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, child) in map {
                    let child = if self.is_sensitive(&key) {
                        self.scrub(child, mode, &key)
                    } else {
                        self.anonymize(child, mode, Some(&key))
                    };
                    out.insert(key, child);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.anonymize(item, mode, field_hint))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Scrub a sensitive value (and anything nested under a sensitive key)
    fn scrub(&self, value: Value, mode: Mode, field: &str) -> Value {
        match value {
            Value::String(s) => Value::String(self.scrub_string(&s, mode, field)),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.scrub(item, mode, field))
                    .collect(),
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, child) in map {
                    let scrubbed = self.scrub(child, mode, &key);
                    out.insert(key, scrubbed);
                }
                Value::Object(out)
            }
            Value::Number(_) | Value::Bool(_) => match mode {
                Mode::Redact => Value::String("[REDACTED]".to_string()),
                _ => Value::String(self.scrub_string(&value.to_string(), mode, field)),
            },
            Value::Null => Value::Null,
        }
    }

    fn scrub_string(&self, s: &str, mode: Mode, field: &str) -> String {
        match mode {
            Mode::Redact => "[REDACTED]".to_string(),
            Mode::Hash => {
                let mut hasher = Sha256::new();
                hasher.update(s.as_bytes());
                format!("sha256:{:x}", hasher.finalize())[..23].to_string()
            }
            Mode::Tokenize => self.token_store.tokenize(s),
            Mode::Mask => mask_value(s, field),
        }
    }
}

/// Format-preserving masking keyed by the field category
fn mask_value(s: &str, field: &str) -> String {
    let category: String = field
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();

    match category.as_str() {
        "email" => mask_email(s),
        "phone" => mask_trailing(s, 4),
        "creditcard" | "bankaccount" => mask_trailing(s, 4),
        "ssn" => mask_ssn(s),
        _ => mask_generic(s),
    }
}

fn mask_email(s: &str) -> String {
    match s.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            let head: String = local.chars().take(1).collect();
            format!("{}***@{}", head, domain)
        }
        _ => mask_generic(s),
    }
}

/// Keep the last `keep` digits, star the rest, preserve separators
fn mask_trailing(s: &str, keep: usize) -> String {
    let digit_count = s.chars().filter(|c| c.is_ascii_digit()).count();
    let mut seen = 0usize;
    s.chars()
        .map(|c| {
            if c.is_ascii_digit() {
                seen += 1;
                if seen + keep > digit_count {
                    c
                } else {
                    '*'
                }
            } else {
                c
            }
        })
        .collect()
}

fn mask_ssn(s: &str) -> String {
    mask_trailing(s, 4)
}

fn mask_generic(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => format!("{}{}", first, "*".repeat(s.chars().count().saturating_sub(1))),
        None => String::new(),
    }
}

#[async_trait]
impl ConstraintProcessor for AnonymizerProcessor {
    fn name(&self) -> &'static str {
        "anonymizer"
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Transform
    }

    fn matches(&self, directive: &Directive) -> bool {
        directive.keyword() == "anonymize"
    }

    async fn apply(
        &self,
        directive: &Directive,
        payload: Value,
        _context: &DecisionContext,
    ) -> std::result::Result<Value, EnforcementError> {
        let mode = match directive.argument() {
            None => Mode::Mask,
            Some(arg) => Mode::parse(arg).ok_or_else(|| EnforcementError::Rejected {
                processor: "anonymizer".to_string(),
                message: format!("unknown anonymization mode '{}'", arg),
            })?,
        };
        Ok(self.anonymize(payload, mode, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentType;
    use serde_json::json;

    fn processor() -> AnonymizerProcessor {
        AnonymizerProcessor::new(Arc::new(TokenStore::new()))
    }

    fn context() -> DecisionContext {
        DecisionContext::new("a", AgentType::Research, "tool:call", "tool:x")
    }

    async fn run(p: &AnonymizerProcessor, directive: &str, payload: Value) -> Value {
        p.apply(&Directive::parse(directive), payload, &context())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_mask_is_format_preserving() {
        let p = processor();
        let out = run(
            &p,
            "anonymize:mask",
            json!({
                "email": "jane.doe@example.com",
                "phone": "555-867-5309",
                "creditCard": "4111 1111 1111 1234",
                "ssn": "078-05-1120",
                "note": "untouched"
            }),
        )
        .await;

        assert_eq!(out["email"], "j***@example.com");
        assert_eq!(out["phone"], "***-***-5309");
        assert_eq!(out["creditCard"], "**** **** **** 1234");
        assert_eq!(out["ssn"], "***-**-1120");
        assert_eq!(out["note"], "untouched");
    }

    #[tokio::test]
    async fn test_redact_mode() {
        let p = processor();
        let out = run(&p, "anonymize:redact", json!({ "name": "Jane Doe", "age": 41 })).await;
        assert_eq!(out["name"], "[REDACTED]");
        assert_eq!(out["age"], 41);
    }

    #[tokio::test]
    async fn test_recursion_into_arrays_and_objects() {
        let p = processor();
        let out = run(
            &p,
            "anonymize:redact",
            json!({
                "records": [
                    { "email": "a@x.com", "value": 1 },
                    { "nested": { "ssn": "078-05-1120" } }
                ]
            }),
        )
        .await;
        assert_eq!(out["records"][0]["email"], "[REDACTED]");
        assert_eq!(out["records"][0]["value"], 1);
        assert_eq!(out["records"][1]["nested"]["ssn"], "[REDACTED]");
    }

    #[tokio::test]
    async fn test_hash_mode_is_deterministic() {
        let p = processor();
        let a = run(&p, "anonymize:hash", json!({ "email": "a@x.com" })).await;
        let b = run(&p, "anonymize:hash", json!({ "email": "a@x.com" })).await;
        assert_eq!(a["email"], b["email"]);
        assert!(a["email"].as_str().unwrap().starts_with("sha256:"));
    }

    #[tokio::test]
    async fn test_tokenize_is_stable_and_collision_free() {
        let store = Arc::new(TokenStore::new());
        let p = AnonymizerProcessor::new(store.clone());

        let first = run(&p, "anonymize:tokenize", json!({ "name": "Jane" })).await;
        let second = run(&p, "anonymize:tokenize", json!({ "name": "Jane" })).await;
        assert_eq!(first["name"], second["name"]);

        // Distinct random inputs never collide
        let mut seen = std::collections::HashSet::new();
        for i in 0..500 {
            let token = store.tokenize(&format!("value-{}", i));
            assert!(seen.insert(token), "token collision at input {}", i);
        }
    }

    #[tokio::test]
    async fn test_unknown_mode_rejected() {
        let p = processor();
        let err = p
            .apply(
                &Directive::parse("anonymize:scramble"),
                json!({}),
                &context(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_snake_case_field_names_match() {
        let p = processor();
        let out = run(&p, "anonymize:redact", json!({ "credit_card": "4111", "tax_id": "x" })).await;
        assert_eq!(out["credit_card"], "[REDACTED]");
        assert_eq!(out["tax_id"], "[REDACTED]");
    }

    #[test]
    fn test_token_store_clears_on_shutdown() {
        let store = TokenStore::new();
        store.tokenize("a");
        store.tokenize("b");
        assert_eq!(store.len(), 2);
        store.clear();
        assert!(store.is_empty());
    }
}
