//! Static policy-format detection.
//!
//! A heuristic classifier over the raw policy text. It never executes or
//! interprets the policy; it only scores structural and vocabulary signals.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Classifier output
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyFormat {
    Declarative,
    NaturalLanguage,
    Unknown,
}

/// A format classification with its confidence in [0, 1].
///
/// Confidence below 0.5 always reports UNKNOWN; the caller must reject or
/// explicitly force one evaluation path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FormatDetection {
    pub format: PolicyFormat,
    pub confidence: f64,
}

const DECLARATIVE_FIELDS: &[&str] = &[
    "\"permission\"",
    "\"prohibition\"",
    "\"duty\"",
    "\"leftOperand\"",
    "\"rightOperand\"",
    "\"operator\"",
    "\"uid\"",
    "\"priority\"",
    "\"action\"",
    "\"target\"",
];

// English policy vocabulary plus the localized (Japanese) equivalents the
// wire format accepts.
const NATURAL_KEYWORDS: &[&str] = &[
    "must",
    "must not",
    "may",
    "should",
    "allowed",
    "permitted",
    "prohibited",
    "forbidden",
    "cannot",
    "only if",
    "禁止",
    "許可",
    "必須",
    "してはならない",
    "することができる",
];

static BULLET_OR_CONDITIONAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^\s*[-*•]\s+|\b(if|when|unless|provided that|もし|場合)\b")
        .expect("static regex")
});

/// Classify a policy text as declarative JSON, natural language, or unknown.
pub fn detect_format(text: &str) -> FormatDetection {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return FormatDetection {
            format: PolicyFormat::Unknown,
            confidence: 0.0,
        };
    }

    let declarative = declarative_score(trimmed);
    let natural = natural_language_score(trimmed);

    // When both vocabularies are present, prefer the higher-confidence read.
    let (format, confidence) = if declarative >= natural {
        (PolicyFormat::Declarative, declarative)
    } else {
        (PolicyFormat::NaturalLanguage, natural)
    };

    if confidence < 0.5 {
        FormatDetection {
            format: PolicyFormat::Unknown,
            confidence,
        }
    } else {
        FormatDetection { format, confidence }
    }
}

fn declarative_score(text: &str) -> f64 {
    // A structurally valid JSON object is the strongest signal.
    let parses: bool = serde_json::from_str::<serde_json::Value>(text)
        .map(|v| v.is_object() || v.is_array())
        .unwrap_or(false);

    let field_hits = DECLARATIVE_FIELDS
        .iter()
        .filter(|field| text.contains(**field))
        .count();

    let mut score: f64 = 0.0;
    if parses {
        score += 0.5;
    }
    score += (field_hits as f64 * 0.12).min(0.5);
    score.min(1.0)
}

fn natural_language_score(text: &str) -> f64 {
    let lowered = text.to_lowercase();
    let keyword_hits = NATURAL_KEYWORDS
        .iter()
        .filter(|kw| lowered.contains(&kw.to_lowercase()))
        .count();

    let mut score: f64 = (keyword_hits as f64 * 0.2).min(0.6);
    if BULLET_OR_CONDITIONAL.is_match(text) {
        score += 0.2;
    }
    // Braces and quoted field names argue against prose
    if text.trim_start().starts_with('{') {
        score -= 0.3;
    }
    // Plain sentences with no JSON punctuation lean natural
    if !text.contains('{') && !text.contains('[') && keyword_hits > 0 {
        score += 0.2;
    }
    score.clamp(0.0, 1.0)
}
