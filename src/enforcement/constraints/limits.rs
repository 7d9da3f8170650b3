//! Payload bounding processors: field filtering, record-count limits, and
//! serialized-size limits. Truncations are annotated with `_truncated` and
//! `_originalSize`.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::enforcement::{Directive, EnforcementError};
use crate::models::DecisionContext;

use super::{ConstraintProcessor, ProcessorKind};

/// Keep or drop named fields on object payloads (and each object record in
/// arrays). Directive: `fieldFilter:keep:a,b` or `fieldFilter:drop:x,y`.
pub struct FieldFilterProcessor;

impl FieldFilterProcessor {
    fn filter(value: Value, keep: bool, fields: &[String]) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(key, _)| {
                        let listed = fields.iter().any(|f| f == key);
                        if keep {
                            listed
                        } else {
                            !listed
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| Self::filter(item, keep, fields))
                    .collect(),
            ),
            other => other,
        }
    }
}

#[async_trait]
impl ConstraintProcessor for FieldFilterProcessor {
    fn name(&self) -> &'static str {
        "field-filter"
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Transform
    }

    fn matches(&self, directive: &Directive) -> bool {
        directive.keyword() == "fieldFilter"
    }

    async fn apply(
        &self,
        directive: &Directive,
        payload: Value,
        _context: &DecisionContext,
    ) -> std::result::Result<Value, EnforcementError> {
        let argument = directive.argument().unwrap_or_default();
        let (mode, list) = argument.split_once(':').ok_or_else(|| EnforcementError::Rejected {
            processor: "field-filter".to_string(),
            message: format!("malformed fieldFilter argument '{}'", argument),
        })?;
        let fields: Vec<String> = list.split(',').map(|f| f.trim().to_string()).collect();
        let keep = match mode {
            "keep" => true,
            "drop" => false,
            _ => {
                return Err(EnforcementError::Rejected {
                    processor: "field-filter".to_string(),
                    message: format!("fieldFilter mode must be keep or drop, got '{}'", mode),
                })
            }
        };
        Ok(Self::filter(payload, keep, &fields))
    }
}

/// Truncate arrays to a configured record count.
/// Directive: `maxRecords:100`.
pub struct RecordCountProcessor;

impl RecordCountProcessor {
    fn truncate(value: Value, max: usize) -> Value {
        match value {
            Value::Array(items) if items.len() > max => {
                let original = items.len();
                json!({
                    "items": items.into_iter().take(max).collect::<Vec<_>>(),
                    "_truncated": true,
                    "_originalSize": original,
                })
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                let mut truncated_any = false;
                let mut original = 0usize;
                for (key, child) in map {
                    match child {
                        Value::Array(items) if items.len() > max => {
                            truncated_any = true;
                            original = original.max(items.len());
                            out.insert(key, Value::Array(items.into_iter().take(max).collect()));
                        }
                        other => {
                            out.insert(key, other);
                        }
                    }
                }
                if truncated_any {
                    out.insert("_truncated".to_string(), json!(true));
                    out.insert("_originalSize".to_string(), json!(original));
                }
                Value::Object(out)
            }
            other => other,
        }
    }
}

#[async_trait]
impl ConstraintProcessor for RecordCountProcessor {
    fn name(&self) -> &'static str {
        "record-count-limit"
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Transform
    }

    fn matches(&self, directive: &Directive) -> bool {
        directive.keyword() == "maxRecords"
    }

    async fn apply(
        &self,
        directive: &Directive,
        payload: Value,
        _context: &DecisionContext,
    ) -> std::result::Result<Value, EnforcementError> {
        let max: usize = directive
            .argument()
            .and_then(|a| a.trim().parse().ok())
            .ok_or_else(|| EnforcementError::Rejected {
                processor: "record-count-limit".to_string(),
                message: format!("maxRecords needs a numeric argument, got '{:?}'", directive.argument()),
            })?;
        Ok(Self::truncate(payload, max))
    }
}

/// Cap the serialized payload size in bytes.
/// Directive: `maxSize:65536`.
pub struct SizeLimitProcessor;

#[async_trait]
impl ConstraintProcessor for SizeLimitProcessor {
    fn name(&self) -> &'static str {
        "size-limit"
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Transform
    }

    fn matches(&self, directive: &Directive) -> bool {
        directive.keyword() == "maxSize"
    }

    async fn apply(
        &self,
        directive: &Directive,
        payload: Value,
        _context: &DecisionContext,
    ) -> std::result::Result<Value, EnforcementError> {
        let max: usize = directive
            .argument()
            .and_then(|a| a.trim().parse().ok())
            .ok_or_else(|| EnforcementError::Rejected {
                processor: "size-limit".to_string(),
                message: format!("maxSize needs a numeric argument, got '{:?}'", directive.argument()),
            })?;

        let serialized = payload.to_string();
        if serialized.len() <= max {
            return Ok(payload);
        }

        // Keep a valid-UTF-8 preview of the oversized document
        let mut cut = max.min(serialized.len());
        while cut > 0 && !serialized.is_char_boundary(cut) {
            cut -= 1;
        }
        Ok(json!({
            "_truncated": true,
            "_originalSize": serialized.len(),
            "preview": &serialized[..cut],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentType;

    fn context() -> DecisionContext {
        DecisionContext::new("a", AgentType::Research, "tool:call", "tool:x")
    }

    #[tokio::test]
    async fn test_field_filter_keep() {
        let out = FieldFilterProcessor
            .apply(
                &Directive::parse("fieldFilter:keep:id,title"),
                json!({"id": 1, "title": "t", "body": "secret"}),
                &context(),
            )
            .await
            .unwrap();
        assert_eq!(out, json!({"id": 1, "title": "t"}));
    }

    #[tokio::test]
    async fn test_field_filter_drop_recurses_into_arrays() {
        let out = FieldFilterProcessor
            .apply(
                &Directive::parse("fieldFilter:drop:secret"),
                json!([{"id": 1, "secret": "x"}, {"id": 2, "secret": "y"}]),
                &context(),
            )
            .await
            .unwrap();
        assert_eq!(out, json!([{"id": 1}, {"id": 2}]));
    }

    #[tokio::test]
    async fn test_record_count_truncates_and_annotates() {
        let out = RecordCountProcessor
            .apply(
                &Directive::parse("maxRecords:2"),
                json!({"rows": [1, 2, 3, 4, 5], "total": 5}),
                &context(),
            )
            .await
            .unwrap();
        assert_eq!(out["rows"], json!([1, 2]));
        assert_eq!(out["_truncated"], json!(true));
        assert_eq!(out["_originalSize"], json!(5));
        assert_eq!(out["total"], json!(5));
    }

    #[tokio::test]
    async fn test_record_count_top_level_array() {
        let out = RecordCountProcessor
            .apply(
                &Directive::parse("maxRecords:1"),
                json!(["a", "b", "c"]),
                &context(),
            )
            .await
            .unwrap();
        assert_eq!(out["items"], json!(["a"]));
        assert_eq!(out["_originalSize"], json!(3));
    }

    #[tokio::test]
    async fn test_record_count_under_limit_unchanged() {
        let payload = json!({"rows": [1, 2]});
        let out = RecordCountProcessor
            .apply(&Directive::parse("maxRecords:5"), payload.clone(), &context())
            .await
            .unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_size_limit_truncates_oversized_payload() {
        let big = json!({"data": "x".repeat(1000)});
        let out = SizeLimitProcessor
            .apply(&Directive::parse("maxSize:100"), big, &context())
            .await
            .unwrap();
        assert_eq!(out["_truncated"], json!(true));
        assert!(out["_originalSize"].as_u64().unwrap() > 1000);
        assert!(out["preview"].as_str().unwrap().len() <= 100);
    }

    #[tokio::test]
    async fn test_size_limit_under_cap_unchanged() {
        let payload = json!({"small": true});
        let out = SizeLimitProcessor
            .apply(&Directive::parse("maxSize:1000"), payload.clone(), &context())
            .await
            .unwrap();
        assert_eq!(out, payload);
    }
}
