//! Report obligation: emit a structured report artifact asynchronously.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

use crate::enforcement::Directive;
use crate::models::{Decision, DecisionContext};

use super::{ObligationExecutor, ObligationResult};

/// Writes one JSON artifact per report directive
pub struct ReportObligation {
    dir: PathBuf,
}

impl ReportObligation {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ObligationExecutor for ReportObligation {
    fn name(&self) -> &'static str {
        "report-generator"
    }

    fn matches(&self, directive: &Directive) -> bool {
        directive.keyword() == "report"
    }

    async fn execute(
        &self,
        directive: &Directive,
        context: &DecisionContext,
        decision: &Decision,
    ) -> ObligationResult {
        let report_type = directive.argument().unwrap_or("generic");
        let id = Uuid::new_v4();
        let artifact = json!({
            "id": id,
            "reportType": report_type,
            "generatedAt": Utc::now(),
            "context": context,
            "decision": decision,
        });

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| format!("report directory unavailable: {}", e))?;
        let path = self.dir.join(format!("{}-{}.json", report_type, id));
        tokio::fs::write(
            &path,
            serde_json::to_vec_pretty(&artifact).map_err(|e| e.to_string())?,
        )
        .await
        .map_err(|e| format!("report write failed: {}", e))?;

        tracing::info!(path = %path.display(), report_type, "Report artifact written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentType;

    #[tokio::test]
    async fn test_report_artifact_written() {
        let dir = tempfile::TempDir::new().unwrap();
        let reporter = ReportObligation::new(dir.path());
        let context = DecisionContext::new("a", AgentType::Admin, "tool:call", "tool:x");

        reporter
            .execute(
                &Directive::parse("report:compliance"),
                &context,
                &Decision::permit("ok"),
            )
            .await
            .unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name();
        assert!(name.to_string_lossy().starts_with("compliance-"));

        let raw = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["reportType"], "compliance");
        assert_eq!(parsed["context"]["agentId"], "a");
    }
}
