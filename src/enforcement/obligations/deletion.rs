//! Scheduled-deletion obligation.
//!
//! Computes the absolute deletion time from the directive and enqueues a
//! one-shot job. Scheduling is idempotent per (resource, scheduledAt).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::enforcement::constraints::time_limit::parse_duration;
use crate::enforcement::Directive;
use crate::models::{Decision, DecisionContext};

use super::{ObligationExecutor, ObligationResult};

/// Callback invoked when a scheduled deletion fires
pub type DeletionSink = Arc<dyn Fn(&str) + Send + Sync>;

/// One-shot deletion scheduler
pub struct DeletionScheduler {
    scheduler: JobScheduler,
    /// Idempotency set keyed by (resource, scheduledAt)
    scheduled: DashMap<String, DateTime<Utc>>,
    sink: DeletionSink,
}

impl DeletionScheduler {
    pub async fn new(sink: Option<DeletionSink>) -> std::result::Result<Self, String> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| format!("scheduler startup failed: {}", e))?;
        scheduler
            .start()
            .await
            .map_err(|e| format!("scheduler start failed: {}", e))?;
        Ok(Self {
            scheduler,
            scheduled: DashMap::new(),
            sink: sink.unwrap_or_else(|| {
                Arc::new(|resource: &str| {
                    tracing::info!(resource, "Scheduled deletion fired");
                })
            }),
        })
    }

    /// Resolve the directive argument to an absolute deletion time.
    /// Accepts an RFC 3339 timestamp or a relative duration (`24h`, `30s`).
    fn deletion_time(argument: &str) -> std::result::Result<DateTime<Utc>, String> {
        if let Ok(at) = DateTime::parse_from_rfc3339(argument) {
            return Ok(at.with_timezone(&Utc));
        }
        parse_duration(argument)
            .map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default())
            .ok_or_else(|| format!("unparseable deletion time '{}'", argument))
    }

    pub fn pending(&self) -> usize {
        self.scheduled.len()
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.scheduler.shutdown().await {
            tracing::warn!(error = %e, "Deletion scheduler shutdown failed");
        }
    }
}

#[async_trait]
impl ObligationExecutor for DeletionScheduler {
    fn name(&self) -> &'static str {
        "deletion-scheduler"
    }

    fn matches(&self, directive: &Directive) -> bool {
        directive.keyword() == "scheduleDeletion"
    }

    async fn execute(
        &self,
        directive: &Directive,
        context: &DecisionContext,
        _decision: &Decision,
    ) -> ObligationResult {
        let argument = directive
            .argument()
            .ok_or_else(|| "scheduleDeletion needs a time argument".to_string())?;
        let at = Self::deletion_time(argument)?;
        let resource = context.resource.clone();

        // Second scheduling of the same (resource, time) is a no-op
        let idempotency_key = format!("{}\x1f{}", resource, at.timestamp());
        if self.scheduled.contains_key(&idempotency_key) {
            tracing::debug!(resource = %resource, at = %at, "Deletion already scheduled");
            return Ok(());
        }
        self.scheduled.insert(idempotency_key, at);

        let delay = (at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let sink = self.sink.clone();
        let job_resource = resource.clone();
        let job = Job::new_one_shot_async(delay, move |_uuid, _lock| {
            let sink = sink.clone();
            let resource = job_resource.clone();
            Box::pin(async move {
                sink(&resource);
            })
        })
        .map_err(|e| format!("deletion job creation failed: {}", e))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| format!("deletion job scheduling failed: {}", e))?;

        tracing::info!(resource = %resource, at = %at, "Deletion scheduled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> DecisionContext {
        DecisionContext::new("a", AgentType::Research, "data:store", "file:///tmp/report.csv")
    }

    #[test]
    fn test_deletion_time_forms() {
        let absolute = DeletionScheduler::deletion_time("2030-01-01T00:00:00Z").unwrap();
        assert_eq!(absolute.timestamp(), 1893456000);

        let relative = DeletionScheduler::deletion_time("24h").unwrap();
        assert!(relative > Utc::now());

        assert!(DeletionScheduler::deletion_time("whenever").is_err());
    }

    #[tokio::test]
    async fn test_scheduling_is_idempotent() {
        let scheduler = DeletionScheduler::new(None).await.unwrap();
        let directive = Directive::parse("scheduleDeletion:2030-01-01T00:00:00Z");

        scheduler
            .execute(&directive, &context(), &Decision::permit("ok"))
            .await
            .unwrap();
        scheduler
            .execute(&directive, &context(), &Decision::permit("ok"))
            .await
            .unwrap();

        assert_eq!(scheduler.pending(), 1);
    }

    #[tokio::test]
    async fn test_deletion_fires_the_sink() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        let sink: DeletionSink = Arc::new(move |_resource| {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        let scheduler = DeletionScheduler::new(Some(sink)).await.unwrap();
        scheduler
            .execute(
                &Directive::parse("scheduleDeletion:1s"),
                &context(),
                &Decision::permit("ok"),
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
