//! Append-only audit trail for every policy decision.
//!
//! Entries are held in a bounded in-memory ring and appended to a JSON-lines
//! sink when one is configured. The recorder also derives the compliance
//! statistics summary.

use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Decision, DecisionContext, Verdict};

/// Entries retained in memory for queries
pub const AUDIT_RING_CAPACITY: usize = 10_000;

/// Confidence thresholds for the risk distribution
const HIGH_RISK_BELOW: f64 = 0.5;
const MEDIUM_RISK_BELOW: f64 = 0.8;

/// What ultimately happened to the gated request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    Failure,
    Error,
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub context: DecisionContext,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_used: Option<String>,
    pub processing_ms: u64,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Sort key for queries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum AuditOrderBy {
    #[default]
    Timestamp,
    Confidence,
    ProcessingTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderDir {
    Asc,
    #[default]
    Desc,
}

/// Filtered query over the audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    #[serde(default)]
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<Verdict>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub order_by: AuditOrderBy,
    #[serde(default)]
    pub order_dir: OrderDir,
}

fn default_limit() -> usize {
    100
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            date_range: None,
            agents: Vec::new(),
            policies: Vec::new(),
            decisions: Vec::new(),
            min_confidence: None,
            limit: default_limit(),
            offset: 0,
            order_by: AuditOrderBy::default(),
            order_dir: OrderDir::default(),
        }
    }
}

/// Derived statistics over the audit trail
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuditStatistics {
    pub total_entries: usize,
    pub by_verdict: HashMap<String, usize>,
    pub by_policy: HashMap<String, usize>,
    pub by_agent: HashMap<String, usize>,
    /// Entry counts per hour of day (UTC), index 0..24
    pub hourly_distribution: Vec<usize>,
    pub average_processing_ms: f64,
    pub average_confidence: f64,
    pub risk_distribution: RiskDistribution,
}

/// Entries bucketed by decision confidence
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RiskDistribution {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

struct RecorderInner {
    entries: VecDeque<AuditEntry>,
    sink: Option<std::fs::File>,
}

/// Append-only decision recorder
pub struct AuditRecorder {
    inner: Mutex<RecorderInner>,
    capacity: usize,
}

impl AuditRecorder {
    /// In-memory recorder without a file sink
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(RecorderInner {
                entries: VecDeque::new(),
                sink: None,
            }),
            capacity: AUDIT_RING_CAPACITY,
        }
    }

    /// Recorder with a JSON-lines file sink
    pub fn with_sink(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let sink = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            inner: Mutex::new(RecorderInner {
                entries: VecDeque::new(),
                sink: Some(sink),
            }),
            capacity: AUDIT_RING_CAPACITY,
        })
    }

    /// Append an entry. The ring bound and the sink write happen under one
    /// lock so concurrent records never interleave half-written lines.
    pub fn record(&self, entry: AuditEntry) {
        let mut inner = self.inner.lock();
        if let Some(sink) = inner.sink.as_mut() {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    if let Err(e) = writeln!(sink, "{}", line) {
                        tracing::warn!(error = %e, "Audit sink write failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Audit entry serialization failed"),
            }
        }
        if inner.entries.len() >= self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);
    }

    /// Convenience constructor for the common record shape
    pub fn record_decision(
        &self,
        context: &DecisionContext,
        decision: &Decision,
        processing_ms: u64,
        outcome: AuditOutcome,
    ) {
        self.record(AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            context: context.clone(),
            decision: decision.clone(),
            policy_used: decision.metadata.policy_uid.clone(),
            processing_ms,
            outcome,
            metadata: None,
        });
    }

    /// Filtered, ordered, paginated query
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let inner = self.inner.lock();
        let mut hits: Vec<AuditEntry> = inner
            .entries
            .iter()
            .filter(|entry| {
                if let Some((from, to)) = &query.date_range {
                    if entry.timestamp < *from || entry.timestamp > *to {
                        return false;
                    }
                }
                if !query.agents.is_empty() && !query.agents.contains(&entry.context.agent_id) {
                    return false;
                }
                if !query.policies.is_empty() {
                    match &entry.policy_used {
                        Some(policy) if query.policies.contains(policy) => {}
                        _ => return false,
                    }
                }
                if !query.decisions.is_empty() && !query.decisions.contains(&entry.decision.verdict)
                {
                    return false;
                }
                if let Some(min) = query.min_confidence {
                    if entry.decision.confidence < min {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        hits.sort_by(|a, b| {
            let ordering = match query.order_by {
                AuditOrderBy::Timestamp => a.timestamp.cmp(&b.timestamp),
                AuditOrderBy::Confidence => a
                    .decision
                    .confidence
                    .partial_cmp(&b.decision.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal),
                AuditOrderBy::ProcessingTime => a.processing_ms.cmp(&b.processing_ms),
            };
            match query.order_dir {
                OrderDir::Asc => ordering,
                OrderDir::Desc => ordering.reverse(),
            }
        });

        hits.into_iter().skip(query.offset).take(query.limit).collect()
    }

    /// Recent entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let inner = self.inner.lock();
        inner.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute the statistics summary over the in-memory ring
    pub fn statistics(&self) -> AuditStatistics {
        let inner = self.inner.lock();
        let mut stats = AuditStatistics {
            hourly_distribution: vec![0; 24],
            ..Default::default()
        };
        if inner.entries.is_empty() {
            return stats;
        }

        let mut total_processing = 0u64;
        let mut total_confidence = 0.0f64;

        for entry in &inner.entries {
            stats.total_entries += 1;
            *stats
                .by_verdict
                .entry(entry.decision.verdict.to_string())
                .or_insert(0) += 1;
            if let Some(policy) = &entry.policy_used {
                *stats.by_policy.entry(policy.clone()).or_insert(0) += 1;
            }
            *stats
                .by_agent
                .entry(entry.context.agent_id.clone())
                .or_insert(0) += 1;
            stats.hourly_distribution[entry.timestamp.hour() as usize] += 1;
            total_processing += entry.processing_ms;
            total_confidence += entry.decision.confidence;

            let confidence = entry.decision.confidence;
            if confidence < HIGH_RISK_BELOW {
                stats.risk_distribution.high += 1;
            } else if confidence < MEDIUM_RISK_BELOW {
                stats.risk_distribution.medium += 1;
            } else {
                stats.risk_distribution.low += 1;
            }
        }

        stats.average_processing_ms = total_processing as f64 / stats.total_entries as f64;
        stats.average_confidence = total_confidence / stats.total_entries as f64;
        stats
    }
}
