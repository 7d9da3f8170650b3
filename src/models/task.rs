use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use strum::{Display, EnumString};
use uuid::Uuid;
use validator::Validate;

use super::context::DecisionContext;

/// Maximum entries retained in a task's history ring buffer
pub const TASK_HISTORY_CAPACITY: usize = 100;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Submitted,
    Working,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Terminal states cannot transition further
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Whether `self -> next` is a legal edge in the state machine.
    ///
    /// SUBMITTED -> WORKING -> {COMPLETED, FAILED}; any non-terminal state
    /// may move to CANCELLED via explicit cancel.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match (self, next) {
            (TaskState::Submitted, TaskState::Working) => true,
            (TaskState::Working, TaskState::Completed) => true,
            (TaskState::Working, TaskState::Failed) => true,
            (TaskState::Submitted, TaskState::Failed) => true,
            (state, TaskState::Cancelled) => !state.is_terminal(),
            _ => false,
        }
    }
}

/// Task priority
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Typed task failure surfaced to callers; never a raw stack trace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub code: String,
    pub message: String,
}

impl TaskError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn policy_denied(message: impl Into<String>) -> Self {
        Self::new("POLICY_DENIED", message)
    }
}

/// One entry in the per-task history ring buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub from_state: Option<TaskState>,
    pub to_state: TaskState,
    pub actor: String,
    pub detail: String,
}

/// Task-scoped policy envelope snapshotted at submission
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    /// Snapshot of the DecisionContext, including the delegation chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_context: Option<DecisionContext>,
}

/// A unit of agent work
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<Uuid>,

    /// Owning agent
    #[validate(length(min = 1, max = 255))]
    pub agent_id: String,

    pub state: TaskState,

    #[validate(length(min = 1, max = 65536))]
    pub prompt: String,

    #[serde(default)]
    pub context: serde_json::Value,

    #[serde(default)]
    pub priority: TaskPriority,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    #[serde(default)]
    pub metadata: TaskMetadata,

    /// Bounded state-change history, oldest dropped first
    #[serde(default)]
    pub history: VecDeque<TaskHistoryEntry>,
}

impl Task {
    /// Create a freshly submitted task
    pub fn new(agent_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        let agent_id = agent_id.into();
        let mut task = Self {
            id: Uuid::new_v4(),
            parent_task_id: None,
            agent_id,
            state: TaskState::Submitted,
            prompt: prompt.into(),
            context: serde_json::Value::Null,
            priority: TaskPriority::Normal,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            error: None,
            metadata: TaskMetadata::default(),
            history: VecDeque::new(),
        };
        task.push_history(None, TaskState::Submitted, "system", "Task submitted");
        task
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_policy_context(mut self, context: DecisionContext) -> Self {
        self.metadata.policy_context = Some(context);
        self
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_task_id = Some(parent);
        self
    }

    /// Transition to `next`, enforcing monotonicity.
    ///
    /// Terminal states never transition; `completed_at` is set exactly when
    /// the new state is terminal. Every accepted change appends to history.
    pub fn transition(
        &mut self,
        next: TaskState,
        actor: &str,
        detail: impl Into<String>,
    ) -> std::result::Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!(
                "illegal task transition {} -> {}",
                self.state, next
            ));
        }

        let from = self.state;
        self.state = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        self.push_history(Some(from), next, actor, detail);
        Ok(())
    }

    fn push_history(
        &mut self,
        from_state: Option<TaskState>,
        to_state: TaskState,
        actor: &str,
        detail: impl Into<String>,
    ) {
        if self.history.len() >= TASK_HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(TaskHistoryEntry {
            timestamp: Utc::now(),
            from_state,
            to_state,
            actor: actor.to_string(),
            detail: detail.into(),
        });
    }
}

/// A task-state change published to SSE subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub task_id: Uuid,
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl TaskUpdate {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            state: task.state,
            timestamp: task.updated_at,
            result: task.result.clone(),
            error: task.error.clone(),
        }
    }
}
