//! Task lifecycle management.
//!
//! Tasks live in an arena keyed by id; history references ids, never task
//! objects. Each submission gets a dedicated worker that observes the shared
//! task record; cancellation is cooperative. Every accepted transition is
//! published to SSE subscribers in order.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{
    DecisionContext, Task, TaskError, TaskPriority, TaskState, TaskUpdate,
};

/// Capacity of the task-update broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The work an agent performs for a task
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: Task) -> std::result::Result<Value, TaskError>;
}

/// Default processor: echoes the prompt back as the result
pub struct EchoProcessor;

#[async_trait]
impl TaskProcessor for EchoProcessor {
    async fn process(&self, task: Task) -> std::result::Result<Value, TaskError> {
        Ok(serde_json::json!({ "echo": task.prompt }))
    }
}

/// Parameters accepted by `tasks/send`
#[derive(Debug, Clone, Default)]
pub struct TaskSubmission {
    pub prompt: String,
    pub context: Value,
    pub priority: TaskPriority,
    pub policy_context: Option<DecisionContext>,
    pub parent_task_id: Option<Uuid>,
}

/// Arena-backed task store plus worker orchestration
pub struct TaskManager {
    agent_name: String,
    tasks: Arc<DashMap<Uuid, Task>>,
    events: broadcast::Sender<TaskUpdate>,
    processor: Arc<dyn TaskProcessor>,
    worker_slots: Arc<Semaphore>,
}

impl TaskManager {
    pub fn new(
        agent_name: impl Into<String>,
        processor: Arc<dyn TaskProcessor>,
        max_concurrent_tasks: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            agent_name: agent_name.into(),
            tasks: Arc::new(DashMap::new()),
            events,
            processor,
            worker_slots: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Create a task and kick off its worker
    pub fn submit(&self, submission: TaskSubmission) -> Task {
        let mut task = Task::new(&self.agent_name, submission.prompt)
            .with_priority(submission.priority);
        task.context = submission.context;
        if let Some(policy_context) = submission.policy_context {
            task = task.with_policy_context(policy_context);
        }
        if let Some(parent) = submission.parent_task_id {
            task = task.with_parent(parent);
        }

        let snapshot = task.clone();
        self.tasks.insert(task.id, task);
        metrics::TASK_EVENTS_TOTAL
            .with_label_values(&["SUBMITTED"])
            .inc();
        self.publish(&snapshot);
        self.spawn_worker(snapshot.id);

        tracing::info!(task_id = %snapshot.id, agent = %self.agent_name, "Task submitted");
        snapshot
    }

    pub fn get(&self, id: &Uuid) -> Option<Task> {
        self.tasks.get(id).map(|entry| entry.clone())
    }

    /// Mark CANCELLED if the task is in a non-terminal state
    pub fn cancel(&self, id: &Uuid, actor: &str) -> Result<Task> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("task {} not found", id)))?;
        entry
            .transition(TaskState::Cancelled, actor, "cancelled by request")
            .map_err(AppError::InvalidStateTransition)?;
        let snapshot = entry.clone();
        drop(entry);

        metrics::TASK_EVENTS_TOTAL
            .with_label_values(&["CANCELLED"])
            .inc();
        self.publish(&snapshot);
        tracing::info!(task_id = %id, actor, "Task cancelled");
        Ok(snapshot)
    }

    /// Live event stream for SSE subscribers
    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdate> {
        self.events.subscribe()
    }

    /// History updates for one task, oldest first, for `includeHistory`
    pub fn history_updates(&self, id: &Uuid) -> Vec<TaskUpdate> {
        self.tasks
            .get(id)
            .map(|task| {
                task.history
                    .iter()
                    .map(|entry| TaskUpdate {
                        task_id: *id,
                        state: entry.to_state,
                        timestamp: entry.timestamp,
                        result: None,
                        error: None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn publish(&self, task: &Task) {
        // A lagging or absent subscriber must never block task progress
        let _ = self.events.send(TaskUpdate::from_task(task));
    }

    /// Apply a transition under the arena entry lock, then publish
    fn transition(
        &self,
        id: &Uuid,
        next: TaskState,
        actor: &str,
        detail: &str,
        result: Option<Value>,
        error: Option<TaskError>,
    ) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("task {} not found", id)))?;
        entry
            .transition(next, actor, detail)
            .map_err(AppError::InvalidStateTransition)?;
        if let Some(result) = result {
            entry.result = Some(result);
        }
        if let Some(error) = error {
            entry.error = Some(error);
        }
        let snapshot = entry.clone();
        drop(entry);

        metrics::TASK_EVENTS_TOTAL
            .with_label_values(&[&next.to_string()])
            .inc();
        self.publish(&snapshot);
        Ok(())
    }

    fn spawn_worker(&self, id: Uuid) {
        let tasks = self.tasks.clone();
        let events = self.events.clone();
        let processor = self.processor.clone();
        let slots = self.worker_slots.clone();
        let agent = self.agent_name.clone();
        let manager = TaskWorkerHandle {
            tasks,
            events,
            agent,
        };

        tokio::spawn(async move {
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            // The task may have been cancelled while queued for a slot.
            let task = match manager.load(&id) {
                Some(task) if task.state == TaskState::Submitted => task,
                _ => return,
            };

            if manager
                .transition(&id, TaskState::Working, "worker", "processing started", None, None)
                .is_err()
            {
                return;
            }

            let outcome = processor.process(task).await;

            // Cooperative cancellation: if the task went terminal while the
            // processor ran, its outcome is dropped.
            if manager
                .load(&id)
                .map(|t| t.state.is_terminal())
                .unwrap_or(true)
            {
                tracing::debug!(task_id = %id, "Worker outcome discarded after cancellation");
                return;
            }

            let result = match outcome {
                Ok(result) => manager.transition(
                    &id,
                    TaskState::Completed,
                    "worker",
                    "processing finished",
                    Some(result),
                    None,
                ),
                Err(error) => manager.transition(
                    &id,
                    TaskState::Failed,
                    "worker",
                    "processing failed",
                    None,
                    Some(error),
                ),
            };
            if let Err(e) = result {
                tracing::warn!(task_id = %id, error = %e, "Worker finalization rejected");
            }
        });
    }
}

/// The subset of manager state a worker touches
struct TaskWorkerHandle {
    tasks: Arc<DashMap<Uuid, Task>>,
    events: broadcast::Sender<TaskUpdate>,
    agent: String,
}

impl TaskWorkerHandle {
    fn load(&self, id: &Uuid) -> Option<Task> {
        self.tasks.get(id).map(|entry| entry.clone())
    }

    fn transition(
        &self,
        id: &Uuid,
        next: TaskState,
        actor: &str,
        detail: &str,
        result: Option<Value>,
        error: Option<TaskError>,
    ) -> std::result::Result<(), String> {
        let mut entry = self.tasks.get_mut(id).ok_or("task vanished")?;
        entry.transition(next, actor, detail)?;
        if let Some(result) = result {
            entry.result = Some(result);
        }
        if let Some(error) = error {
            entry.error = Some(error);
        }
        let snapshot = entry.clone();
        drop(entry);

        metrics::TASK_EVENTS_TOTAL
            .with_label_values(&[&next.to_string()])
            .inc();
        tracing::debug!(task_id = %id, agent = %self.agent, state = %next, "Task transitioned");
        let _ = self.events.send(TaskUpdate::from_task(&snapshot));
        Ok(())
    }
}
