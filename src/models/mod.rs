//! Core data model: decision contexts, policies, decisions, tasks.

pub mod context;
pub mod decision;
pub mod policy;
pub mod task;

pub use context::{AgentType, DecisionContext, ResourceClassification};
pub use decision::{Decision, DecisionMetadata, Verdict};
pub use policy::{
    Constraint, ConstraintExpr, ConstraintOperator, DeclarativePolicy, PolicyBody, PolicyMetadata,
    PolicyRecord, PolicyStatus, Rule,
};
pub use task::{
    Task, TaskError, TaskHistoryEntry, TaskMetadata, TaskPriority, TaskState, TaskUpdate,
    TASK_HISTORY_CAPACITY,
};
