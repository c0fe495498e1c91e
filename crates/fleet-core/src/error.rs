use crate::types::{TaskId, TaskStatus};

// ---------------------------------------------------------------------------
// FleetError
// ---------------------------------------------------------------------------

/// Errors raised by the store and the transition engine.
///
/// Gate failures (unchecked prerequisites, missing evidence) are not errors:
/// they are ordinary transitions reported through
/// [`TransitionOutcome`](crate::lifecycle::TransitionOutcome).
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("invalid transition for {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("approval refused for {task}: {reason}")]
    ApprovalRefused { task: TaskId, reason: String },

    #[error("prerequisite #{index} of {task} is human-only: {label}")]
    HumanOnly {
        task: TaskId,
        index: usize,
        label: String,
    },

    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("store: {0}")]
    Store(#[from] tokio_rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
