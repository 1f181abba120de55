//! Typed error hierarchy for the Crucible scheduler.
//!
//! Three top-level enums cover the three subsystems:
//! - `SchedulerError` — task store and admission-queue failures, returned
//!   synchronously to API callers
//! - `ExecutorError` — per-task execution failures, recorded on the task
//!   record and surfaced to subscribers as a failure event
//! - `AgentError` — failures at the external code-agent boundary

use thiserror::Error;

use crate::scheduler::task::TaskStatus;

/// Errors from the task store and admission queue.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    #[error("task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {id} has not completed (status: {status})")]
    NotCompleted { id: String, status: TaskStatus },

    #[error("admission queue is saturated, try again later")]
    QueueSaturated,

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Errors from a single task execution.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("missing or invalid parameter: {name}")]
    InvalidParam { name: &'static str },

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("{what} timed out after {seconds}s")]
    Timeout { what: &'static str, seconds: u64 },

    #[error("{0}")]
    Repository(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal executor failure: {0}")]
    Internal(String),
}

/// Errors from the external code-agent service.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("request to code agent failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("code agent returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("code agent response was not a JSON object")]
    MalformedResponse,

    #[error("code agent call failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}
