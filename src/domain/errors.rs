//! Domain errors for the Cohort runtime.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use super::models::agent::AgentId;
use super::models::capability::CapabilitySet;
use super::models::task::{FailureReason, TaskId};

/// Errors returned when a task cannot be assigned to an agent.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulingError {
    #[error("No capable agent for task {task_id} (requires: {required})")]
    NoCapableAgent {
        task_id: TaskId,
        required: CapabilitySet,
    },

    #[error("All capable agents are at capacity for task {task_id}; retry after {retry_after:?}")]
    Overloaded {
        task_id: TaskId,
        retry_after: Duration,
    },

    #[error("Deadline {deadline} passed for task {task_id}")]
    DeadlineExceeded {
        task_id: TaskId,
        deadline: DateTime<Utc>,
    },

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Invalid task: {0}")]
    InvalidTask(String),
}

impl SchedulingError {
    /// Only `Overloaded` is worth retrying; everything else will fail the same way.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Overloaded { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Overloaded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            Self::NoCapableAgent { .. } | Self::AgentNotFound(_) => FailureReason::NoCapableAgent,
            Self::Overloaded { retry_after, .. } => FailureReason::Overloaded {
                retry_after_ms: u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
            },
            Self::DeadlineExceeded { .. } => FailureReason::DeadlineExceeded,
            Self::InvalidTask(msg) => FailureReason::InvalidTask(msg.clone()),
        }
    }
}

/// Errors delivered to a task's submitter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error("Task {task_id} failed on {agent_id}: {reason}")]
    ExecutionFailed {
        task_id: TaskId,
        agent_id: AgentId,
        reason: FailureReason,
    },

    #[error("Task {0} was cancelled")]
    Cancelled(TaskId),

    #[error("Task {0} cannot be cancelled in its current state")]
    NotCancellable(TaskId),

    #[error("Runtime is shutting down")]
    ShuttingDown,
}

impl TaskError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Scheduling(err) => err.reason(),
            Self::ExecutionFailed { reason, .. } => reason.clone(),
            Self::Cancelled(_) | Self::NotCancellable(_) => FailureReason::Cancelled,
            Self::ShuttingDown => FailureReason::ShuttingDown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Scheduling(err) if err.is_retryable())
    }
}

/// Errors from the collaborative learning engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LearningError {
    #[error("Invalid {name}: {value}. Must be between 0 and 100")]
    InvalidRate { name: &'static str, value: f64 },

    #[error("Invalid {name}: {value}. Must be a finite number")]
    NonFinite { name: &'static str, value: f64 },

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),
}

/// Errors from snapshot encoding, decoding and storage.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Unsupported snapshot schema version {found} (expected {expected})")]
    UnsupportedSchema { found: u32, expected: u32 },

    #[error("Failed to encode snapshot: {0}")]
    Encode(String),

    #[error("Failed to decode snapshot: {0}")]
    Decode(String),

    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SchedulingResult<T> = Result<T, SchedulingError>;
