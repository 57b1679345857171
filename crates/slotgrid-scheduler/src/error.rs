//! Scheduler error types.

use slotgrid_core::{AllocationState, ValidationError};
use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid task spec: {}", join_errors(.0))]
    InvalidSpec(Vec<ValidationError>),

    #[error("task needs {requested} slots but pool {pool} has {capacity}")]
    Unsatisfiable {
        pool: String,
        requested: u64,
        capacity: u64,
    },

    #[error("unknown pool: {0}")]
    UnknownPool(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task already finished: {0}")]
    Finished(String),

    #[error("registry changed since pass was planned (planned at {planned}, now {current})")]
    StaleDecision { planned: u64, current: u64 },

    /// An attempt failed and the task went back to the queue.
    #[error("task {task_id} attempt {attempt} failed, retrying in {retry_in_ms}ms: {reason}")]
    TransientAgentFailure {
        task_id: String,
        attempt: u32,
        retry_in_ms: u64,
        reason: String,
    },

    /// The retry budget ran out.
    #[error("task {task_id} failed permanently after {attempts} attempts: {reason}")]
    PermanentTaskFailure {
        task_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("allocation {allocation_id}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        allocation_id: String,
        from: AllocationState,
        to: AllocationState,
    },

    #[error("pool {0} is not running")]
    PoolStopped(String),

    #[error("registry error: {0}")]
    Registry(#[from] slotgrid_registry::RegistryError),

    #[error("queue error: {0}")]
    Queue(#[from] slotgrid_placement::QueueError),

    #[error("state store error: {0}")]
    State(#[from] slotgrid_state::StateError),

    #[error("config error: {0}")]
    Config(#[from] slotgrid_core::ConfigError),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_messages_name_task_and_reason() {
        let transient = SchedulerError::TransientAgentFailure {
            task_id: "task-1".to_string(),
            attempt: 2,
            retry_in_ms: 2_000,
            reason: "agent a lost".to_string(),
        };
        assert_eq!(
            transient.to_string(),
            "task task-1 attempt 2 failed, retrying in 2000ms: agent a lost"
        );
        let permanent = SchedulerError::PermanentTaskFailure {
            task_id: "task-1".to_string(),
            attempts: 3,
            reason: "start timed out".to_string(),
        };
        assert_eq!(
            permanent.to_string(),
            "task task-1 failed permanently after 3 attempts: start timed out"
        );
    }
}
