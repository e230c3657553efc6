//! Queue errors.

use thiserror::Error;

use crate::task::TaskState;

#[derive(Debug, Error)]
pub enum QueueError {
    /// No record exists for the task id.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A state change would move a task backwards or out of a terminal state.
    #[error("task {task_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    /// Queue messages carry small arguments only; bulk configuration goes
    /// through the config broker.
    #[error(
        "job arguments are {size} bytes, limit is {limit}; \
         pass large configuration through the config broker"
    )]
    ArgsTooLarge { size: usize, limit: usize },

    /// The job configuration payload is unusable.
    #[error("invalid job configuration: {0}")]
    InvalidConfig(String),

    /// The config broker could not be read or written.
    #[error("config broker error: {0}")]
    Broker(String),

    /// The queue / result backend failed.
    #[error("task backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
