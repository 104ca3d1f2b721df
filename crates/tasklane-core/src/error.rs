use crate::{JobId, QueueName};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Queue {0} is not registered")]
    QueueNotRegistered(QueueName),

    #[error("Queue {0} registered more than once")]
    DuplicateQueue(QueueName),

    #[error("Queue {0} must have a concurrency of at least 1")]
    InvalidConcurrency(QueueName),

    #[error("Unknown task name `{task_name}` for queue {queue}")]
    UnknownTaskName { queue: QueueName, task_name: String },

    #[error("Invalid payload for task `{task_name}`: {source}")]
    InvalidPayload {
        task_name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Retention of {secs} seconds exceeds the maximum of {max} seconds")]
    InvalidRetention { secs: u64, max: u64 },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job in invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, TaskError>;
