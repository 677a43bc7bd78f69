use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("queue full: {queued} queued (max {max})")]
    QueueFull { queued: usize, max: usize },

    #[error("queue is not running")]
    NotRunning,

    #[error("unknown task handler: {0}")]
    UnknownHandler(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("task cancelled")]
    Cancelled,

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<TaskError> for reef_core::ReefError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::QueueFull { queued, max } => reef_core::ReefError::QueueFull { queued, max },
            TaskError::Cancelled => reef_core::ReefError::Cancelled,
            TaskError::NotFound(id) => reef_core::ReefError::NotFound(format!("task {}", id)),
            other => reef_core::ReefError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
