use std::time::Duration;
use thiserror::Error;

/// Errors returned by the pool API itself.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum PoolError {
    #[error("no task handler configured")]
    MissingHandler,

    #[error("pool must be created inside a tokio runtime")]
    NoRuntime,

    #[error("invalid pool config: {0}")]
    InvalidConfig(String),

    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("pool is shut down")]
    Closed,

    #[error("no queue room within {0:?}")]
    SubmitTimeout(Duration),
}

impl PoolError {
    /// Short snake_case label for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            PoolError::MissingHandler => "pool_missing_handler",
            PoolError::NoRuntime => "pool_no_runtime",
            PoolError::InvalidConfig(_) => "pool_invalid_config",
            PoolError::QueueFull { .. } => "pool_queue_full",
            PoolError::Closed => "pool_closed",
            PoolError::SubmitTimeout(_) => "pool_submit_timeout",
        }
    }
}

/// Errors delivered to the caller through a task's [`Completion`](crate::handle::Completion).
#[derive(Debug, Error, PartialEq, PartialOrd, Eq, Ord, Clone)]
pub enum TaskError {
    #[error("handler panicked: {0}")]
    Panic(String),

    #[error("handler exceeded {0:?}")]
    Timeout(Duration),

    #[error("handler returned without responding")]
    NoResponse,

    #[error("task rejected by a full queue")]
    Rejected,

    #[error("task dropped from a full queue")]
    Dropped,

    #[error("pool shut down before the task ran")]
    Shutdown,

    #[error("task abandoned without a result")]
    Abandoned,
}

impl TaskError {
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Panic(_) => "task_panic",
            TaskError::Timeout(_) => "task_timeout",
            TaskError::NoResponse => "task_no_response",
            TaskError::Rejected => "task_rejected",
            TaskError::Dropped => "task_dropped",
            TaskError::Shutdown => "task_shutdown",
            TaskError::Abandoned => "task_abandoned",
        }
    }
}
