//! Error types for the queue engine

use thiserror::Error;

use crate::domain::OperationStatus;

/// Errors returned by the client API and the operation store
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("Operation not found: {0}")]
    NotFound(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Cannot {action} operation {id} while it is {status}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        status: OperationStatus,
    },

    #[error("Channel error")]
    ChannelError,

    #[error("Queue is shutting down")]
    ShuttingDown,
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Overall failure of one executor run
///
/// Recorded on the operation and fed to the retry policy; never returned to the submitter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Executor panicked: {0}")]
    Panicked(String),
}

impl From<std::io::Error> for ExecutionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
