//! Error types for the worker

use anvil_runtime::RuntimeError;
use anvil_workflow::{ErrorBody, ErrorCode, WorkflowError};
use thiserror::Error;

/// Errors raised while talking to the orchestrator or running actions
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The orchestrator rejected or failed the call
    #[error("{code}: {message}")]
    Rpc { code: ErrorCode, message: String },

    /// The orchestrator could not be reached
    #[error("transport error: {0}")]
    Transport(String),

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("data directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl WorkerError {
    /// Classification shared with the orchestrator
    pub fn code(&self) -> ErrorCode {
        match self {
            WorkerError::Rpc { code, .. } => *code,
            WorkerError::Transport(_) => ErrorCode::Unavailable,
            WorkerError::Runtime(_) | WorkerError::Io(_) => ErrorCode::Internal,
            WorkerError::Config(_) => ErrorCode::InvalidArgument,
        }
    }

    /// Worth retrying the same call after a backoff
    pub fn is_retriable(&self) -> bool {
        matches!(self.code(), ErrorCode::Unavailable | ErrorCode::Aborted)
    }

    /// The orchestrator refused a report; re-read the context before
    /// deciding what to do
    pub fn needs_resync(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::FailedPrecondition | ErrorCode::InvalidArgument
        )
    }
}

impl From<WorkflowError> for WorkerError {
    fn from(err: WorkflowError) -> Self {
        WorkerError::Rpc {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<ErrorBody> for WorkerError {
    fn from(body: ErrorBody) -> Self {
        WorkerError::Rpc {
            code: body.code,
            message: body.message,
        }
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            WorkerError::Rpc {
                code: ErrorCode::Internal,
                message: err.to_string(),
            }
        } else {
            WorkerError::Transport(err.to_string())
        }
    }
}

/// Result type for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;
