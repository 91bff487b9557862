//! Error types for workflow orchestration
//!
//! Every failure maps onto an [`ErrorCode`] so that callers on the other
//! side of the HTTP boundary can tell a rejected report (resynchronize) from
//! an unavailable store (retry with backoff).

use anvil_crd::CrdError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from storage backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed
    #[error("version conflict on workflow {workflow_id}: expected {expected}")]
    Conflict { workflow_id: String, expected: u64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("lock poisoned: {0}")]
    Lock(String),
}

/// Error classification shared by the server and its clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or malformed input; never retried
    InvalidArgument,
    /// Report does not match the expected next action
    FailedPrecondition,
    /// Referenced entity does not exist
    NotFound,
    /// Concurrent modification could not be resolved
    Aborted,
    /// Store or network failure; retried with backoff
    Unavailable,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// HTTP status used for the code
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::InvalidArgument => 400,
            ErrorCode::FailedPrecondition => 412,
            ErrorCode::NotFound => 404,
            ErrorCode::Aborted => 409,
            ErrorCode::Unavailable => 503,
            ErrorCode::Internal => 500,
        }
    }

    /// Code for an HTTP error status without a readable body
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 | 422 => ErrorCode::InvalidArgument,
            412 => ErrorCode::FailedPrecondition,
            404 => ErrorCode::NotFound,
            409 => ErrorCode::Aborted,
            502..=504 => ErrorCode::Unavailable,
            _ => ErrorCode::Internal,
        }
    }
}

/// JSON body of every error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&WorkflowError> for ErrorBody {
    fn from(err: &WorkflowError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for orchestrator operations
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("hardware not found: {0}")]
    HardwareNotFound(String),

    #[error("data version {version} not found for workflow {workflow_id}")]
    DataNotFound { workflow_id: String, version: u32 },

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("template error: {0}")]
    Template(#[from] CrdError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

impl WorkflowError {
    /// Classify the error
    pub fn code(&self) -> ErrorCode {
        match self {
            WorkflowError::InvalidArgument(_) | WorkflowError::Template(_) => {
                ErrorCode::InvalidArgument
            }
            WorkflowError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            WorkflowError::NotFound(_)
            | WorkflowError::TemplateNotFound(_)
            | WorkflowError::HardwareNotFound(_)
            | WorkflowError::DataNotFound { .. } => ErrorCode::NotFound,
            WorkflowError::Aborted(_) => ErrorCode::Aborted,
            WorkflowError::Store(err) => match err {
                StoreError::NotFound(_) => ErrorCode::NotFound,
                StoreError::AlreadyExists(_) | StoreError::Conflict { .. } => ErrorCode::Aborted,
                StoreError::Database(_) | StoreError::Lock(_) => ErrorCode::Unavailable,
                StoreError::Serialization(_) => ErrorCode::Internal,
            },
        }
    }

    /// Whether a caller should retry the same request
    pub fn is_retriable(&self) -> bool {
        matches!(self.code(), ErrorCode::Unavailable | ErrorCode::Aborted)
    }
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, WorkflowError>;
