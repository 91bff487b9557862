//! Error types for the container runtime

use thiserror::Error;

/// Error type for container operations
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A required identifier, name or handle was empty or malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine failed while performing an operation
    #[error("{operation} failed: {message}")]
    Engine {
        operation: &'static str,
        message: String,
    },

    /// Container does not exist
    #[error("container not found: {0}")]
    NotFound(String),

    /// I/O error talking to the engine
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Wrap an engine failure with the operation name
    pub fn engine(operation: &'static str, message: impl Into<String>) -> Self {
        RuntimeError::Engine {
            operation,
            message: message.into(),
        }
    }
}

/// Result type for container operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
