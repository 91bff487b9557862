//! Error types for CRD operations

use thiserror::Error;

/// Errors that can occur when parsing, rendering or validating resources
#[derive(Debug, Error)]
pub enum CrdError {
    /// Invalid MAC address format
    #[error("Invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    /// Invalid IP address format
    #[error("Invalid IP address format: {0}")]
    InvalidIpAddress(String),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Invalid field value
    #[error("Invalid value for field '{field}': {message}")]
    InvalidFieldValue { field: String, message: String },

    /// Two tasks (or two actions of one task) share a name
    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    /// Container image reference does not parse
    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidImage { reference: String, reason: String },

    /// Template placeholder with no value in the device map
    #[error("Unresolved template placeholder: {0}")]
    UnresolvedPlaceholder(String),

    /// Template document is not valid YAML or has unknown fields
    #[error("Invalid template document: {0}")]
    Document(#[from] serde_yaml::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type for CRD operations
pub type Result<T> = std::result::Result<T, CrdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CrdError::DuplicateName {
            kind: "task",
            name: "setup".to_string(),
        };
        assert_eq!(err.to_string(), "Duplicate task name: setup");

        let err = CrdError::InvalidImage {
            reference: "bad image!".to_string(),
            reason: "invalid reference format".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid image reference 'bad image!': invalid reference format"
        );
    }
}
