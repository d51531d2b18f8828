//! SAI error types for the BFD offload calls.

use thiserror::Error;

/// Error type for SAI operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaiError {
    /// The adapter does not know the object the call names.
    #[error("Item not found: {item}")]
    NotFound { item: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SaiError {
    pub fn not_found(item: impl Into<String>) -> Self {
        SaiError::NotFound { item: item.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SaiError::Internal {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SaiError::NotFound { .. })
    }
}

/// Result type for SAI operations.
pub type SaiResult<T> = Result<T, SaiError>;
