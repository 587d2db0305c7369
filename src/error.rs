use thiserror::Error;

use crate::models::{EndpointId, EndpointState};

/// Unified error type for the pool
#[derive(Error, Debug)]
pub enum PoolError {
    // Registry errors
    #[error("Endpoint already registered: {id}")]
    DuplicateEndpoint { id: EndpointId },

    #[error("Endpoint not found: {id}")]
    NotFound { id: EndpointId },

    #[error("Invalid state transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: EndpointId,
        from: EndpointState,
        to: EndpointState,
    },

    // Probe errors
    #[error("Operation timed out")]
    Timeout,

    // Selection errors
    #[error("No healthy endpoints available")]
    PoolExhausted,

    // Collaborator errors
    #[error("Record store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Endpoint configuration errors
    #[error("Invalid endpoint address: {0}")]
    InvalidEndpointAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::PoolExhausted | PoolError::StorageUnavailable(_) | PoolError::Timeout
        )
    }

    /// Errors that indicate a bug rather than a runtime condition
    pub fn is_programming_error(&self) -> bool {
        matches!(self, PoolError::InvalidTransition { .. })
    }

    /// Collapse collaborator failures into `StorageUnavailable`
    pub fn into_storage(self) -> Self {
        match self {
            PoolError::StorageUnavailable(_) => self,
            other => PoolError::StorageUnavailable(other.to_string()),
        }
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for PoolError {
    fn from(err: url::ParseError) -> Self {
        PoolError::InvalidEndpointAddress(err.to_string())
    }
}
