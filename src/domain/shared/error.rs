//! Domain errors

use crate::domain::transport::TransportError;
use thiserror::Error;

/// Domain result type
pub type Result<T> = std::result::Result<T, DomainError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Transport engine has not been initialized
    #[error("Transport unavailable")]
    TransportUnavailable,

    /// Transport refused the join request
    #[error("Join rejected: {0}")]
    JoinRejected(String),

    /// Persisted call data could not be corroborated
    #[error("Stale channel data: {0}")]
    StaleChannelData(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TransportError> for DomainError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotInitialized => DomainError::TransportUnavailable,
            TransportError::Rejected { code } => {
                DomainError::JoinRejected(format!("transport code {}", code))
            }
            TransportError::NotInChannel => {
                DomainError::InvalidOperation("not in a channel".to_string())
            }
            TransportError::Failed(msg) => DomainError::Internal(msg),
        }
    }
}
