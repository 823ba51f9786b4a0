// Error types for orchestration

use clipforge_core::{BatchError, ConfigError, PersistenceError, ValidationError};
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Ledger operation failed
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// Configuration rejected at build time
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Concurrency limit of zero
    #[error("Concurrency limit must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    /// Run requested without a generator
    #[error("No generator configured")]
    NoGenerator,

    /// Worker task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl From<ValidationError> for OrchestrationError {
    fn from(error: ValidationError) -> Self {
        Self::Batch(BatchError::Validation(error))
    }
}

impl From<PersistenceError> for OrchestrationError {
    fn from(error: PersistenceError) -> Self {
        Self::Batch(BatchError::Persistence(error))
    }
}

impl OrchestrationError {
    /// The validation failure, if this is one.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Batch(BatchError::Validation(e)) => Some(e),
            _ => None,
        }
    }
}
