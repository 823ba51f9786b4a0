//! Error types for the job ledger and its collaborators.

use crate::job::JobStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, BatchError>;

/// Rejection of a job before it ever enters the ledger.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The input asset does not exist.
    #[error("Input asset not found: {}", .0.display())]
    MissingInput(PathBuf),

    /// The input asset exists but cannot be read.
    #[error("Input asset {} is not readable: {reason}", path.display())]
    UnreadableInput {
        /// Offending path
        path: PathBuf,
        /// Why it could not be read
        reason: String,
    },

    /// The instruction is empty or whitespace.
    #[error("Instruction must not be empty")]
    EmptyInstruction,

    /// Priority outside 1-5.
    #[error("Priority {0} is outside the range 1-5")]
    InvalidPriority(u8),

    /// Backend not in the configured allowlist.
    #[error("Unknown backend '{0}'")]
    UnknownBackend(String),

    /// An extra parameter shadows a typed parameter.
    #[error("Parameter '{0}' must be set through its typed field")]
    ReservedParameter(String),
}

/// Failure reading or writing durable state.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem failure.
    #[error("IO error on {}: {source}", path.display())]
    Io {
        /// File being read or written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// Umbrella error for ledger operations.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Job rejected at admission.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Durable state could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// A state change the job state machine forbids.
    #[error("Invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        /// Job being transitioned
        job_id: String,
        /// Current status
        from: JobStatus,
        /// Requested status
        to: JobStatus,
    },

    /// Requeue attempted with no retries left.
    #[error("Job {job_id} has no retries left ({max_retries} allowed)")]
    RetriesExhausted {
        /// Job being requeued
        job_id: String,
        /// Retry allowance
        max_retries: u32,
    },

    /// No job with this id in the ledger.
    #[error("Job not found: {0}")]
    JobNotFound(String),
}
