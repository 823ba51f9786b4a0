//! Admission checks run before a job enters the ledger.

use crate::error::ValidationError;
use crate::job::{JobRequest, MAX_PRIORITY, MIN_PRIORITY};
use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;

/// Validates a job request.
///
/// # Arguments
/// * `request` - The request to check
/// * `known_backends` - Allowed backends; empty means any backend is accepted
pub fn validate_request(
    request: &JobRequest,
    known_backends: &[String],
) -> Result<(), ValidationError> {
    if request.instruction.trim().is_empty() {
        return Err(ValidationError::EmptyInstruction);
    }
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&request.priority) {
        return Err(ValidationError::InvalidPriority(request.priority));
    }
    if !known_backends.is_empty() && !known_backends.iter().any(|b| *b == request.backend) {
        return Err(ValidationError::UnknownBackend(request.backend.clone()));
    }
    if let Some(key) = request.parameters.reserved_extra_keys().next() {
        return Err(ValidationError::ReservedParameter(key.to_string()));
    }
    check_input_readable(&request.input_ref)
}

/// Checks that `path` names an existing, readable file.
pub fn check_input_readable(path: &Path) -> Result<(), ValidationError> {
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ValidationError::MissingInput(path.to_path_buf()),
        _ => ValidationError::UnreadableInput { path: path.to_path_buf(), reason: e.to_string() },
    })?;

    if metadata.is_dir() {
        return Err(ValidationError::UnreadableInput {
            path: path.to_path_buf(),
            reason: "is a directory".to_string(),
        });
    }

    File::open(path).map(|_| ()).map_err(|e| ValidationError::UnreadableInput {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
