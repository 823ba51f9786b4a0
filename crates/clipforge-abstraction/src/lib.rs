//! Generator abstraction layer for clipforge.
//!
//! This module defines the boundary between the job scheduler and whatever
//! performs the actual remote generation call. The scheduler only ever sees
//! the [`Generator`] trait, the request it hands over, and the error
//! taxonomy it gets back.

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use mock::{MockGenerator, MockOutcome};

/// Represents an error that can occur while a generator works on a job.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationError {
    /// A failure worth retrying (network hiccup, rate limit, 5xx-like response).
    #[error("Transient generation error: {0}")]
    Transient(String),

    /// A failure that will not go away on retry (rejected input, bad parameters).
    #[error("Permanent generation error: {0}")]
    Permanent(String),

    /// The generator did not answer within the job timeout.
    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    /// The job was cancelled while the generator was running.
    #[error("Generation cancelled")]
    Cancelled,
}

impl GenerationError {
    /// Builds a transient error from anything displayable.
    pub fn transient(message: impl std::fmt::Display) -> Self {
        Self::Transient(message.to_string())
    }

    /// Builds a permanent error from anything displayable.
    pub fn permanent(message: impl std::fmt::Display) -> Self {
        Self::Permanent(message.to_string())
    }

    /// Whether a retry policy may schedule another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Typed generation parameters plus opaque extras.
///
/// Unknown keys are kept in `extra` and flattened back on serialization so a
/// ledger written by a newer adapter survives a round-trip through an older one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    /// Requested clip length in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,

    /// Output aspect ratio such as "16:9".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,

    /// Things the backend should avoid generating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,

    /// Classifier-free guidance strength.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f64>,

    /// Per-job timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Backend specific keys the scheduler does not interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Keys owned by the typed fields of [`GenerationParameters`].
///
/// An extra under one of these names would be flattened over the typed field
/// when serialized and could no longer be read back.
pub const RESERVED_PARAMETER_KEYS: [&str; 5] =
    ["duration_secs", "aspect_ratio", "negative_prompt", "guidance_scale", "timeout_secs"];

/// A parameter value that does not fit its typed field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid value for parameter '{key}': {reason}")]
pub struct ParameterError {
    /// Parameter name
    pub key: String,
    /// Why the value was refused
    pub reason: String,
}

fn typed_value<T: serde::de::DeserializeOwned>(key: &str, value: Value) -> Result<T, ParameterError> {
    serde_json::from_value(value)
        .map_err(|e| ParameterError { key: key.to_string(), reason: e.to_string() })
}

impl GenerationParameters {
    /// Sets a parameter by name.
    ///
    /// Names of typed fields are routed to that field and the value must fit
    /// its type. Any other name lands in `extra`.
    pub fn insert_extra(&mut self, key: impl Into<String>, value: Value) -> Result<(), ParameterError> {
        let key = key.into();
        match key.as_str() {
            "duration_secs" => self.duration_secs = Some(typed_value(&key, value)?),
            "aspect_ratio" => self.aspect_ratio = Some(typed_value(&key, value)?),
            "negative_prompt" => self.negative_prompt = Some(typed_value(&key, value)?),
            "guidance_scale" => self.guidance_scale = Some(typed_value(&key, value)?),
            "timeout_secs" => self.timeout_secs = Some(typed_value(&key, value)?),
            _ => {
                self.extra.insert(key, value);
            }
        }
        Ok(())
    }

    /// Extras whose names clash with a typed field.
    pub fn reserved_extra_keys(&self) -> impl Iterator<Item = &str> {
        self.extra
            .keys()
            .map(String::as_str)
            .filter(|key| RESERVED_PARAMETER_KEYS.contains(key))
    }

    /// Returns these parameters layered over `shared`.
    ///
    /// Fields set on `self` win; unset fields fall back to `shared`. Extras are
    /// merged key by key with the same precedence.
    #[must_use]
    pub fn merged_over(&self, shared: &GenerationParameters) -> GenerationParameters {
        let mut extra = shared.extra.clone();
        extra.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));

        GenerationParameters {
            duration_secs: self.duration_secs.or(shared.duration_secs),
            aspect_ratio: self.aspect_ratio.clone().or_else(|| shared.aspect_ratio.clone()),
            negative_prompt: self
                .negative_prompt
                .clone()
                .or_else(|| shared.negative_prompt.clone()),
            guidance_scale: self.guidance_scale.or(shared.guidance_scale),
            timeout_secs: self.timeout_secs.or(shared.timeout_secs),
            extra,
        }
    }
}

/// Everything a generator needs to work on one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Ledger id of the job, useful for correlating adapter logs.
    pub job_id: String,
    /// Source asset.
    pub input_ref: PathBuf,
    /// Free-text instruction for the backend.
    pub instruction: String,
    /// Backend/model identifier.
    pub backend: String,
    /// Generation parameters.
    pub parameters: GenerationParameters,
}

/// What a generator hands back on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Opaque success payload stored on the job.
    pub payload: Value,
    /// Files produced by the generator, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_paths: Vec<PathBuf>,
    /// Cost actually charged, when the backend reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_cost: Option<f64>,
}

/// Receives progress from a running generator.
///
/// Implementations must be cheap and non-blocking; they are called from the
/// generator's own task.
pub trait ProgressSink: Send + Sync {
    /// The job entered the named stage.
    fn stage(&self, job_id: &str, stage: &str, message: &str);

    /// Fraction of the job completed, in `0.0..=1.0`.
    fn fraction(&self, job_id: &str, fraction: f64, message: &str);

    /// A free-text status line from the backend.
    fn log(&self, job_id: &str, message: &str);
}

/// Progress sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn stage(&self, _job_id: &str, _stage: &str, _message: &str) {}
    fn fraction(&self, _job_id: &str, _fraction: f64, _message: &str) {}
    fn log(&self, _job_id: &str, _message: &str) {}
}

/// Per-execution context passed to [`Generator::generate`].
#[derive(Clone)]
pub struct GenerationContext {
    job_id: String,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressSink>,
}

impl GenerationContext {
    /// Creates a context for one execution of `job_id`.
    pub fn new(
        job_id: impl Into<String>,
        cancel: CancellationToken,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self { job_id: job_id.into(), cancel, progress }
    }

    /// A context with a fresh token and no progress reporting.
    pub fn detached(job_id: impl Into<String>) -> Self {
        Self::new(job_id, CancellationToken::new(), Arc::new(NoopProgressSink))
    }

    /// Token fired when the job is cancelled.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reports entering `stage`.
    pub fn report_stage(&self, stage: &str, message: &str) {
        self.progress.stage(&self.job_id, stage, message);
    }

    /// Reports fractional progress.
    pub fn report_fraction(&self, fraction: f64, message: &str) {
        self.progress.fraction(&self.job_id, fraction, message);
    }

    /// Forwards a backend status line.
    pub fn report_log(&self, message: &str) {
        self.progress.log(&self.job_id, message);
    }
}

impl std::fmt::Debug for GenerationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationContext")
            .field("job_id", &self.job_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A trait for anything that can perform a generation call.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Short adapter name used in logs and reports.
    fn name(&self) -> &str;

    /// Performs the generation for one job.
    ///
    /// # Arguments
    /// * `request` - The job data
    /// * `context` - Cancellation token and progress reporting for this execution
    ///
    /// # Returns
    /// The generator output, or a classified [`GenerationError`].
    async fn generate(
        &self,
        request: &GenerationRequest,
        context: &GenerationContext,
    ) -> Result<GenerationOutput, GenerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retryable_classification() {
        assert!(GenerationError::transient("503").is_retryable());
        assert!(GenerationError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!GenerationError::permanent("bad input").is_retryable());
        assert!(!GenerationError::Cancelled.is_retryable());
    }

    #[test]
    fn test_parameters_merge_prefers_own_fields() {
        let mut shared = GenerationParameters {
            duration_secs: Some(5),
            aspect_ratio: Some("16:9".to_string()),
            ..Default::default()
        };
        shared.extra.insert("seed".to_string(), json!(1));
        shared.extra.insert("style".to_string(), json!("noir"));

        let mut own = GenerationParameters { duration_secs: Some(10), ..Default::default() };
        own.extra.insert("seed".to_string(), json!(42));

        let merged = own.merged_over(&shared);
        assert_eq!(merged.duration_secs, Some(10));
        assert_eq!(merged.aspect_ratio.as_deref(), Some("16:9"));
        assert_eq!(merged.extra["seed"], json!(42));
        assert_eq!(merged.extra["style"], json!("noir"));
    }

    #[test]
    fn test_parameters_keep_unknown_keys() {
        let raw = json!({"duration_secs": 8, "camera": {"pan": "left"}});
        let params: GenerationParameters = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(params.duration_secs, Some(8));
        assert_eq!(params.extra["camera"], json!({"pan": "left"}));
        assert_eq!(serde_json::to_value(&params).unwrap(), raw);
    }

    #[test]
    fn test_insert_extra_routes_typed_keys() {
        let mut params = GenerationParameters::default();
        params.insert_extra("duration_secs", json!(10)).unwrap();
        params.insert_extra("aspect_ratio", json!("9:16")).unwrap();
        params.insert_extra("seed", json!(7)).unwrap();

        assert_eq!(params.duration_secs, Some(10));
        assert_eq!(params.aspect_ratio.as_deref(), Some("9:16"));
        assert_eq!(params.extra.len(), 1);
        assert_eq!(params.reserved_extra_keys().count(), 0);

        let err = params.insert_extra("duration_secs", json!("ten")).unwrap_err();
        assert_eq!(err.key, "duration_secs");
        assert_eq!(params.duration_secs, Some(10));
        assert!(!params.extra.contains_key("duration_secs"));
    }

    #[test]
    fn test_reserved_extra_keys_are_reported() {
        let mut params = GenerationParameters::default();
        params.extra.insert("timeout_secs".to_string(), json!("soon"));
        params.extra.insert("seed".to_string(), json!(1));
        assert_eq!(params.reserved_extra_keys().collect::<Vec<_>>(), vec!["timeout_secs"]);
    }

    #[test]
    fn test_detached_context_reports_nowhere() {
        let ctx = GenerationContext::detached("job-1");
        ctx.report_stage("upload", "uploading");
        ctx.report_fraction(0.5, "half");
        assert!(!ctx.is_cancelled());
        ctx.cancel_token().cancel();
        assert!(ctx.is_cancelled());
    }
}
