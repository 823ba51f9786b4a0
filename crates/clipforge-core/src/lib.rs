//! Core job model for clipforge.
//!
//! This crate holds everything about a batch of generation jobs that does not
//! need a runtime: the job state machine and ledger, durable storage, cost
//! estimation and budgets, retry decisions, staged progress, lifecycle events,
//! derived statistics and configuration. Scheduling lives in
//! `clipforge-orchestrator`.

pub mod config;
pub mod cost;
pub mod error;
pub mod events;
pub mod job;
pub mod progress;
pub mod retry;
pub mod stats;
pub mod storage;
pub mod validation;

pub use config::{BatchConfig, ConfigError, ConfigResult, PrioritySettings, RetrySettings};
pub use cost::{
    BackendCost, BatchCostEstimate, BudgetAlert, BudgetHealth, BudgetStatus, BudgetTracker, CostEstimate,
    CostEstimator, CostSummary, ModelComparison, ModelPricing, PricingTable, Quality,
    QualityPreference,
};
pub use error::{BatchError, PersistenceError, Result, ValidationError};
pub use events::{EventBus, JobEvent, JobObserver};
pub use job::{Job, JobRequest, JobStatus, Ledger};
pub use progress::{
    ProgressBoard, ProgressError, ProgressSnapshot, ProgressTracker, StageSpec, StageStatus,
    default_stages, format_duration, stage_hint,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use stats::{AggregateStats, TimeEstimate};
pub use storage::{JsonLedgerStore, LedgerStore, MemoryLedgerStore};
pub use validation::validate_request;
