//! Batch orchestration for clipforge.
//!
//! [`BatchOrchestrator`] admits jobs into the ledger and drains them through a
//! [`Generator`](clipforge_abstraction::Generator) with at most N jobs in
//! flight. Failed attempts go through the retry policy; every transition is
//! persisted and published as a [`JobEvent`](clipforge_core::JobEvent).

pub mod error;
pub mod orchestrator;
pub mod priority;
pub mod report;
pub mod scheduler;
pub mod state;

pub use error::{OrchestrationError, Result};
pub use orchestrator::{
    BatchOrchestrator, BatchOrchestratorBuilder, BulkAddOptions, BulkAddOutcome, CANCELLED_BY_REQUEST,
};
pub use priority::PriorityStrategy;
pub use report::{BatchReport, JobFailure};
pub use scheduler::{CANCELLED_WHILE_RUNNING, CancelRegistry, Scheduler, SchedulerConfig};
pub use state::LedgerState;
