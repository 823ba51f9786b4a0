//! Cost estimation and budget tracking.

pub mod budget;
pub mod estimator;
pub mod pricing;

pub use budget::{BudgetAlert, BudgetData, BudgetHealth, BudgetStatus, BudgetTracker, SpendingEntry};
pub use estimator::{
    BackendCost, BatchCostEstimate, CostEstimate, CostEstimator, CostSummary, DEFAULT_DURATION_SECS,
    ModelComparison, MonthlyProjection, QualityPreference,
};
pub use pricing::{ModelPricing, PricingTable, Quality};
