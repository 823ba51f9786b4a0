//! Configuration loading and orchestrator wiring for the CLI.

use anyhow::{Context, bail};
use clipforge_abstraction::Generator;
use clipforge_core::{BatchConfig, BudgetTracker, JsonLedgerStore, LedgerStore, MemoryLedgerStore};
use clipforge_orchestrator::BatchOrchestrator;
use std::path::PathBuf;
use std::sync::Arc;

/// Global flags shared by every command.
#[derive(Debug, Clone)]
pub struct CliOptions {
    /// Explicit configuration file
    pub config: Option<PathBuf>,
    /// Ledger path override
    pub ledger: Option<PathBuf>,
    /// Never write to disk
    pub no_persist: bool,
    /// Machine-readable output
    pub json: bool,
}

/// Load and merge configuration.
///
/// Configuration precedence:
/// 1. CLI arguments (`--ledger`)
/// 2. Environment variables (`CLIPFORGE_*`)
/// 3. Explicit file (`--config`)
/// 4. Local config file (./.clipforgerc)
/// 5. Global config file (~/.clipforge/config.toml)
/// 6. Defaults
pub fn load_config(options: &CliOptions) -> anyhow::Result<BatchConfig> {
    let mut config = match &options.config {
        Some(path) => {
            if !path.exists() {
                bail!("Configuration file not found: {}", path.display());
            }
            let layers = [BatchConfig::default_global_path(), BatchConfig::default_local_path(), path.clone()];
            let mut config = BatchConfig::load_layered(&layers)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
            config
                .apply_env_overrides(|key| std::env::var(key).ok())
                .context("Invalid environment override")?;
            config
        }
        None => BatchConfig::discover_and_load(),
    };

    if let Some(ledger) = &options.ledger {
        config.ledger_path = Some(ledger.clone());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Ledger store for these options.
///
/// With `--no-persist` the file is read once and changes stay in memory.
fn ledger_store(options: &CliOptions, config: &BatchConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    let file = JsonLedgerStore::new(config.ledger_path());
    if options.no_persist {
        let ledger = file.load().context("Failed to read ledger")?;
        return Ok(Arc::new(MemoryLedgerStore::with_ledger(ledger)));
    }
    Ok(Arc::new(file))
}

/// Budget tracker for these options.
pub fn budget_tracker(options: &CliOptions, config: &BatchConfig) -> BudgetTracker {
    if options.no_persist {
        BudgetTracker::in_memory()
    } else {
        BudgetTracker::load(config.budget_path())
    }
}

/// Builds an orchestrator, optionally able to run jobs.
pub fn build_orchestrator(
    options: &CliOptions,
    config: BatchConfig,
    generator: Option<Arc<dyn Generator>>,
    budget: Option<Arc<BudgetTracker>>,
) -> anyhow::Result<BatchOrchestrator> {
    let mut builder = BatchOrchestrator::builder(config.clone()).store(ledger_store(options, &config)?);
    if let Some(generator) = generator {
        builder = builder.generator(generator);
    }
    if let Some(budget) = budget {
        builder = builder.budget(budget);
    }
    builder.build().context("Failed to open the job queue")
}
