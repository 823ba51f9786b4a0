//! Batch configuration file support.
//!
//! Configuration is layered: built-in defaults, then the global file
//! (`~/.clipforge/config.toml`), then the local file (`./.clipforgerc`), then
//! environment overrides. Later layers win key by key.

use crate::cost::{ModelPricing, PricingTable};
use crate::job::{DEFAULT_MAX_RETRIES, MAX_PRIORITY, MIN_PRIORITY};
use crate::progress::{StageSpec, default_stages};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable overriding `concurrency`.
pub const ENV_CONCURRENCY: &str = "CLIPFORGE_CONCURRENCY";
/// Environment variable overriding `ledger_path`.
pub const ENV_LEDGER: &str = "CLIPFORGE_LEDGER";
/// Environment variable overriding `auto_retry`.
pub const ENV_AUTO_RETRY: &str = "CLIPFORGE_AUTO_RETRY";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read or write a configuration file.
    #[error("Failed to access configuration file: {0}")]
    Io(String),

    /// Failed to parse configuration.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Backoff unit in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on one backoff in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { base_delay_ms: 1000, max_delay_ms: 30_000, multiplier: 2.0 }
    }
}

/// How bulk imports assign priorities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum PrioritySettings {
    /// Start high and drop one tier every `step_every` items.
    Decay {
        /// Priority of the first item
        start: u8,
        /// Items per tier
        step_every: usize,
        /// Lowest priority handed out
        floor: u8,
    },
    /// Every item gets the same priority.
    Fixed {
        /// Priority for every item
        priority: u8,
    },
}

impl Default for PrioritySettings {
    fn default() -> Self {
        Self::Decay { start: MAX_PRIORITY, step_every: 10, floor: MIN_PRIORITY }
    }
}

/// Batch scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Worker slots.
    pub concurrency: usize,
    /// Retry transient failures.
    pub auto_retry: bool,
    /// Retry allowance for new jobs.
    pub max_retries: u32,
    /// Backoff settings.
    pub retry: RetrySettings,
    /// Ledger file; defaults to `~/.clipforge/batch_ledger.json`.
    pub ledger_path: Option<PathBuf>,
    /// Budget file; defaults to `~/.clipforge/budget.json`.
    pub budget_path: Option<PathBuf>,
    /// Per-job timeout in seconds.
    pub job_timeout_secs: Option<u64>,
    /// Accepted backends; empty accepts any.
    pub known_backends: Vec<String>,
    /// Bulk import priorities.
    pub priority: PrioritySettings,
    /// Progress stage plan.
    pub stages: Vec<StageSpec>,
    /// Pricing overrides and additions.
    pub pricing: BTreeMap<String, ModelPricing>,
    /// Broadcast buffer for event subscribers.
    pub event_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            auto_retry: true,
            max_retries: DEFAULT_MAX_RETRIES,
            retry: RetrySettings::default(),
            ledger_path: None,
            budget_path: None,
            job_timeout_secs: None,
            known_backends: Vec::new(),
            priority: PrioritySettings::default(),
            stages: default_stages(),
            pricing: BTreeMap::new(),
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

fn read_table(path: &Path) -> ConfigResult<toml::Table> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
    content.parse::<toml::Table>().map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))
}

impl BatchConfig {
    /// Parses configuration from TOML text.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Self::load_layered(&[path.to_path_buf()])
    }

    /// Loads and merges the given files in order; missing files are skipped.
    pub fn load_layered(paths: &[PathBuf]) -> ConfigResult<Self> {
        let mut merged = toml::Table::new();
        for path in paths {
            match read_table(path) {
                Ok(table) => {
                    debug!(path = %path.display(), "Loaded configuration layer");
                    merge_tables(&mut merged, table);
                }
                Err(ConfigError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let config = toml::Value::Table(merged)
            .try_into::<Self>()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(format!("Failed to serialize: {}", e)))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(format!("Failed to create directory: {}", e)))?;
        }

        std::fs::write(path, content)
            .map_err(|e| ConfigError::Io(format!("Failed to write file: {}", e)))
    }

    /// Directory holding global state.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".clipforge")
    }

    /// Get default global configuration file path.
    pub fn default_global_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get default local configuration file path.
    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".clipforgerc")
    }

    /// Discover and load configuration files, then apply environment overrides.
    ///
    /// Loads configuration from:
    /// 1. Global config (~/.clipforge/config.toml)
    /// 2. Local config (./.clipforgerc)
    ///
    /// Local config overrides global config. A broken file is logged and the
    /// defaults are used instead.
    pub fn discover_and_load() -> Self {
        let layers = [Self::default_global_path(), Self::default_local_path()];
        let mut config = Self::load_layered(&layers).unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring configuration files");
            Self::default()
        });

        if let Err(e) = config.apply_env_overrides(|key| std::env::var(key).ok()) {
            warn!(error = %e, "Ignoring invalid environment override");
        }
        config
    }

    /// Applies `CLIPFORGE_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<()> {
        if let Some(value) = lookup(ENV_CONCURRENCY) {
            self.concurrency = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("{}={}", ENV_CONCURRENCY, value)))?;
        }
        if let Some(value) = lookup(ENV_LEDGER) {
            self.ledger_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_AUTO_RETRY) {
            self.auto_retry = match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue(format!("{}={}", ENV_AUTO_RETRY, value)));
                }
            };
        }
        self.validate()
    }

    /// Checks value ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue("concurrency must be at least 1".to_string()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue("retry.multiplier must be at least 1.0".to_string()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidValue(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        let valid_priority = |p: u8| (MIN_PRIORITY..=MAX_PRIORITY).contains(&p);
        match &self.priority {
            PrioritySettings::Decay { start, step_every, floor } => {
                if !valid_priority(*start) || !valid_priority(*floor) || floor > start || *step_every == 0
                {
                    return Err(ConfigError::InvalidValue(
                        "priority decay needs 1 <= floor <= start <= 5 and step_every >= 1".to_string(),
                    ));
                }
            }
            PrioritySettings::Fixed { priority } => {
                if !valid_priority(*priority) {
                    return Err(ConfigError::InvalidValue(format!(
                        "fixed priority {} is outside 1-5",
                        priority
                    )));
                }
            }
        }
        if self.stages.is_empty() {
            return Err(ConfigError::InvalidValue("at least one progress stage is required".to_string()));
        }
        if let Some((backend, _)) = self.pricing.iter().find(|(_, p)| p.cost_per_second < 0.0) {
            return Err(ConfigError::InvalidValue(format!("negative price for '{}'", backend)));
        }
        Ok(())
    }

    /// Retry policy built from these settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            self.retry.multiplier,
        )
        .with_enabled(self.auto_retry)
    }

    /// Built-in pricing with this config's overrides.
    pub fn pricing_table(&self) -> PricingTable {
        PricingTable::builtin().with_overrides(&self.pricing)
    }

    /// Resolved ledger path.
    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path.clone().unwrap_or_else(|| Self::home_dir().join("batch_ledger.json"))
    }

    /// Resolved budget path.
    pub fn budget_path(&self) -> PathBuf {
        self.budget_path.clone().unwrap_or_else(|| Self::home_dir().join("budget.json"))
    }

    /// Per-job timeout, if configured.
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.concurrency, 3);
        assert!(config.auto_retry);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.stages.len(), 5);
        let policy = config.retry_policy();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!(config.ledger_path().ends_with(".clipforge/batch_ledger.json"));
    }

    #[test]
    fn test_parse_partial_file() {
        let config = BatchConfig::parse(
            r#"
            concurrency = 5
            known_backends = ["haiper_20"]

            [retry]
            base_delay_ms = 250

            [priority]
            strategy = "fixed"
            priority = 4

            [pricing.inhouse]
            name = "In-house"
            cost_per_second = 0.01
            max_duration_secs = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.concurrency, 5);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.priority, PrioritySettings::Fixed { priority: 4 });
        assert!(config.pricing_table().get("inhouse").is_some());
        assert!(config.pricing_table().get("haiper_20").is_some());
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(BatchConfig::parse("concurrency = 0"), Err(ConfigError::InvalidValue(_))));
        assert!(matches!(
            BatchConfig::parse("[priority]\nstrategy = \"fixed\"\npriority = 9"),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(BatchConfig::parse("concurrency = \"many\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_layered_local_overrides_global() {
        let dir = TempDir::new().unwrap();
        let global = dir.path().join("global.toml");
        let local = dir.path().join("local.toml");
        std::fs::write(&global, "concurrency = 2\n[retry]\nbase_delay_ms = 500\nmax_delay_ms = 5000\n").unwrap();
        std::fs::write(&local, "[retry]\nbase_delay_ms = 100\n").unwrap();

        let config = BatchConfig::load_layered(&[global, local, dir.path().join("missing.toml")]).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.retry.max_delay_ms, 5000);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> =
            HashMap::from([(ENV_CONCURRENCY, "7"), (ENV_AUTO_RETRY, "off"), (ENV_LEDGER, "/tmp/l.json")]);
        let mut config = BatchConfig::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| (*v).to_string())).unwrap();
        assert_eq!(config.concurrency, 7);
        assert!(!config.auto_retry);
        assert!(!config.retry_policy().enabled);
        assert_eq!(config.ledger_path(), PathBuf::from("/tmp/l.json"));

        let mut config = BatchConfig::default();
        let result = config.apply_env_overrides(|key| (key == ENV_CONCURRENCY).then(|| "0".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = BatchConfig::default();
        config.concurrency = 6;
        config.job_timeout_secs = Some(120);
        config.save_to_file(&path).unwrap();

        let loaded = BatchConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(matches!(
            BatchConfig::load_from_file(&dir.path().join("nope.toml")),
            Err(ConfigError::NotFound(_))
        ));
    }
}
