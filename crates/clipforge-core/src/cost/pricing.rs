//! Per-backend pricing table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Output quality class of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Acceptable output.
    Good,
    /// Sharp, consistent output.
    High,
    /// Very high fidelity.
    Premium,
    /// Best available.
    Ultra,
}

impl Quality {
    /// Points used for cost-per-quality ranking.
    pub fn score(self) -> f64 {
        match self {
            Quality::Good => 7.0,
            Quality::High => 8.0,
            Quality::Premium => 9.0,
            Quality::Ultra => 10.0,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Quality::Good => "Good",
            Quality::High => "High",
            Quality::Premium => "Premium",
            Quality::Ultra => "Ultra",
        };
        f.write_str(label)
    }
}

fn default_quality() -> Quality {
    Quality::Good
}

/// Price sheet for one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Display name.
    pub name: String,
    /// USD charged per generated second.
    pub cost_per_second: f64,
    /// Longest clip the backend produces.
    pub max_duration_secs: u32,
    /// Marketing tier.
    #[serde(default)]
    pub tier: String,
    /// Output quality class.
    #[serde(default = "default_quality")]
    pub quality: Quality,
    /// Value-for-money score, higher is better.
    #[serde(default)]
    pub efficiency_score: f64,
}

impl ModelPricing {
    fn builtin(
        name: &str,
        cost_per_second: f64,
        tier: &str,
        quality: Quality,
        efficiency_score: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            cost_per_second,
            max_duration_secs: 10,
            tier: tier.to_string(),
            quality,
            efficiency_score,
        }
    }
}

/// Pricing for every known backend, keyed by backend id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    models: BTreeMap<String, ModelPricing>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PricingTable {
    /// A table with no backend at all.
    pub fn empty() -> Self {
        Self { models: BTreeMap::new() }
    }

    /// The built-in rates for the supported video backends.
    pub fn builtin() -> Self {
        let mut luma = ModelPricing::builtin("Luma Dream Machine", 0.10, "Alternative", Quality::High, 8.0);
        luma.max_duration_secs = 9;

        let models = [
            ("kling_21_standard", ModelPricing::builtin("Kling 2.1 Standard", 0.05, "Standard", Quality::High, 9.5)),
            ("kling_21_pro", ModelPricing::builtin("Kling 2.1 Pro", 0.09, "Professional", Quality::Premium, 8.8)),
            ("kling_21_master", ModelPricing::builtin("Kling 2.1 Master", 0.14, "Premium", Quality::Ultra, 7.5)),
            ("kling_20_master", ModelPricing::builtin("Kling 2.0 Master", 0.28, "Legacy Premium", Quality::Premium, 6.0)),
            ("kling_16_pro", ModelPricing::builtin("Kling 1.6 Pro", 0.095, "Legacy", Quality::Good, 7.2)),
            ("luma_dream", luma),
            ("haiper_20", ModelPricing::builtin("Haiper 2.0", 0.04, "Budget", Quality::Good, 9.8)),
        ];

        Self { models: models.into_iter().map(|(k, v)| (k.to_string(), v)).collect() }
    }

    /// Pricing for `backend`, if known.
    pub fn get(&self, backend: &str) -> Option<&ModelPricing> {
        self.models.get(backend)
    }

    /// Adds or replaces one backend.
    pub fn insert(&mut self, backend: impl Into<String>, pricing: ModelPricing) {
        self.models.insert(backend.into(), pricing);
    }

    /// Applies overrides on top of this table; overrides win.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, ModelPricing>) -> Self {
        for (backend, pricing) in overrides {
            self.models.insert(backend.clone(), pricing.clone());
        }
        self
    }

    /// Known backend ids in name order.
    pub fn backends(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Backend ids with their pricing.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModelPricing)> {
        self.models.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of known backends.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether no backend is known.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_rates() {
        let table = PricingTable::builtin();
        assert_eq!(table.len(), 7);
        assert_eq!(table.get("kling_21_standard").unwrap().cost_per_second, 0.05);
        assert_eq!(table.get("luma_dream").unwrap().max_duration_secs, 9);
        assert_eq!(table.get("kling_21_master").unwrap().quality, Quality::Ultra);
        assert!(table.get("sora").is_none());
    }

    #[test]
    fn test_overrides_win() {
        let mut overrides = BTreeMap::new();
        let custom: ModelPricing = toml::from_str(
            r#"
            name = "In-house"
            cost_per_second = 0.01
            max_duration_secs = 30
            "#,
        )
        .unwrap();
        overrides.insert("inhouse".to_string(), custom);

        let table = PricingTable::builtin().with_overrides(&overrides);
        let inhouse = table.get("inhouse").unwrap();
        assert_eq!(inhouse.quality, Quality::Good);
        assert_eq!(inhouse.max_duration_secs, 30);
        assert_eq!(table.len(), 8);
    }
}
