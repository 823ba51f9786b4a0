//! CLI command implementations.

pub mod add;
pub mod budget;
pub mod jobs;
pub mod pricing;
pub mod run;

use anyhow::{Context, bail};
use clap::Args;
use clipforge_abstraction::GenerationParameters;
use clipforge_core::JobStatus;
use serde_json::Value;

/// Generation parameters accepted by `add` and `import`.
#[derive(Args, Debug, Clone, Default)]
pub struct ParamArgs {
    /// Clip length in seconds
    #[arg(long)]
    pub duration: Option<u32>,

    /// Aspect ratio, e.g. 16:9
    #[arg(long)]
    pub aspect_ratio: Option<String>,

    /// What the clip should avoid
    #[arg(long)]
    pub negative_prompt: Option<String>,

    /// Prompt adherence
    #[arg(long)]
    pub guidance_scale: Option<f64>,

    /// Per-attempt timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Backend-specific parameter as key=value (value parsed as JSON when possible)
    #[arg(long = "param", value_name = "KEY=VALUE")]
    pub extra: Vec<String>,
}

impl ParamArgs {
    /// Converts the flags to typed parameters.
    ///
    /// `--param` may name a typed field; the dedicated flag wins when both are given.
    pub fn to_parameters(&self) -> anyhow::Result<GenerationParameters> {
        let mut parameters = GenerationParameters::default();
        for pair in &self.extra {
            let Some((key, raw)) = pair.split_once('=') else {
                bail!("Invalid --param '{}', expected KEY=VALUE", pair);
            };
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            parameters.insert_extra(key.trim(), value).context("Invalid --param")?;
        }
        parameters.duration_secs = self.duration.or(parameters.duration_secs);
        parameters.aspect_ratio = self.aspect_ratio.clone().or(parameters.aspect_ratio);
        parameters.negative_prompt = self.negative_prompt.clone().or(parameters.negative_prompt);
        parameters.guidance_scale = self.guidance_scale.or(parameters.guidance_scale);
        parameters.timeout_secs = self.timeout.or(parameters.timeout_secs);
        Ok(parameters)
    }
}

/// Parses an optional `--status` value.
pub fn parse_status(status: Option<&str>) -> anyhow::Result<Option<JobStatus>> {
    status
        .map(|s| s.parse::<JobStatus>().map_err(anyhow::Error::msg).context("Invalid --status"))
        .transpose()
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_args_extras() {
        let args = ParamArgs {
            duration: Some(10),
            extra: vec!["seed=42".to_string(), "style=noir".to_string()],
            ..Default::default()
        };
        let parameters = args.to_parameters().unwrap();
        assert_eq!(parameters.duration_secs, Some(10));
        assert_eq!(parameters.extra["seed"], 42);
        assert_eq!(parameters.extra["style"], "noir");

        let bad = ParamArgs { extra: vec!["novalue".to_string()], ..Default::default() };
        assert!(bad.to_parameters().is_err());
    }

    #[test]
    fn test_param_naming_typed_field() {
        let args = ParamArgs {
            timeout: Some(30),
            extra: vec!["duration_secs=8".to_string(), "timeout_secs=90".to_string()],
            ..Default::default()
        };
        let parameters = args.to_parameters().unwrap();
        assert_eq!(parameters.duration_secs, Some(8));
        assert_eq!(parameters.timeout_secs, Some(30));
        assert!(parameters.extra.is_empty());

        let bad = ParamArgs { extra: vec!["duration_secs=ten".to_string()], ..Default::default() };
        let err = bad.to_parameters().unwrap_err();
        assert!(format!("{:#}", err).contains("duration_secs"));
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(Some("failed")).unwrap(), Some(JobStatus::Failed));
        assert_eq!(parse_status(None).unwrap(), None);
        assert!(parse_status(Some("stuck")).is_err());
    }
}
