//! Generators selectable from the command line.
//!
//! `mock` runs in process and is meant for dry runs. `command` hands each job
//! to an external program: the request goes to its stdin as JSON and the
//! output is read back from its stdout.

use anyhow::bail;
use async_trait::async_trait;
use clap::ValueEnum;
use clipforge_abstraction::mock::{MockGenerator, MockOutcome};
use clipforge_abstraction::{
    GenerationContext, GenerationError, GenerationOutput, GenerationRequest, Generator,
};
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Exit code a generator command uses for failures that must not be retried.
pub const PERMANENT_EXIT_CODE: i32 = 2;

/// Generator kinds the CLI can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GeneratorKind {
    /// In-process mock
    Mock,
    /// External program
    Command,
}

/// Builds the generator selected on the command line.
///
/// # Arguments
/// * `kind` - Which generator
/// * `mock_outcome` - Outcome of every mock call
/// * `mock_latency_ms` - Duration of every mock call
/// * `command` - Program line for the command generator
pub fn build_generator(
    kind: GeneratorKind,
    mock_outcome: &str,
    mock_latency_ms: u64,
    command: Option<&str>,
) -> anyhow::Result<Arc<dyn Generator>> {
    match kind {
        GeneratorKind::Mock => {
            let outcome: MockOutcome = mock_outcome.parse().map_err(anyhow::Error::msg)?;
            Ok(Arc::new(
                MockGenerator::always(outcome).with_latency(Duration::from_millis(mock_latency_ms)),
            ))
        }
        GeneratorKind::Command => match command {
            Some(line) => Ok(Arc::new(CommandGenerator::parse(line)?)),
            None => bail!("--command is required with --generator command"),
        },
    }
}

/// Runs an external program once per job.
///
/// Exit status 0 is success, [`PERMANENT_EXIT_CODE`] a permanent failure and
/// any other status a transient one. Lines written to stderr are forwarded as
/// progress logs.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    /// Splits a command line on whitespace.
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            bail!("generator command is empty");
        };
        Ok(Self { program, args: parts.collect() })
    }
}

fn parse_output(stdout: &[u8]) -> Result<GenerationOutput, GenerationError> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(GenerationOutput::default());
    }
    let value: Value = serde_json::from_slice(stdout)
        .map_err(|e| GenerationError::permanent(format!("generator output is not JSON: {}", e)))?;
    match serde_json::from_value::<GenerationOutput>(value.clone()) {
        Ok(output) => Ok(output),
        Err(_) => Ok(GenerationOutput { payload: value, ..Default::default() }),
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    fn name(&self) -> &str {
        &self.program
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        context: &GenerationContext,
    ) -> Result<GenerationOutput, GenerationError> {
        let input = serde_json::to_vec(request).map_err(GenerationError::permanent)?;

        context.report_stage("upload", "Starting generator command");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GenerationError::permanent(format!("failed to start {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await.map_err(GenerationError::transient)?;
        }

        context.report_stage("generate", "Generator command running");
        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(GenerationError::transient)?,
            () = context.cancel_token().cancelled() => return Err(GenerationError::Cancelled),
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            context.report_log(line);
        }

        match output.status.code() {
            Some(0) => parse_output(&output.stdout),
            code => {
                let reason = stderr.lines().filter(|l| !l.trim().is_empty()).next_back().unwrap_or("no error output").to_string();
                debug!(job_id = %request.job_id, code = ?code, "Generator command failed");
                if code == Some(PERMANENT_EXIT_CODE) {
                    Err(GenerationError::Permanent(reason))
                } else {
                    Err(GenerationError::Transient(format!("exit status {:?}: {}", code, reason)))
                }
            }
        }
    }
}
