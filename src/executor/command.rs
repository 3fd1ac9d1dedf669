//! External-tool executor.
//!
//! Runs a command line per batch of subjects:
//! - `{target}` in the arguments is replaced with the scan target
//! - the batch is written to stdin, one subject per line
//! - stdout is parsed line by line into records for the stage kind
//!
//! The child is killed when the invocation is dropped, so the worker's
//! timeout and cancellation both stop the tool.

use super::parse::{self, subject_host};
use super::{StageExecutor, StageInput, StageOutput};
use crate::errors::StageError;
use crate::stage::StageKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Command line and batching for one stage's tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl ToolSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Build from a `[program, args...]` list as written in configuration.
    pub fn from_command(command: &[String], batch_size: Option<usize>) -> Option<Self> {
        let (program, args) = command.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            batch_size: batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
        })
    }

    fn render_args(&self, target: &str) -> Vec<String> {
        self.args.iter().map(|a| a.replace("{target}", target)).collect()
    }

    /// The full command line, for display.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Default tool for each stage kind.
pub fn default_tool(kind: StageKind) -> ToolSpec {
    match kind {
        StageKind::EnumerateSubdomains => {
            ToolSpec::new("subfinder", &["-d", "{target}", "-silent"])
        }
        StageKind::ProbeLiveness => ToolSpec::new("httpx", &["-silent", "-json"]),
        StageKind::ScanPorts => ToolSpec::new("naabu", &["-silent", "-json"]),
        StageKind::Crawl => ToolSpec::new("katana", &["-silent", "-jsonl"]),
        StageKind::DetectVulnerabilities => ToolSpec::new("nuclei", &["-silent", "-jsonl"]),
        StageKind::HarvestUrls => ToolSpec::new("gau", &["--subs"]),
    }
}

fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty() && !subject.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Executes a stage by shelling out to an external tool.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    kind: StageKind,
    spec: ToolSpec,
}

impl CommandExecutor {
    pub fn new(kind: StageKind, spec: ToolSpec) -> Self {
        Self { kind, spec }
    }

    pub fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn run_batch(&self, target: &str, batch: &[String]) -> Result<String, StageError> {
        let program = &self.spec.program;
        let mut child = Command::new(program)
            .args(self.spec.render_args(target))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    StageError::tool_unavailable(program, e.to_string())
                }
                _ => StageError::transient(format!("Failed to spawn {}: {}", program, e)),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut payload = batch.join("\n");
            payload.push('\n');
            // A tool that exits without reading stdin closes the pipe early
            if let Err(e) = stdin.write_all(payload.as_bytes()).await
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(StageError::transient(format!(
                    "Failed to write input to {}: {}",
                    program, e
                )));
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StageError::transient(format!("Failed to wait for {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no stderr output")
                .trim()
                .to_string();
            return Err(StageError::transient(format!(
                "{} exited with {}: {}",
                program,
                output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| format!("code {}", c)),
                detail
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl StageExecutor for CommandExecutor {
    fn name(&self) -> &str {
        &self.spec.program
    }

    async fn execute(
        &self,
        kind: StageKind,
        input: &StageInput,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, StageError> {
        if kind != self.kind {
            return Err(StageError::permanent(format!(
                "{} is configured for {}, not {}",
                self.spec.program, self.kind, kind
            )));
        }

        let mut subjects = input.subjects(kind);
        if let Some(bad) = subjects.iter().find(|s| !is_valid_subject(s)) {
            return Err(StageError::malformed(format!("Invalid subject {:?}", bad)));
        }
        if matches!(kind, StageKind::ProbeLiveness | StageKind::ScanPorts | StageKind::HarvestUrls) {
            subjects = subjects.iter().map(|s| subject_host(s)).collect();
        }
        if subjects.is_empty() {
            tracing::debug!(stage = %kind, "No upstream subjects, nothing to run");
            return Ok(StageOutput::complete(Vec::new()));
        }

        let batch_size = self.spec.batch_size.max(1);
        let batches = subjects.len().div_ceil(batch_size);
        let mut records = Vec::new();

        for (i, batch) in subjects.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                return Ok(StageOutput::cancelled(records));
            }
            tracing::debug!(
                stage = %kind,
                tool = %self.spec.program,
                batch = i + 1,
                batches,
                subjects = batch.len(),
                "Running tool batch"
            );

            let stdout = tokio::select! {
                _ = cancel.cancelled() => return Ok(StageOutput::cancelled(records)),
                out = self.run_batch(&input.target, batch) => out?,
            };
            records.extend(parse::parse_output(kind, &stdout));
        }

        Ok(StageOutput::complete(records))
    }
}
