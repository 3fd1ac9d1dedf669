//! Configuration for reconflow, read from `reconflow.toml`.
//!
//! Settings are layered file -> environment -> CLI. Every section is
//! optional and falls back to defaults, so an empty file is valid.
//!
//! # Configuration File Format
//!
//! ```toml
//! [workers]
//! size = 4
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 2000
//! max_delay_ms = 60000
//!
//! [stages.enumerate-subdomains]
//! timeout_secs = 600
//! max_attempts = 2
//! command = ["subfinder", "-d", "{target}", "-silent"]
//! batch_size = 50
//!
//! [profiles.quick]
//! stages = ["enumerate-subdomains", "probe-liveness"]
//! edges = [["enumerate-subdomains", "probe-liveness"]]
//!
//! [store]
//! journal = ".reconflow/journal.jsonl"
//!
//! [logging]
//! format = "pretty"
//! dir = ".reconflow/logs"
//!
//! [alerts]
//! webhook_url = "https://hooks.example.com/recon"
//! ```

use crate::executor::{ToolSpec, default_tool};
use crate::pipeline::{PipelineRegistry, ProfileSpec, StagePolicy, builtin_profiles};
use crate::scheduler::{BackoffPolicy, SchedulerConfig};
use crate::stage::StageKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "reconflow.toml";
pub const STATE_DIR: &str = ".reconflow";

pub const ENV_WORKERS: &str = "RECONFLOW_WORKERS";
pub const ENV_WEBHOOK_URL: &str = "RECONFLOW_WEBHOOK_URL";

const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersSection {
    /// Maximum number of stage tasks running at once
    #[serde(default = "default_workers")]
    pub size: usize,
}

fn default_workers() -> usize {
    4
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            size: default_workers(),
        }
    }
}

/// Retry defaults applied to every stage without its own override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    BackoffPolicy::default().base_delay_ms
}

fn default_max_delay_ms() -> u64 {
    BackoffPolicy::default().max_delay_ms
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Per-stage overrides, keyed by stage name (`[stages.probe-liveness]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Tool command line: program followed by its arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Journal path, relative to the project directory unless absolute
    #[serde(default = "default_journal")]
    pub journal: PathBuf,
}

fn default_journal() -> PathBuf {
    Path::new(STATE_DIR).join("journal.jsonl")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            journal: default_journal(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for log files. Logs go to stderr only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// The complete reconflow.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconToml {
    #[serde(default)]
    pub workers: WorkersSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub stages: BTreeMap<String, StageSection>,
    /// Extra or replacement profiles, merged over the built-in ones
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileSpec>,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub alerts: AlertsSection,
}

impl ReconToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse reconflow.toml")
    }

    /// Load `reconflow.toml` from `dir`, or defaults if there is none.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize reconflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    fn stage(&self, kind: StageKind) -> Option<&StageSection> {
        self.stages.get(kind.as_str())
    }

    /// Timeout and attempt budget for a stage kind.
    pub fn stage_policy(&self, kind: StageKind) -> StagePolicy {
        let section = self.stage(kind);
        StagePolicy {
            timeout: Duration::from_secs(
                section
                    .and_then(|s| s.timeout_secs)
                    .unwrap_or(DEFAULT_STAGE_TIMEOUT_SECS),
            ),
            max_attempts: section
                .and_then(|s| s.max_attempts)
                .unwrap_or(self.retry.max_attempts)
                .max(1),
        }
    }

    /// Tool for a stage kind: the configured command, else the catalogue
    /// default. A configured `batch_size` applies to either.
    pub fn tool_spec(&self, kind: StageKind) -> ToolSpec {
        let section = self.stage(kind);
        let batch_size = section.and_then(|s| s.batch_size);
        let configured = section
            .and_then(|s| s.command.as_deref())
            .and_then(|cmd| ToolSpec::from_command(cmd, batch_size));

        configured.unwrap_or_else(|| {
            let mut spec = default_tool(kind);
            if let Some(size) = batch_size {
                spec.batch_size = size.max(1);
            }
            spec
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: self.retry.base_delay_ms,
            max_delay_ms: self.retry.max_delay_ms,
        }
    }

    /// Built-in profiles with configured ones layered on top.
    pub fn profile_specs(&self) -> BTreeMap<String, ProfileSpec> {
        let mut specs = builtin_profiles();
        specs.extend(self.profiles.clone());
        specs
    }

    /// Validate every profile into a registry.
    pub fn pipelines(&self) -> PipelineRegistry {
        PipelineRegistry::load(&self.profile_specs(), |kind| self.stage_policy(kind))
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.workers.size == 0 {
            warnings.push("workers.size is 0: at least one worker is always started".to_string());
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0: every stage gets one attempt".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            warnings.push(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            ));
        }

        for (name, section) in &self.stages {
            if StageKind::parse(name).is_none() {
                warnings.push(format!("Unknown stage '{}' in [stages]", name));
            }
            if section.max_attempts == Some(0) {
                warnings.push(format!("stages.{}.max_attempts is 0", name));
            }
            if section.timeout_secs == Some(0) {
                warnings.push(format!("stages.{}.timeout_secs is 0", name));
            }
            if section.batch_size == Some(0) {
                warnings.push(format!("stages.{}.batch_size is 0", name));
            }
            if let Some(cmd) = &section.command
                && ToolSpec::from_command(cmd, None).is_none()
            {
                warnings.push(format!("stages.{}.command is empty", name));
            }
        }

        for (name, spec) in &self.profiles {
            if let Err(e) = spec.to_graph() {
                warnings.push(format!("Profile '{}' is invalid: {}", name, e));
            }
        }

        warnings
    }
}

/// Effective configuration for one project directory.
///
/// Merges:
/// 1. reconflow.toml
/// 2. Environment variables
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct ReconConfig {
    pub project_dir: PathBuf,
    pub toml: ReconToml,
    env_workers: Option<usize>,
    env_webhook_url: Option<String>,
    /// CLI override for the worker pool size
    pub cli_workers: Option<usize>,
}

impl ReconConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let toml = ReconToml::load_or_default(&project_dir)?;
        Ok(Self::from_parts(project_dir, toml, |key| std::env::var(key).ok()))
    }

    pub fn with_cli_args(project_dir: PathBuf, workers: Option<usize>) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_workers = workers;
        Ok(config)
    }

    /// Build from parsed TOML, reading overrides through `env`.
    pub fn from_parts<F>(project_dir: PathBuf, toml: ReconToml, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_workers = env(ENV_WORKERS).and_then(|raw| match raw.trim().parse() {
            Ok(n) => Some(n),
            Err(_) => {
                tracing::warn!(value = %raw, "Ignoring invalid {}", ENV_WORKERS);
                None
            }
        });
        let env_webhook_url = env(ENV_WEBHOOK_URL).filter(|u| !u.trim().is_empty());

        Self {
            project_dir,
            toml,
            env_workers,
            env_webhook_url,
            cli_workers: None,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.project_dir.join(CONFIG_FILE)
    }

    /// Worker pool size (CLI -> env -> file), at least one.
    pub fn workers(&self) -> usize {
        self.cli_workers
            .or(self.env_workers)
            .unwrap_or(self.toml.workers.size)
            .max(1)
    }

    /// Webhook URL (env -> file).
    pub fn webhook_url(&self) -> Option<String> {
        self.env_webhook_url.clone().or_else(|| {
            self.toml
                .alerts
                .webhook_url
                .clone()
                .filter(|u| !u.trim().is_empty())
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.resolve(&self.toml.store.journal)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.dir.as_deref().map(|d| self.resolve(d))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            capacity: self.workers(),
            backoff: self.toml.backoff(),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
