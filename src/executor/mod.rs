//! Stage executors.
//!
//! An executor runs one external analysis tool for one stage kind and turns
//! its output into normalized [`Record`]s. Executors are stateless per
//! invocation and registered per stage kind at process start.

mod command;
pub mod parse;

pub use command::{CommandExecutor, ToolSpec, default_tool};

use crate::errors::StageError;
use crate::stage::{Record, StageKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Input handed to a stage executor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageInput {
    /// The scan's target domain
    pub target: String,
    /// Accumulated output of every dependency stage
    pub records: Vec<Record>,
    /// Whether the stage has dependencies. Root stages work on the target
    /// itself; downstream stages only on what their dependencies found.
    pub has_upstream: bool,
}

impl StageInput {
    /// Input for a stage with no dependencies.
    pub fn root(target: &str) -> Self {
        Self {
            target: target.to_string(),
            records: Vec::new(),
            has_upstream: false,
        }
    }

    pub fn seeded(target: &str, records: Vec<Record>) -> Self {
        Self {
            target: target.to_string(),
            records,
            has_upstream: true,
        }
    }

    /// The subjects (hosts or URLs) this stage kind should be run against,
    /// deduplicated in first-seen order.
    pub fn subjects(&self, kind: StageKind) -> Vec<String> {
        if !self.has_upstream || kind == StageKind::EnumerateSubdomains {
            return vec![self.target.clone()];
        }

        let mut seen = std::collections::HashSet::new();
        self.records
            .iter()
            .filter_map(|r| match (kind, r) {
                (StageKind::ProbeLiveness, Record::Subdomain { host }) => Some(host.clone()),
                (
                    StageKind::ScanPorts | StageKind::HarvestUrls,
                    Record::Subdomain { host } | Record::LiveHost { host, .. },
                ) => Some(host.clone()),
                (
                    StageKind::Crawl | StageKind::DetectVulnerabilities,
                    Record::LiveHost { url, .. },
                ) => Some(url.clone()),
                _ => None,
            })
            .filter(|s| seen.insert(s.clone()))
            .collect()
    }
}

/// Output of one executor invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub records: Vec<Record>,
    /// Set when the executor stopped early because of cancellation; the
    /// records are whatever was collected before that point
    pub cancelled: bool,
}

impl StageOutput {
    pub fn complete(records: Vec<Record>) -> Self {
        Self {
            records,
            cancelled: false,
        }
    }

    pub fn cancelled(records: Vec<Record>) -> Self {
        Self {
            records,
            cancelled: true,
        }
    }
}

/// Runs one stage kind against its input.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Short name for logs (usually the tool name).
    fn name(&self) -> &str;

    /// Execute the stage. Implementations check `cancel` between discrete
    /// units of work and return a partial [`StageOutput`] when it fires.
    async fn execute(
        &self,
        kind: StageKind,
        input: &StageInput,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, StageError>;
}

/// Executors keyed by the stage kind they serve.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<StageKind, Arc<dyn StageExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: StageKind, executor: Arc<dyn StageExecutor>) {
        self.executors.insert(kind, executor);
    }

    pub fn with(mut self, kind: StageKind, executor: Arc<dyn StageExecutor>) -> Self {
        self.register(kind, executor);
        self
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&kind).cloned()
    }

    /// Registry of external-tool executors, one per stage kind, using
    /// `spec_for` to pick each stage's command.
    pub fn from_tools<F>(spec_for: F) -> Self
    where
        F: Fn(StageKind) -> ToolSpec,
    {
        let mut registry = Self::new();
        for kind in StageKind::ALL {
            registry.register(kind, Arc::new(CommandExecutor::new(kind, spec_for(kind))));
        }
        registry
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<(&StageKind, &str)> =
            self.executors.iter().map(|(k, e)| (k, e.name())).collect();
        names.sort();
        f.debug_struct("ExecutorRegistry")
            .field("executors", &names)
            .finish()
    }
}
