//! Typed error hierarchy for the reconflow engine.
//!
//! One enum per subsystem:
//! - `SubmitError`: scan requests rejected before any task exists
//! - `PipelineError`: invalid profile definitions
//! - `StageError`: stage executor failures, classified for retry
//! - `StoreError`: task state store failures
//! - `SchedulerError`: scheduler operations on unknown or stale state

use crate::stage::StageKind;
use crate::state::{Lease, ScanId, TaskId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by `submit` before any scan record is created.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Invalid scan request: {0}")]
    Validation(String),

    #[error("Unknown profile '{0}'")]
    UnknownProfile(String),

    #[error("Invalid pipeline for profile '{profile}': {source}")]
    InvalidPipeline {
        profile: String,
        #[source]
        source: PipelineError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Structural problems in a pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("Profile defines no stages")]
    Empty,

    #[error("Stage {0} is listed more than once")]
    DuplicateStage(StageKind),

    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    #[error("Edge {from} -> {to} references a stage that is not part of the profile")]
    DanglingEdge { from: StageKind, to: StageKind },

    #[error("Stage {0} depends on itself")]
    SelfDependency(StageKind),

    #[error("Cycle detected in stage dependencies. Involved stages: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Failure reported by a stage executor.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageError {
    #[error("Execution timed out after {after_ms}ms")]
    ExecutionTimeout { after_ms: u64 },

    #[error("Tool '{tool}' unavailable: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("Malformed input: {message}")]
    MalformedInput { message: String },

    #[error("Transient failure: {message}")]
    TransientFailure { message: String },

    #[error("Permanent failure: {message}")]
    PermanentFailure { message: String },
}

impl StageError {
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::ExecutionTimeout {
            after_ms: after.as_millis() as u64,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientFailure {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentFailure {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput {
            message: message.into(),
        }
    }

    pub fn tool_unavailable(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolUnavailable {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Whether another attempt may succeed. Bounded by the task's max attempts;
    /// an unavailable tool becomes permanent once attempts run out.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExecutionTimeout { .. } | Self::ToolUnavailable { .. } | Self::TransientFailure { .. }
        )
    }
}

/// Errors from the task state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Scan {0} not found")]
    ScanNotFound(ScanId),

    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Scan {0} already exists")]
    DuplicateScan(ScanId),

    #[error("Task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("Task {task} is leased to {found:?}, write attempted with {expected:?}")]
    LeaseMismatch {
        task: TaskId,
        expected: Option<Lease>,
        found: Option<Lease>,
    },

    #[error("Journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Journal {} is in use by another reconflow process", .0.display())]
    JournalLocked(PathBuf),

    #[error("Journal is open read-only")]
    ReadOnly,

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Errors from scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scan {0} not found")]
    ScanNotFound(ScanId),

    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Stale completion report for task {task}: lease no longer held")]
    StaleReport { task: TaskId },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ScanNotFound(id) => SchedulerError::ScanNotFound(id),
            StoreError::TaskNotFound(id) => SchedulerError::TaskNotFound(id),
            StoreError::LeaseMismatch { task, .. } => SchedulerError::StaleReport { task },
            other => SchedulerError::Store(other),
        }
    }
}
