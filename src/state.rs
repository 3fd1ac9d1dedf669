//! Scan and stage-task records tracked by the task state store.
//!
//! A [`Scan`] is one user-initiated run; it owns one [`StageTask`] per stage
//! kind in its profile. Both are plain data: all transitions are applied by
//! the scheduler (or the worker holding a task's [`Lease`]) and written back
//! through [`crate::store::TaskStore`].

use crate::errors::StageError;
use crate::stage::{Record, StageKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }
    };
}

id_type!(
    /// Identifier of a scan.
    ScanId
);
id_type!(
    /// Identifier of a stage task.
    TaskId
);
id_type!(
    /// Ownership token issued to the worker a task is dispatched to.
    ///
    /// While a task carries a lease only the holder may write its status.
    Lease
);

/// Overall status of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Created, nothing dispatched yet
    #[default]
    Pending,
    /// At least one stage task has been dispatched
    Running,
    /// Some stages succeeded, others failed or were skipped
    Partial,
    /// Every stage succeeded
    Completed,
    /// No stage succeeded
    Failed,
    /// Explicitly cancelled
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Partial | Self::Completed | Self::Failed | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Partial => "partial",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Status of a single stage task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies, backoff, or a free worker slot
    #[default]
    Queued,
    /// Pushed onto the work queue, not yet picked up
    Dispatched,
    /// A worker is executing the stage
    Running,
    Succeeded,
    Failed,
    /// A dependency failed permanently
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Dispatched or running: owned by a worker slot.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One user-initiated reconnaissance run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub id: ScanId,
    pub target: String,
    pub profile: String,
    pub stages: Vec<StageKind>,
    pub status: ScanStatus,
    /// Set by an explicit cancel; kept even if the final status ends up `partial`
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once every stage task is terminal and the aggregate is final
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Scan {
    pub fn new(target: &str, profile: &str, stages: Vec<StageKind>) -> Self {
        let now = Utc::now();
        Self {
            id: ScanId::new(),
            target: target.to_string(),
            profile: profile.to_string(),
            stages,
            status: ScanStatus::Pending,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn set_status(&mut self, status: ScanStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// A scheduled, stateful instance of one stage within one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTask {
    pub id: TaskId,
    pub scan_id: ScanId,
    pub kind: StageKind,
    /// Stage kinds that must reach `succeeded` first
    pub depends_on: Vec<StageKind>,
    pub status: TaskStatus,
    /// Number of the current (or last) attempt, starting at 1
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Monotonic creation order, breaks `created_at` ties for FIFO dispatch
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time a re-queued attempt may be dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

impl StageTask {
    pub fn new(
        scan_id: ScanId,
        kind: StageKind,
        depends_on: Vec<StageKind>,
        max_attempts: u32,
        timeout: Duration,
        seq: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            scan_id,
            kind,
            depends_on,
            status: TaskStatus::Queued,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            timeout,
            seq,
            created_at: now,
            updated_at: now,
            not_before: None,
            lease: None,
            started_at: None,
            finished_at: None,
            records: Vec::new(),
            error: None,
        }
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.finished_at = Some(now);
            self.not_before = None;
        }
    }

    /// FIFO ordering key among equally eligible tasks.
    pub fn fifo_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.seq)
    }

    /// One-line error summary for status displays.
    pub fn error_summary(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

/// Serde helpers for Duration serialization.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
