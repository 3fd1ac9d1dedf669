use crate::aggregate::ScanStats;
use crate::errors::StoreError;
use crate::stage::StageKind;
use crate::state::{Scan, ScanId, TaskId, TaskStatus};
use crate::store::TaskStore;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time view of one stage task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSnapshot {
    pub task_id: TaskId,
    pub stage: StageKind,
    pub status: TaskStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

/// Scan status plus per-stage status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSnapshot {
    pub scan: Scan,
    pub stages: Vec<StageSnapshot>,
    pub stats: ScanStats,
}

impl ScanSnapshot {
    pub fn is_finished(&self) -> bool {
        self.scan.is_finished()
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageSnapshot> {
        self.stages.iter().find(|s| s.stage == kind)
    }

    /// Count of stages in a terminal status.
    pub fn terminal_stages(&self) -> usize {
        self.stages.iter().filter(|s| s.status.is_terminal()).count()
    }
}

/// Read a snapshot straight from the store.
pub fn snapshot(store: &dyn TaskStore, scan_id: ScanId) -> Result<ScanSnapshot, StoreError> {
    let scan = store.get_scan(scan_id)?;
    let stages = store
        .list_by_scan(scan_id)?
        .into_iter()
        .map(|t| StageSnapshot {
            error: t.error_summary(),
            task_id: t.id,
            stage: t.kind,
            status: t.status,
            attempt: t.attempt,
            max_attempts: t.max_attempts,
            records: t.records.len(),
            started_at: t.started_at,
            finished_at: t.finished_at,
            retry_at: t.not_before,
        })
        .collect();
    let stats = store
        .get_result(scan_id)?
        .map(|r| r.stats())
        .unwrap_or_default();

    Ok(ScanSnapshot {
        scan,
        stages,
        stats,
    })
}
