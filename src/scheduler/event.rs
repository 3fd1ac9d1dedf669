use crate::aggregate::ScanStats;
use crate::stage::StageKind;
use crate::state::{ScanId, ScanStatus, TaskId, TaskStatus};
use serde::Serialize;

/// Progress notifications emitted as scans move through the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    Submitted {
        scan_id: ScanId,
        target: String,
        profile: String,
        stages: Vec<StageKind>,
    },
    Dispatched {
        scan_id: ScanId,
        task_id: TaskId,
        stage: StageKind,
        attempt: u32,
    },
    Started {
        scan_id: ScanId,
        task_id: TaskId,
        stage: StageKind,
        attempt: u32,
    },
    RetryScheduled {
        scan_id: ScanId,
        task_id: TaskId,
        stage: StageKind,
        /// The attempt that will run next
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    TaskFinished {
        scan_id: ScanId,
        task_id: TaskId,
        stage: StageKind,
        status: TaskStatus,
        records: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Subdomains of `target` that no earlier scan had recorded
    NewSubdomains {
        scan_id: ScanId,
        target: String,
        hosts: Vec<String>,
    },
    ScanFinished {
        scan_id: ScanId,
        status: ScanStatus,
        stats: ScanStats,
    },
}

impl ScanEvent {
    pub fn scan_id(&self) -> ScanId {
        match self {
            ScanEvent::Submitted { scan_id, .. }
            | ScanEvent::Dispatched { scan_id, .. }
            | ScanEvent::Started { scan_id, .. }
            | ScanEvent::RetryScheduled { scan_id, .. }
            | ScanEvent::TaskFinished { scan_id, .. }
            | ScanEvent::NewSubdomains { scan_id, .. }
            | ScanEvent::ScanFinished { scan_id, .. } => *scan_id,
        }
    }
}
