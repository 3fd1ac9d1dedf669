//! Result aggregation and final scan status.
//!
//! Every completed stage task hands its normalized records to the
//! [`ResultAggregator`], which merges them into the scan's [`ScanResult`]
//! keyed by record kind and record key. Merging is idempotent: the same
//! record arriving from a retry or a duplicated delivery is stored once.
//!
//! Subdomains are also checked against the target's long-lived inventory;
//! the ones never seen by an earlier scan are kept as the scan's
//! `new_subdomains`.

use crate::errors::StoreError;
use crate::stage::{Record, RecordKind};
use crate::state::{ScanId, ScanStatus, StageTask, TaskId, TaskStatus};
use crate::store::TaskStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Aggregated output of a scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Records by kind, then by record key
    #[serde(default)]
    pub records: BTreeMap<RecordKind, BTreeMap<String, Record>>,
    /// Task attempts already merged, so redelivered reports are ignored
    #[serde(default)]
    merged: BTreeSet<(TaskId, u32)>,
    /// Subdomains first discovered by this scan
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub new_subdomains: BTreeSet<String>,
}

impl ScanResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge records, returning how many were new.
    pub fn merge(&mut self, records: &[Record]) -> usize {
        let mut added = 0;
        for record in records {
            let bucket = self.records.entry(record.kind()).or_default();
            let key = record.key();
            if !bucket.contains_key(&key) {
                bucket.insert(key, record.clone());
                added += 1;
            }
        }
        added
    }

    /// Merge the output of one task attempt. Returns `None` when that attempt
    /// was already merged.
    pub fn merge_attempt(&mut self, task: TaskId, attempt: u32, records: &[Record]) -> Option<usize> {
        if !self.merged.insert((task, attempt)) {
            return None;
        }
        Some(self.merge(records))
    }

    pub fn get(&self, kind: RecordKind, key: &str) -> Option<&Record> {
        self.records.get(&kind).and_then(|m| m.get(key))
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        self.records.get(&kind).map_or(0, |m| m.len())
    }

    pub fn total(&self) -> usize {
        self.records.values().map(|m| m.len()).sum()
    }

    pub fn stats(&self) -> ScanStats {
        ScanStats {
            subdomains: self.count(RecordKind::Subdomain),
            live_hosts: self.count(RecordKind::LiveHost),
            open_ports: self.count(RecordKind::OpenPort),
            urls: self.count(RecordKind::Url),
            findings: self.count(RecordKind::Finding),
            new_subdomains: self.new_subdomains.len(),
        }
    }
}

/// Record counts per kind for status displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub subdomains: usize,
    pub live_hosts: usize,
    pub open_ports: usize,
    pub urls: usize,
    pub findings: usize,
    #[serde(default)]
    pub new_subdomains: usize,
}

/// Compute a scan's final status once every task is terminal.
///
/// Returns `None` while any task is still non-terminal.
pub fn final_status(tasks: &[StageTask], cancel_requested: bool) -> Option<ScanStatus> {
    if tasks.iter().any(|t| !t.status.is_terminal()) {
        return None;
    }
    let succeeded = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Succeeded)
        .count();

    Some(if cancel_requested && succeeded == 0 {
        ScanStatus::Cancelled
    } else if succeeded == tasks.len() {
        ScanStatus::Completed
    } else if succeeded == 0 {
        ScanStatus::Failed
    } else {
        ScanStatus::Partial
    })
}

/// Merges stage output into per-scan results held by the task store.
#[derive(Clone)]
pub struct ResultAggregator {
    store: Arc<dyn TaskStore>,
}

impl ResultAggregator {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Merge a finished attempt's records into its scan's aggregate.
    ///
    /// Returns the number of new records (zero for a duplicate delivery).
    pub fn record(
        &self,
        scan_id: ScanId,
        task: TaskId,
        attempt: u32,
        records: &[Record],
    ) -> Result<usize, StoreError> {
        let mut result = self.store.get_result(scan_id)?.unwrap_or_default();
        match result.merge_attempt(task, attempt, records) {
            Some(added) => {
                self.store.put_result(scan_id, &result)?;
                tracing::debug!(
                    scan_id = %scan_id,
                    task_id = %task,
                    attempt,
                    added,
                    total = result.total(),
                    "Merged stage records"
                );
                Ok(added)
            }
            None => {
                tracing::debug!(scan_id = %scan_id, task_id = %task, attempt, "Ignoring duplicate delivery");
                Ok(0)
            }
        }
    }

    /// Add the subdomains in `records` to the inventory of `target` and
    /// remember the previously unknown ones on the scan's result.
    ///
    /// Returns the newly discovered hosts in record order.
    pub fn track_new_subdomains(
        &self,
        scan_id: ScanId,
        target: &str,
        records: &[Record],
    ) -> Result<Vec<String>, StoreError> {
        let hosts: Vec<String> = records
            .iter()
            .filter_map(|r| match r {
                Record::Subdomain { host } => Some(host.clone()),
                _ => None,
            })
            .collect();
        if hosts.is_empty() {
            return Ok(Vec::new());
        }

        let new = self.store.add_known_subdomains(target, &hosts)?;
        if !new.is_empty() {
            let mut result = self.result(scan_id)?;
            result.new_subdomains.extend(new.iter().cloned());
            self.store.put_result(scan_id, &result)?;
        }
        tracing::debug!(
            scan_id = %scan_id,
            target,
            seen = hosts.len(),
            new = new.len(),
            "Checked subdomain inventory"
        );
        Ok(new)
    }

    pub fn result(&self, scan_id: ScanId) -> Result<ScanResult, StoreError> {
        Ok(self.store.get_result(scan_id)?.unwrap_or_default())
    }
}
