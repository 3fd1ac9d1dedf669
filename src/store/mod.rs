//! Task state store.
//!
//! The store is the single source of truth for scans, their stage tasks and
//! aggregated results. The scheduler and workers never share mutable task
//! state directly: they read a copy, mutate it, and write it back through
//! [`TaskStore::update_task`], which only succeeds while the caller still
//! holds the lease it expects. That compare-and-set is what keeps a task in
//! exactly one status at a time and rejects late reports from timed-out or
//! cancelled workers.
//!
//! Two implementations are provided:
//! - [`MemoryStore`]: process-local, used by tests and one-shot scans
//! - [`JournalStore`]: the memory store backed by an append-only JSONL
//!   journal that is replayed on open, so scans survive a restart. Only
//!   one process may hold a journal for writing; read-only handles replay
//!   it without touching the file

mod journal;
mod memory;

pub use journal::JournalStore;
pub use memory::MemoryStore;

use crate::aggregate::ScanResult;
use crate::errors::StoreError;
use crate::state::{Lease, Scan, ScanId, StageTask, TaskId};
use chrono::{DateTime, Utc};

/// Persistent storage for scan and task records.
///
/// Implementations must be safe to share between the scheduler and worker
/// tasks. Every write is atomic with respect to every other write.
pub trait TaskStore: Send + Sync {
    /// Create a scan together with all of its stage tasks.
    fn create_scan(&self, scan: &Scan, tasks: &[StageTask]) -> Result<(), StoreError>;

    fn get_scan(&self, id: ScanId) -> Result<Scan, StoreError>;

    fn update_scan(&self, scan: &Scan) -> Result<(), StoreError>;

    /// Every scan, newest first.
    fn list_scans(&self) -> Result<Vec<Scan>, StoreError>;

    fn get_task(&self, id: TaskId) -> Result<StageTask, StoreError>;

    /// Write a task back, provided the stored copy still carries
    /// `expected_lease`. Fails with [`StoreError::LeaseMismatch`] otherwise.
    fn update_task(&self, task: &StageTask, expected_lease: Option<Lease>)
    -> Result<(), StoreError>;

    /// Tasks of one scan in FIFO order.
    fn list_by_scan(&self, scan_id: ScanId) -> Result<Vec<StageTask>, StoreError>;

    fn get_result(&self, scan_id: ScanId) -> Result<Option<ScanResult>, StoreError>;

    fn put_result(&self, scan_id: ScanId, result: &ScanResult) -> Result<(), StoreError>;

    /// Remove a scan, its tasks and its result.
    fn delete_scan(&self, scan_id: ScanId) -> Result<(), StoreError>;

    /// Add `hosts` to the subdomain inventory of `target` and return the
    /// ones that were not already known, in input order without duplicates.
    ///
    /// The inventory outlives the scans that fed it: deleting or purging a
    /// scan leaves it untouched.
    fn add_known_subdomains(&self, target: &str, hosts: &[String])
    -> Result<Vec<String>, StoreError>;

    /// Every subdomain ever recorded for `target`, sorted.
    fn known_subdomains(&self, target: &str) -> Result<Vec<String>, StoreError>;

    /// Delete finished scans created before `cutoff`. Unfinished scans are
    /// never removed. Returns the ids removed.
    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScanId>, StoreError> {
        let stale: Vec<ScanId> = self
            .list_scans()?
            .into_iter()
            .filter(|s| s.is_finished() && s.created_at < cutoff)
            .map(|s| s.id)
            .collect();
        for id in &stale {
            self.delete_scan(*id)?;
        }
        Ok(stale)
    }
}
