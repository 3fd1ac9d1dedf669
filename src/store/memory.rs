use super::TaskStore;
use crate::aggregate::ScanResult;
use crate::errors::StoreError;
use crate::state::{Lease, Scan, ScanId, StageTask, TaskId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub(super) struct Tables {
    pub(super) scans: HashMap<ScanId, Scan>,
    pub(super) tasks: HashMap<TaskId, StageTask>,
    pub(super) by_scan: HashMap<ScanId, Vec<TaskId>>,
    pub(super) results: HashMap<ScanId, ScanResult>,
    /// Every subdomain ever reported, per target
    pub(super) inventory: HashMap<String, BTreeSet<String>>,
}

// Each write is split into a check that may fail and an apply that cannot,
// so the journal can append between the two.
impl Tables {
    pub(super) fn check_new_scan(&self, scan: &Scan, tasks: &[StageTask]) -> Result<(), StoreError> {
        if self.scans.contains_key(&scan.id) {
            return Err(StoreError::DuplicateScan(scan.id));
        }
        if let Some(dup) = tasks.iter().find(|t| self.tasks.contains_key(&t.id)) {
            return Err(StoreError::DuplicateTask(dup.id));
        }
        Ok(())
    }

    pub(super) fn insert_scan(&mut self, scan: &Scan, tasks: &[StageTask]) {
        self.scans.insert(scan.id, scan.clone());
        self.by_scan
            .insert(scan.id, tasks.iter().map(|t| t.id).collect());
        for task in tasks {
            self.tasks.insert(task.id, task.clone());
        }
    }

    pub(super) fn check_scan_exists(&self, scan_id: ScanId) -> Result<(), StoreError> {
        if self.scans.contains_key(&scan_id) {
            Ok(())
        } else {
            Err(StoreError::ScanNotFound(scan_id))
        }
    }

    pub(super) fn check_lease(&self, task: &StageTask, expected: Option<Lease>) -> Result<(), StoreError> {
        let stored = self
            .tasks
            .get(&task.id)
            .ok_or(StoreError::TaskNotFound(task.id))?;
        if stored.lease != expected {
            return Err(StoreError::LeaseMismatch {
                task: task.id,
                expected,
                found: stored.lease,
            });
        }
        Ok(())
    }

    /// Unconditional task write, used after a lease check and on replay.
    pub(super) fn put_task(&mut self, task: &StageTask) {
        let ids = self.by_scan.entry(task.scan_id).or_default();
        if !ids.contains(&task.id) {
            ids.push(task.id);
        }
        self.tasks.insert(task.id, task.clone());
    }

    pub(super) fn remove_scan(&mut self, scan_id: ScanId) {
        self.scans.remove(&scan_id);
        for id in self.by_scan.remove(&scan_id).unwrap_or_default() {
            self.tasks.remove(&id);
        }
        self.results.remove(&scan_id);
    }

    /// Hosts not yet in the inventory of `target`, deduplicated, in input order.
    pub(super) fn unknown_subdomains(&self, target: &str, hosts: &[String]) -> Vec<String> {
        let known = self.inventory.get(target);
        let mut seen = BTreeSet::new();
        hosts
            .iter()
            .filter(|h| !known.is_some_and(|k| k.contains(*h)))
            .filter(|h| seen.insert(h.as_str()))
            .cloned()
            .collect()
    }

    pub(super) fn remember_subdomains(&mut self, target: &str, hosts: &[String]) {
        if hosts.is_empty() {
            return;
        }
        self.inventory
            .entry(target.to_string())
            .or_default()
            .extend(hosts.iter().cloned());
    }
}

/// In-memory task store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn from_tables(tables: Tables) -> Self {
        Self {
            tables: RwLock::new(tables),
        }
    }

    pub(super) fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables.read().map_err(|_| StoreError::LockPoisoned)
    }

    pub(super) fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables.write().map_err(|_| StoreError::LockPoisoned)
    }
}

impl TaskStore for MemoryStore {
    fn create_scan(&self, scan: &Scan, tasks: &[StageTask]) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.check_new_scan(scan, tasks)?;
        tables.insert_scan(scan, tasks);
        Ok(())
    }

    fn get_scan(&self, id: ScanId) -> Result<Scan, StoreError> {
        self.read()?
            .scans
            .get(&id)
            .cloned()
            .ok_or(StoreError::ScanNotFound(id))
    }

    fn update_scan(&self, scan: &Scan) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.check_scan_exists(scan.id)?;
        tables.scans.insert(scan.id, scan.clone());
        Ok(())
    }

    fn list_scans(&self) -> Result<Vec<Scan>, StoreError> {
        let mut scans: Vec<Scan> = self.read()?.scans.values().cloned().collect();
        scans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(scans)
    }

    fn get_task(&self, id: TaskId) -> Result<StageTask, StoreError> {
        self.read()?
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    fn update_task(
        &self,
        task: &StageTask,
        expected_lease: Option<Lease>,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.check_lease(task, expected_lease)?;
        tables.put_task(task);
        Ok(())
    }

    fn list_by_scan(&self, scan_id: ScanId) -> Result<Vec<StageTask>, StoreError> {
        let tables = self.read()?;
        let ids = tables
            .by_scan
            .get(&scan_id)
            .ok_or(StoreError::ScanNotFound(scan_id))?;
        let mut tasks: Vec<StageTask> = ids
            .iter()
            .filter_map(|id| tables.tasks.get(id).cloned())
            .collect();
        tasks.sort_by_key(|t| t.fifo_key());
        Ok(tasks)
    }

    fn get_result(&self, scan_id: ScanId) -> Result<Option<ScanResult>, StoreError> {
        Ok(self.read()?.results.get(&scan_id).cloned())
    }

    fn put_result(&self, scan_id: ScanId, result: &ScanResult) -> Result<(), StoreError> {
        self.write()?.results.insert(scan_id, result.clone());
        Ok(())
    }

    fn delete_scan(&self, scan_id: ScanId) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.check_scan_exists(scan_id)?;
        tables.remove_scan(scan_id);
        Ok(())
    }

    fn add_known_subdomains(&self, target: &str, hosts: &[String]) -> Result<Vec<String>, StoreError> {
        let mut tables = self.write()?;
        let new = tables.unknown_subdomains(target, hosts);
        tables.remember_subdomains(target, &new);
        Ok(new)
    }

    fn known_subdomains(&self, target: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .read()?
            .inventory
            .get(target)
            .map(|k| k.iter().cloned().collect())
            .unwrap_or_default())
    }
}
