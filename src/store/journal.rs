use super::TaskStore;
use super::memory::{MemoryStore, Tables};
use crate::aggregate::ScanResult;
use crate::errors::StoreError;
use crate::state::{Lease, Scan, ScanId, StageTask, TaskId};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One line of the journal.
#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    at: DateTime<Utc>,
    #[serde(flatten)]
    op: JournalOp,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalOp {
    CreateScan { scan: Scan, tasks: Vec<StageTask> },
    Scan { scan: Scan },
    Task { task: StageTask },
    Result { scan_id: ScanId, result: ScanResult },
    Delete { scan_id: ScanId },
    Inventory { target: String, hosts: Vec<String> },
}

/// Task store persisted as an append-only JSONL journal.
///
/// A write is checked against the in-memory tables, appended and flushed,
/// and only then applied in memory, so memory never holds state the journal
/// lacks. On open the journal is replayed and then compacted to one line
/// per live record.
///
/// A writable store holds an exclusive advisory lock on `<journal>.lock`
/// for its whole lifetime. Handles from [`JournalStore::open_read_only`]
/// take no lock, never compact and reject every write.
pub struct JournalStore {
    memory: MemoryStore,
    path: PathBuf,
    /// `None` for read-only handles
    file: Mutex<Option<File>>,
    lock: Option<File>,
}

impl JournalStore {
    /// Open (or create) the journal at `path` for writing and replay it.
    ///
    /// Fails with [`StoreError::JournalLocked`] while another handle holds
    /// the journal.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let lock = Self::acquire_lock(&path)?;

        let tables = if path.exists() {
            Self::replay(&path)?
        } else {
            Tables::default()
        };
        tracing::info!(
            path = %path.display(),
            scans = tables.scans.len(),
            tasks = tables.tasks.len(),
            "Opened scan journal"
        );

        Self::compact(&path, &tables)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            memory: MemoryStore::from_tables(tables),
            path,
            file: Mutex::new(Some(file)),
            lock: Some(lock),
        })
    }

    /// Replay the journal at `path` without locking or rewriting it. A
    /// missing journal yields an empty store.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            Self::replay(&path)?
        } else {
            Tables::default()
        };
        tracing::debug!(path = %path.display(), scans = tables.scans.len(), "Read scan journal");

        Ok(Self {
            memory: MemoryStore::from_tables(tables),
            path,
            file: Mutex::new(None),
            lock: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.lock.is_none()
    }

    fn acquire_lock(path: &Path) -> Result<File, StoreError> {
        let lock_path = path.with_extension("jsonl.lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        match FileExt::try_lock_exclusive(&lock) {
            Ok(()) => Ok(lock),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(StoreError::JournalLocked(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn replay(path: &Path) -> Result<Tables, StoreError> {
        let reader = BufReader::new(File::open(path)?);
        let mut tables = Tables::default();
        let mut lines = reader.lines().enumerate().peekable();

        while let Some((n, line)) = lines.next() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                // A torn final line from a crash mid-append is dropped
                Err(e) if lines.peek().is_none() => {
                    tracing::warn!(line = n + 1, error = %e, "Dropping truncated journal entry");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            Self::apply(&mut tables, entry.op);
        }
        Ok(tables)
    }

    fn apply(tables: &mut Tables, op: JournalOp) {
        match op {
            JournalOp::CreateScan { scan, tasks } => {
                tables.by_scan.entry(scan.id).or_default();
                tables.scans.insert(scan.id, scan);
                for task in &tasks {
                    tables.put_task(task);
                }
            }
            JournalOp::Scan { scan } => {
                tables.scans.insert(scan.id, scan);
            }
            JournalOp::Task { task } => tables.put_task(&task),
            JournalOp::Result { scan_id, result } => {
                tables.results.insert(scan_id, result);
            }
            JournalOp::Delete { scan_id } => tables.remove_scan(scan_id),
            JournalOp::Inventory { target, hosts } => tables.remember_subdomains(&target, &hosts),
        }
    }

    /// Rewrite the journal as a snapshot of `tables`.
    fn compact(path: &Path, tables: &Tables) -> Result<(), StoreError> {
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut out = std::io::BufWriter::new(File::create(&tmp)?);
            let at = Utc::now();
            for scan in tables.scans.values() {
                let tasks: Vec<StageTask> = tables
                    .by_scan
                    .get(&scan.id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| tables.tasks.get(id).cloned())
                    .collect();
                write_entry(&mut out, at, JournalOp::CreateScan { scan: scan.clone(), tasks })?;
                if let Some(result) = tables.results.get(&scan.id) {
                    write_entry(
                        &mut out,
                        at,
                        JournalOp::Result {
                            scan_id: scan.id,
                            result: result.clone(),
                        },
                    )?;
                }
            }
            for (target, hosts) in &tables.inventory {
                let hosts = hosts.iter().cloned().collect();
                write_entry(&mut out, at, JournalOp::Inventory { target: target.clone(), hosts })?;
            }
            out.flush()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Check a write against the tables, append `op`, then apply it.
    ///
    /// The journal lock is held across all three steps so the journal order
    /// matches the order writes took effect. A failed append leaves both the
    /// tables and the journal as they were.
    fn write<C, A>(&self, op: JournalOp, check: C, apply: A) -> Result<(), StoreError>
    where
        C: FnOnce(&Tables) -> Result<(), StoreError>,
        A: FnOnce(&mut Tables),
    {
        let mut file = self.file.lock().map_err(|_| StoreError::LockPoisoned)?;
        let file = file.as_mut().ok_or(StoreError::ReadOnly)?;
        let mut tables = self.memory.write()?;
        check(&tables)?;
        append(file, op)?;
        apply(&mut tables);
        Ok(())
    }
}

fn write_entry<W: Write>(out: &mut W, at: DateTime<Utc>, op: JournalOp) -> Result<(), StoreError> {
    let mut line = serde_json::to_string(&JournalEntry { at, op })?;
    line.push('\n');
    out.write_all(line.as_bytes())?;
    Ok(())
}

/// Append one entry and flush it, cutting the file back on failure so a
/// partial line never ends up in front of later entries.
fn append(file: &mut File, op: JournalOp) -> Result<(), StoreError> {
    let len = file.metadata()?.len();
    let written =
        write_entry(file, Utc::now(), op).and_then(|()| file.flush().map_err(StoreError::from));
    if let Err(e) = written {
        if let Err(trunc) = file.set_len(len) {
            tracing::error!(error = %trunc, "Could not roll back partial journal entry");
        }
        return Err(e);
    }
    Ok(())
}

impl TaskStore for JournalStore {
    fn create_scan(&self, scan: &Scan, tasks: &[StageTask]) -> Result<(), StoreError> {
        self.write(
            JournalOp::CreateScan {
                scan: scan.clone(),
                tasks: tasks.to_vec(),
            },
            |t| t.check_new_scan(scan, tasks),
            |t| t.insert_scan(scan, tasks),
        )
    }

    fn get_scan(&self, id: ScanId) -> Result<Scan, StoreError> {
        self.memory.get_scan(id)
    }

    fn update_scan(&self, scan: &Scan) -> Result<(), StoreError> {
        self.write(
            JournalOp::Scan { scan: scan.clone() },
            |t| t.check_scan_exists(scan.id),
            |t| {
                t.scans.insert(scan.id, scan.clone());
            },
        )
    }

    fn list_scans(&self) -> Result<Vec<Scan>, StoreError> {
        self.memory.list_scans()
    }

    fn get_task(&self, id: TaskId) -> Result<StageTask, StoreError> {
        self.memory.get_task(id)
    }

    fn update_task(
        &self,
        task: &StageTask,
        expected_lease: Option<Lease>,
    ) -> Result<(), StoreError> {
        self.write(
            JournalOp::Task { task: task.clone() },
            |t| t.check_lease(task, expected_lease),
            |t| t.put_task(task),
        )
    }

    fn list_by_scan(&self, scan_id: ScanId) -> Result<Vec<StageTask>, StoreError> {
        self.memory.list_by_scan(scan_id)
    }

    fn get_result(&self, scan_id: ScanId) -> Result<Option<ScanResult>, StoreError> {
        self.memory.get_result(scan_id)
    }

    fn put_result(&self, scan_id: ScanId, result: &ScanResult) -> Result<(), StoreError> {
        self.write(
            JournalOp::Result {
                scan_id,
                result: result.clone(),
            },
            |_| Ok(()),
            |t| {
                t.results.insert(scan_id, result.clone());
            },
        )
    }

    fn delete_scan(&self, scan_id: ScanId) -> Result<(), StoreError> {
        self.write(
            JournalOp::Delete { scan_id },
            |t| t.check_scan_exists(scan_id),
            |t| t.remove_scan(scan_id),
        )
    }

    fn add_known_subdomains(&self, target: &str, hosts: &[String]) -> Result<Vec<String>, StoreError> {
        let new = self.memory.read()?.unknown_subdomains(target, hosts);
        if new.is_empty() {
            return Ok(new);
        }
        // Recomputed under the write lock in case another writer got there first
        let mut fresh = Vec::new();
        self.write(
            JournalOp::Inventory {
                target: target.to_string(),
                hosts: new.clone(),
            },
            |_| Ok(()),
            |t| {
                fresh = t.unknown_subdomains(target, &new);
                t.remember_subdomains(target, &new);
            },
        )?;
        Ok(fresh)
    }

    fn known_subdomains(&self, target: &str) -> Result<Vec<String>, StoreError> {
        self.memory.known_subdomains(target)
    }
}
