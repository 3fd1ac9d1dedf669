//! Shared helpers for integration tests: scripted stage executors and
//! scheduler construction with fast retry backoff.

#![allow(dead_code)]

use async_trait::async_trait;
use reconflow::errors::StageError;
use reconflow::executor::{StageExecutor, StageInput, StageOutput};
use reconflow::pipeline::{PipelineRegistry, StagePolicy, builtin_profiles};
use reconflow::runtime::Orchestrator;
use reconflow::scheduler::{BackoffPolicy, ScanSnapshot, Scheduler, SchedulerConfig};
use reconflow::stage::{Record, StageKind};
use reconflow::aggregate::ScanResult;
use reconflow::errors::StoreError;
use reconflow::state::{Lease, Scan, ScanId, StageTask, TaskId, TaskStatus};
use reconflow::store::{MemoryStore, TaskStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Script = dyn Fn(u32, &StageInput) -> Result<Vec<Record>, StageError> + Send + Sync;

/// Tracks how many executions overlap.
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Executor whose result is computed by a closure from the call number
/// (1-based) and the stage input.
pub struct Scripted {
    delay: Duration,
    calls: AtomicU32,
    gauge: Option<Arc<Gauge>>,
    script: Box<Script>,
}

impl Scripted {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(u32, &StageInput) -> Result<Vec<Record>, StageError> + Send + Sync + 'static,
    {
        Self::build(Duration::ZERO, None, script)
    }

    pub fn slow<F>(delay: Duration, script: F) -> Arc<Self>
    where
        F: Fn(u32, &StageInput) -> Result<Vec<Record>, StageError> + Send + Sync + 'static,
    {
        Self::build(delay, None, script)
    }

    pub fn gauged<F>(delay: Duration, gauge: Arc<Gauge>, script: F) -> Arc<Self>
    where
        F: Fn(u32, &StageInput) -> Result<Vec<Record>, StageError> + Send + Sync + 'static,
    {
        Self::build(delay, Some(gauge), script)
    }

    fn build<F>(delay: Duration, gauge: Option<Arc<Gauge>>, script: F) -> Arc<Self>
    where
        F: Fn(u32, &StageInput) -> Result<Vec<Record>, StageError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            delay,
            calls: AtomicU32::new(0),
            gauge,
            script: Box::new(script),
        })
    }

    /// Succeeds with no records.
    pub fn empty() -> Arc<Self> {
        Self::new(|_, _| Ok(vec![]))
    }

    /// Never finishes on its own; stops only when cancelled.
    pub fn hang() -> Arc<Self> {
        Self::slow(Duration::from_secs(3600), |_, _| Ok(vec![]))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        _kind: StageKind,
        input: &StageInput,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(StageOutput::cancelled(vec![])),
            _ = tokio::time::sleep(self.delay) => (self.script)(call, input).map(StageOutput::complete),
        };
        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
        result
    }
}

pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20))
}

pub fn policy(timeout: Duration, max_attempts: u32) -> StagePolicy {
    StagePolicy {
        timeout,
        max_attempts,
    }
}

pub fn scheduler_on(store: Arc<dyn TaskStore>, capacity: usize, policy: StagePolicy) -> Scheduler {
    let pipelines = PipelineRegistry::load(&builtin_profiles(), |_| policy);
    Scheduler::new(
        store,
        pipelines,
        SchedulerConfig {
            capacity,
            backoff: fast_backoff(),
        },
    )
}

pub fn scheduler(capacity: usize, policy: StagePolicy) -> Scheduler {
    scheduler_on(Arc::new(MemoryStore::new()), capacity, policy)
}

/// Wait for a scan with a generous deadline so a hang fails the test.
pub async fn finish(orchestrator: &Orchestrator, scan_id: ScanId) -> ScanSnapshot {
    tokio::time::timeout(Duration::from_secs(20), orchestrator.wait_for(scan_id))
        .await
        .expect("scan did not finish in time")
        .expect("status read failed")
}

/// Subdomain records for the given labels under `example.com`.
pub fn subdomains(labels: &[&str]) -> Vec<Record> {
    labels
        .iter()
        .map(|l| Record::subdomain(&format!("{}.example.com", l)))
        .collect()
}

/// Memory store that fails the next `failures` writes moving a task to
/// running, as a full disk would.
pub struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicU32,
}

impl FlakyStore {
    pub fn failing_claims(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(failures),
        })
    }
}

impl TaskStore for FlakyStore {
    fn create_scan(&self, scan: &Scan, tasks: &[StageTask]) -> Result<(), StoreError> {
        self.inner.create_scan(scan, tasks)
    }

    fn get_scan(&self, id: ScanId) -> Result<Scan, StoreError> {
        self.inner.get_scan(id)
    }

    fn update_scan(&self, scan: &Scan) -> Result<(), StoreError> {
        self.inner.update_scan(scan)
    }

    fn list_scans(&self) -> Result<Vec<Scan>, StoreError> {
        self.inner.list_scans()
    }

    fn get_task(&self, id: TaskId) -> Result<StageTask, StoreError> {
        self.inner.get_task(id)
    }

    fn update_task(&self, task: &StageTask, expected: Option<Lease>) -> Result<(), StoreError> {
        if task.status == TaskStatus::Running
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Io(std::io::Error::other("no space left on device")));
        }
        self.inner.update_task(task, expected)
    }

    fn list_by_scan(&self, scan_id: ScanId) -> Result<Vec<StageTask>, StoreError> {
        self.inner.list_by_scan(scan_id)
    }

    fn get_result(&self, scan_id: ScanId) -> Result<Option<ScanResult>, StoreError> {
        self.inner.get_result(scan_id)
    }

    fn put_result(&self, scan_id: ScanId, result: &ScanResult) -> Result<(), StoreError> {
        self.inner.put_result(scan_id, result)
    }

    fn delete_scan(&self, scan_id: ScanId) -> Result<(), StoreError> {
        self.inner.delete_scan(scan_id)
    }

    fn add_known_subdomains(&self, target: &str, hosts: &[String]) -> Result<Vec<String>, StoreError> {
        self.inner.add_known_subdomains(target, hosts)
    }

    fn known_subdomains(&self, target: &str) -> Result<Vec<String>, StoreError> {
        self.inner.known_subdomains(target)
    }
}
