//! The scheduler state machine.
//!
//! The scheduler owns every status transition except `dispatched -> running`,
//! which the worker holding the task's lease performs itself. It never does
//! I/O beyond the task store, so `tick` stays cheap enough to run on every
//! turn of the control loop.

use super::backoff::BackoffPolicy;
use super::event::ScanEvent;
use super::snapshot::{self, ScanSnapshot};
use crate::aggregate::{ResultAggregator, final_status};
use crate::errors::{SchedulerError, StageError, SubmitError};
use crate::executor::parse::is_hostname;
use crate::executor::StageInput;
use crate::pipeline::PipelineRegistry;
use crate::stage::{Record, StageKind, normalize_host};
use crate::state::{Lease, Scan, ScanId, ScanStatus, StageTask, TaskId, TaskStatus};
use crate::store::TaskStore;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A request to run one profile against one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub target: String,
    pub profile: String,
}

impl ScanRequest {
    pub fn new(target: &str, profile: &str) -> Self {
        Self {
            target: target.to_string(),
            profile: profile.to_string(),
        }
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Worker slots; at most this many tasks are in flight at once
    pub capacity: usize,
    pub backoff: BackoffPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A dispatched task, ready for a worker.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub scan_id: ScanId,
    pub task_id: TaskId,
    pub kind: StageKind,
    pub attempt: u32,
    pub lease: Lease,
    pub timeout: Duration,
    pub input: StageInput,
    pub cancel: CancellationToken,
}

/// What a worker observed when running a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded { records: Vec<Record> },
    Failed(StageError),
    TimedOut { after: Duration },
    /// Cancellation was observed; `records` is whatever was produced first
    Cancelled { records: Vec<Record> },
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Succeeded { .. } => "succeeded",
            TaskOutcome::Failed(_) => "failed",
            TaskOutcome::TimedOut { .. } => "timed_out",
            TaskOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Debug)]
struct InFlight {
    scan_id: ScanId,
    lease: Lease,
    cancel: CancellationToken,
}

/// Validate and normalize a scan target.
pub fn validate_target(target: &str) -> Result<String, SubmitError> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return Err(SubmitError::Validation("target is empty".to_string()));
    }
    if trimmed.contains("://") || trimmed.contains('/') {
        return Err(SubmitError::Validation(format!(
            "target '{}' must be a bare domain, not a URL",
            trimmed
        )));
    }
    let host = normalize_host(trimmed);
    if host.len() > 253 || !is_hostname(&host) {
        return Err(SubmitError::Validation(format!(
            "target '{}' is not a valid domain name",
            trimmed
        )));
    }
    Ok(host)
}

/// Central scheduler: expands scans into tasks, dispatches ready tasks, and
/// applies completion reports.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    pipelines: PipelineRegistry,
    aggregator: ResultAggregator,
    config: SchedulerConfig,
    /// Scans with at least one non-terminal task
    active: BTreeSet<ScanId>,
    in_flight: HashMap<TaskId, InFlight>,
    next_seq: u64,
    events: Vec<ScanEvent>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        pipelines: PipelineRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            aggregator: ResultAggregator::new(store.clone()),
            store,
            pipelines,
            config,
            active: BTreeSet::new(),
            in_flight: HashMap::new(),
            next_seq: 0,
            events: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty() && self.in_flight.is_empty()
    }

    /// Take the events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<ScanEvent> {
        std::mem::take(&mut self.events)
    }

    /// Validate a request and create a pending scan with one queued task per
    /// stage. Nothing is written when validation fails.
    pub fn submit(&mut self, request: &ScanRequest) -> Result<ScanId, SubmitError> {
        let target = validate_target(&request.target)?;
        let profile = request.profile.trim();
        if profile.is_empty() {
            return Err(SubmitError::Validation("profile is empty".to_string()));
        }
        let pipeline = self.pipelines.resolve(profile)?;

        let scan = Scan::new(&target, pipeline.name(), pipeline.stages().to_vec());
        let tasks: Vec<StageTask> = pipeline
            .stages()
            .iter()
            .map(|&kind| {
                let policy = pipeline.policy(kind);
                let seq = self.next_seq;
                self.next_seq += 1;
                StageTask::new(
                    scan.id,
                    kind,
                    pipeline.graph().dependencies(kind),
                    policy.max_attempts,
                    policy.timeout,
                    seq,
                )
            })
            .collect();

        self.store.create_scan(&scan, &tasks)?;
        self.active.insert(scan.id);

        tracing::info!(
            scan_id = %scan.id,
            target = %scan.target,
            profile = %scan.profile,
            stages = tasks.len(),
            "Scan submitted"
        );
        self.events.push(ScanEvent::Submitted {
            scan_id: scan.id,
            target: scan.target.clone(),
            profile: scan.profile.clone(),
            stages: scan.stages.clone(),
        });
        Ok(scan.id)
    }

    /// Dispatch every eligible queued task, oldest first, while worker slots
    /// are free. A task is eligible once all of its dependencies succeeded and
    /// its retry backoff (if any) has elapsed.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<Vec<WorkItem>, SchedulerError> {
        let free = self.config.capacity.saturating_sub(self.in_flight.len());
        if free == 0 || self.active.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<(Scan, StageTask, StageInput)> = Vec::new();
        for scan_id in self.active.clone() {
            let scan = self.store.get_scan(scan_id)?;
            if scan.cancel_requested {
                continue;
            }
            let tasks = self.store.list_by_scan(scan_id)?;
            let by_kind: HashMap<StageKind, &StageTask> =
                tasks.iter().map(|t| (t.kind, t)).collect();

            for task in &tasks {
                if task.status != TaskStatus::Queued {
                    continue;
                }
                if task.not_before.is_some_and(|at| at > now) {
                    continue;
                }
                let deps_met = task.depends_on.iter().all(|d| {
                    by_kind
                        .get(d)
                        .is_some_and(|t| t.status == TaskStatus::Succeeded)
                });
                if !deps_met {
                    continue;
                }
                let input = if task.depends_on.is_empty() {
                    StageInput::root(&scan.target)
                } else {
                    let records = task
                        .depends_on
                        .iter()
                        .filter_map(|d| by_kind.get(d))
                        .flat_map(|t| t.records.iter().cloned())
                        .collect();
                    StageInput::seeded(&scan.target, records)
                };
                candidates.push((scan.clone(), task.clone(), input));
            }
        }

        candidates.sort_by_key(|(_, task, _)| task.fifo_key());
        candidates.truncate(free);

        let mut items = Vec::with_capacity(candidates.len());
        for (scan, mut task, input) in candidates {
            let lease = Lease::new();
            task.lease = Some(lease);
            task.set_status(TaskStatus::Dispatched);
            self.store.update_task(&task, None)?;

            // Re-read: an earlier dispatch in this tick may already have
            // moved the scan to running
            let mut current = self.store.get_scan(scan.id)?;
            if current.status == ScanStatus::Pending {
                current.set_status(ScanStatus::Running);
                self.store.update_scan(&current)?;
            }

            let cancel = CancellationToken::new();
            self.in_flight.insert(
                task.id,
                InFlight {
                    scan_id: scan.id,
                    lease,
                    cancel: cancel.clone(),
                },
            );

            tracing::debug!(
                scan_id = %scan.id,
                task_id = %task.id,
                stage = %task.kind,
                attempt = task.attempt,
                inputs = input.records.len(),
                "Task dispatched"
            );
            self.events.push(ScanEvent::Dispatched {
                scan_id: scan.id,
                task_id: task.id,
                stage: task.kind,
                attempt: task.attempt,
            });
            items.push(WorkItem {
                scan_id: scan.id,
                task_id: task.id,
                kind: task.kind,
                attempt: task.attempt,
                lease,
                timeout: task.timeout,
                input,
                cancel,
            });
        }
        Ok(items)
    }

    /// Earliest pending retry among active scans, if any.
    pub fn next_retry_at(&self) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let mut earliest: Option<DateTime<Utc>> = None;
        for scan_id in &self.active {
            for task in self.store.list_by_scan(*scan_id)? {
                if task.status == TaskStatus::Queued
                    && let Some(at) = task.not_before
                {
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
            }
        }
        Ok(earliest)
    }

    /// Record that the worker holding `lease` began executing the task.
    pub fn on_task_started(&mut self, task_id: TaskId, lease: Lease) -> Result<(), SchedulerError> {
        let task = self.store.get_task(task_id)?;
        if task.lease != Some(lease) || task.status != TaskStatus::Running {
            return Err(SchedulerError::StaleReport { task: task_id });
        }
        self.events.push(ScanEvent::Started {
            scan_id: task.scan_id,
            task_id,
            stage: task.kind,
            attempt: task.attempt,
        });
        Ok(())
    }

    /// Apply a worker's completion report.
    ///
    /// Reports carrying a lease the task no longer holds are rejected with
    /// [`SchedulerError::StaleReport`] and leave the task untouched. If the
    /// rejected lease is still the one its worker slot was handed, the slot
    /// is released so the scan cannot stall on it.
    pub fn on_task_completed(
        &mut self,
        task_id: TaskId,
        lease: Lease,
        outcome: TaskOutcome,
    ) -> Result<(), SchedulerError> {
        let mut task = self.store.get_task(task_id)?;
        if task.lease != Some(lease) {
            tracing::warn!(task_id = %task_id, outcome = outcome.label(), "Ignoring stale completion report");
            if self.in_flight.get(&task_id).is_some_and(|f| f.lease == lease) {
                self.in_flight.remove(&task_id);
                self.maybe_finalize(task.scan_id)?;
            }
            return Err(SchedulerError::StaleReport { task: task_id });
        }
        let scan = self.store.get_scan(task.scan_id)?;
        let now = Utc::now();
        task.lease = None;

        let error = match outcome {
            TaskOutcome::Succeeded { records } => {
                self.aggregator
                    .record(scan.id, task.id, task.attempt, &records)?;
                task.records = records;
                task.error = None;
                task.set_status(TaskStatus::Succeeded);
                None
            }
            TaskOutcome::Cancelled { records } => {
                self.aggregator
                    .record(scan.id, task.id, task.attempt, &records)?;
                task.records = records;
                task.set_status(TaskStatus::Cancelled);
                None
            }
            TaskOutcome::Failed(err) => Some(err),
            TaskOutcome::TimedOut { after } => Some(StageError::timeout(after)),
        };

        let mut cascade = false;
        if let Some(err) = error {
            if scan.cancel_requested {
                task.error = Some(err);
                task.set_status(TaskStatus::Cancelled);
            } else if err.is_retryable() && task.attempt < task.max_attempts {
                let delay = self.config.backoff.delay_after(task.attempt);
                let failed_attempt = task.attempt;
                task.attempt += 1;
                task.started_at = None;
                task.error = Some(err.clone());
                task.set_status(TaskStatus::Queued);
                task.not_before = Some(
                    now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
                );
                tracing::warn!(
                    scan_id = %scan.id,
                    task_id = %task.id,
                    stage = %task.kind,
                    attempt = failed_attempt,
                    max_attempts = task.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Stage attempt failed, retry scheduled"
                );
                self.events.push(ScanEvent::RetryScheduled {
                    scan_id: scan.id,
                    task_id: task.id,
                    stage: task.kind,
                    attempt: task.attempt,
                    delay_ms: delay.as_millis() as u64,
                    error: err.to_string(),
                });
            } else {
                tracing::error!(
                    scan_id = %scan.id,
                    task_id = %task.id,
                    stage = %task.kind,
                    attempt = task.attempt,
                    error = %err,
                    "Stage failed"
                );
                task.error = Some(err);
                task.set_status(TaskStatus::Failed);
                cascade = true;
            }
        }

        self.store.update_task(&task, Some(lease))?;
        self.in_flight.remove(&task_id);

        if task.status.is_terminal() {
            tracing::info!(
                scan_id = %scan.id,
                task_id = %task.id,
                stage = %task.kind,
                status = %task.status,
                records = task.records.len(),
                "Stage finished"
            );
            self.events.push(ScanEvent::TaskFinished {
                scan_id: scan.id,
                task_id: task.id,
                stage: task.kind,
                status: task.status,
                records: task.records.len(),
                error: task.error_summary(),
            });
        }
        if task.status == TaskStatus::Succeeded {
            self.report_new_subdomains(&scan, &task);
        }
        if cascade {
            self.skip_blocked(scan.id)?;
        }
        self.maybe_finalize(scan.id)?;
        Ok(())
    }

    /// Check a finished task's subdomains against the target's inventory and
    /// announce the unseen ones. Inventory failures never fail the task.
    fn report_new_subdomains(&mut self, scan: &Scan, task: &StageTask) {
        match self
            .aggregator
            .track_new_subdomains(scan.id, &scan.target, &task.records)
        {
            Ok(hosts) if hosts.is_empty() => {}
            Ok(hosts) => {
                tracing::info!(
                    scan_id = %scan.id,
                    target = %scan.target,
                    count = hosts.len(),
                    "New subdomains discovered"
                );
                self.events.push(ScanEvent::NewSubdomains {
                    scan_id: scan.id,
                    target: scan.target.clone(),
                    hosts,
                });
            }
            Err(e) => {
                tracing::warn!(scan_id = %scan.id, error = %e, "Failed to update subdomain inventory");
            }
        }
    }

    /// Cancel a scan: queued tasks become cancelled immediately and in-flight
    /// workers are signalled to stop. Returns `false` when the scan had
    /// already finished.
    pub fn cancel(&mut self, scan_id: ScanId) -> Result<bool, SchedulerError> {
        let mut scan = self.store.get_scan(scan_id)?;
        if scan.is_finished() {
            return Ok(false);
        }
        if !scan.cancel_requested {
            scan.cancel_requested = true;
            scan.set_status(ScanStatus::Cancelled);
            self.store.update_scan(&scan)?;
            tracing::info!(scan_id = %scan_id, "Scan cancel requested");
        }

        self.cancel_queued(scan_id)?;

        for flight in self.in_flight.values().filter(|f| f.scan_id == scan_id) {
            flight.cancel.cancel();
        }

        self.maybe_finalize(scan_id)?;
        Ok(true)
    }

    fn cancel_queued(&mut self, scan_id: ScanId) -> Result<(), SchedulerError> {
        for mut task in self.store.list_by_scan(scan_id)? {
            if task.status != TaskStatus::Queued {
                continue;
            }
            task.set_status(TaskStatus::Cancelled);
            self.store.update_task(&task, None)?;
            self.events.push(ScanEvent::TaskFinished {
                scan_id,
                task_id: task.id,
                stage: task.kind,
                status: TaskStatus::Cancelled,
                records: 0,
                error: None,
            });
        }
        Ok(())
    }

    /// Mark queued tasks whose dependencies can no longer succeed as skipped,
    /// transitively.
    fn skip_blocked(&mut self, scan_id: ScanId) -> Result<(), SchedulerError> {
        let mut tasks = self.store.list_by_scan(scan_id)?;
        loop {
            let dead: BTreeSet<StageKind> = tasks
                .iter()
                .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Skipped))
                .map(|t| t.kind)
                .collect();

            let mut changed = false;
            for task in tasks.iter_mut() {
                if task.status == TaskStatus::Queued
                    && task.depends_on.iter().any(|d| dead.contains(d))
                {
                    task.set_status(TaskStatus::Skipped);
                    self.store.update_task(task, None)?;
                    tracing::info!(
                        scan_id = %scan_id,
                        task_id = %task.id,
                        stage = %task.kind,
                        "Stage skipped: dependency failed"
                    );
                    self.events.push(ScanEvent::TaskFinished {
                        scan_id,
                        task_id: task.id,
                        stage: task.kind,
                        status: TaskStatus::Skipped,
                        records: 0,
                        error: None,
                    });
                    changed = true;
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }

    /// Finalize the scan once every task is terminal.
    fn maybe_finalize(&mut self, scan_id: ScanId) -> Result<(), SchedulerError> {
        let mut scan = self.store.get_scan(scan_id)?;
        if scan.is_finished() {
            self.active.remove(&scan_id);
            return Ok(());
        }
        let tasks = self.store.list_by_scan(scan_id)?;
        let Some(status) = final_status(&tasks, scan.cancel_requested) else {
            return Ok(());
        };

        scan.set_status(status);
        scan.finished_at = Some(scan.updated_at);
        self.store.update_scan(&scan)?;
        self.active.remove(&scan_id);

        let stats = self.aggregator.result(scan_id)?.stats();
        tracing::info!(
            scan_id = %scan_id,
            status = %status,
            subdomains = stats.subdomains,
            live_hosts = stats.live_hosts,
            open_ports = stats.open_ports,
            urls = stats.urls,
            findings = stats.findings,
            "Scan finished"
        );
        self.events.push(ScanEvent::ScanFinished {
            scan_id,
            status,
            stats,
        });
        Ok(())
    }

    /// Scan status plus per-stage status, read from the store.
    pub fn status(&self, scan_id: ScanId) -> Result<ScanSnapshot, SchedulerError> {
        Ok(snapshot::snapshot(self.store.as_ref(), scan_id)?)
    }

    /// Every scan in the store, newest first.
    pub fn list_scans(&self) -> Result<Vec<Scan>, SchedulerError> {
        Ok(self.store.list_scans()?)
    }

    /// Adopt unfinished scans from the store after a restart.
    ///
    /// Tasks left dispatched or running have no live worker: each is
    /// re-queued on its next attempt, or failed when none remain. Returns the
    /// number of tasks recovered.
    pub fn recover(&mut self) -> Result<usize, SchedulerError> {
        let mut recovered = 0;
        for scan in self.store.list_scans()? {
            if scan.is_finished() {
                continue;
            }
            self.active.insert(scan.id);
            let tasks = self.store.list_by_scan(scan.id)?;
            if let Some(max) = tasks.iter().map(|t| t.seq).max() {
                self.next_seq = self.next_seq.max(max + 1);
            }

            let mut cascade = false;
            for mut task in tasks {
                if !task.status.is_in_flight() || self.in_flight.contains_key(&task.id) {
                    continue;
                }
                let held = task.lease.take();
                if scan.cancel_requested {
                    task.set_status(TaskStatus::Cancelled);
                } else if task.attempt < task.max_attempts {
                    task.attempt += 1;
                    task.started_at = None;
                    task.set_status(TaskStatus::Queued);
                } else {
                    task.error = Some(StageError::transient(format!(
                        "worker lost during attempt {}",
                        task.attempt
                    )));
                    task.set_status(TaskStatus::Failed);
                    cascade = true;
                }
                self.store.update_task(&task, held)?;
                tracing::warn!(
                    scan_id = %scan.id,
                    task_id = %task.id,
                    stage = %task.kind,
                    status = %task.status,
                    attempt = task.attempt,
                    "Recovered orphaned task"
                );
                recovered += 1;
            }

            if cascade {
                self.skip_blocked(scan.id)?;
            }
            if scan.cancel_requested {
                self.cancel_queued(scan.id)?;
            }
            self.maybe_finalize(scan.id)?;
        }
        if recovered > 0 {
            tracing::info!(recovered, "Crash recovery complete");
        }
        Ok(recovered)
    }

    /// Delete finished scans created more than `age` ago.
    pub fn purge_older_than(&mut self, age: Duration) -> Result<Vec<ScanId>, SchedulerError> {
        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.store.purge_finished_before(cutoff)?;
        if !purged.is_empty() {
            tracing::info!(count = purged.len(), "Purged old scans");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{StagePolicy, builtin_profiles};
    use crate::store::MemoryStore;

    fn scheduler(capacity: usize, max_attempts: u32) -> Scheduler {
        let pipelines = PipelineRegistry::load(&builtin_profiles(), |_| StagePolicy {
            timeout: Duration::from_secs(5),
            max_attempts,
        });
        Scheduler::new(
            Arc::new(MemoryStore::new()),
            pipelines,
            SchedulerConfig {
                capacity,
                backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
            },
        )
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(1)
    }

    #[test]
    fn test_validate_target() {
        assert_eq!(validate_target(" Example.COM. ").unwrap(), "example.com");
        assert!(matches!(validate_target(""), Err(SubmitError::Validation(_))));
        assert!(matches!(
            validate_target("https://example.com"),
            Err(SubmitError::Validation(_))
        ));
        assert!(matches!(
            validate_target("not a domain"),
            Err(SubmitError::Validation(_))
        ));
    }

    #[test]
    fn test_submit_rejections_have_no_side_effects() {
        let mut s = scheduler(4, 3);
        assert!(matches!(
            s.submit(&ScanRequest::new("bad target", "quick")),
            Err(SubmitError::Validation(_))
        ));
        assert!(matches!(
            s.submit(&ScanRequest::new("example.com", "nope")),
            Err(SubmitError::UnknownProfile(_))
        ));
        assert!(s.list_scans().unwrap().is_empty());
        assert!(s.drain_events().is_empty());
    }

    #[test]
    fn test_submit_creates_pending_scan_with_queued_tasks() {
        let mut s = scheduler(4, 3);
        let id = s.submit(&ScanRequest::new("example.com", "quick")).unwrap();
        let snap = s.status(id).unwrap();
        assert_eq!(snap.scan.status, ScanStatus::Pending);
        assert_eq!(snap.stages.len(), 2);
        assert!(snap.stages.iter().all(|st| st.status == TaskStatus::Queued));
    }

    #[test]
    fn test_tick_only_dispatches_ready_tasks() {
        let mut s = scheduler(4, 3);
        let id = s.submit(&ScanRequest::new("example.com", "quick")).unwrap();

        let items = s.tick(Utc::now()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, StageKind::EnumerateSubdomains);
        assert_eq!(s.status(id).unwrap().scan.status, ScanStatus::Running);

        // Probe waits on enumeration
        assert!(s.tick(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_capacity_bounds_dispatch_fifo() {
        let mut s = scheduler(1, 3);
        let first = s.submit(&ScanRequest::new("a.com", "subdomain")).unwrap();
        let _second = s.submit(&ScanRequest::new("b.com", "subdomain")).unwrap();

        let items = s.tick(Utc::now()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].scan_id, first);
        assert!(s.tick(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_stale_report_rejected() {
        let mut s = scheduler(4, 3);
        s.submit(&ScanRequest::new("example.com", "subdomain")).unwrap();
        let item = s.tick(Utc::now()).unwrap().remove(0);

        let err = s
            .on_task_completed(item.task_id, Lease::new(), TaskOutcome::Succeeded { records: vec![] })
            .unwrap_err();
        assert!(matches!(err, SchedulerError::StaleReport { .. }));
        assert_eq!(s.in_flight_count(), 1);
    }

    #[test]
    fn test_report_for_revoked_lease_frees_worker_slot() {
        let mut s = scheduler(1, 3);
        let id = s.submit(&ScanRequest::new("example.com", "subdomain")).unwrap();
        let item = s.tick(Utc::now()).unwrap().remove(0);

        // The stored lease moves on while the worker still holds the old one
        let store = s.store().clone();
        let mut task = store.get_task(item.task_id).unwrap();
        task.lease = None;
        task.set_status(TaskStatus::Queued);
        store.update_task(&task, Some(item.lease)).unwrap();

        let err = s
            .on_task_completed(item.task_id, item.lease, TaskOutcome::Succeeded { records: vec![] })
            .unwrap_err();
        assert!(matches!(err, SchedulerError::StaleReport { .. }));
        assert_eq!(s.in_flight_count(), 0);
        assert_eq!(s.status(id).unwrap().stages[0].status, TaskStatus::Queued);

        // The slot is usable again
        assert_eq!(s.tick(Utc::now()).unwrap().len(), 1);
    }

    #[test]
    fn test_retry_requeues_with_backoff() {
        let mut s = scheduler(4, 3);
        let id = s.submit(&ScanRequest::new("example.com", "subdomain")).unwrap();
        let item = s.tick(Utc::now()).unwrap().remove(0);
        s.on_task_completed(item.task_id, item.lease, TaskOutcome::Failed(StageError::transient("429")))
            .unwrap();

        let snap = s.status(id).unwrap();
        assert_eq!(snap.stages[0].status, TaskStatus::Queued);
        assert_eq!(snap.stages[0].attempt, 2);
        assert!(snap.stages[0].retry_at.is_some());
        assert!(s.next_retry_at().unwrap().is_some());

        // Not before the backoff elapses
        assert!(s.tick(Utc::now() - chrono::Duration::seconds(1)).unwrap().is_empty());
        let retry = s.tick(later()).unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].attempt, 2);
    }

    #[test]
    fn test_permanent_failure_cascades_and_finalizes() {
        let mut s = scheduler(4, 3);
        let id = s.submit(&ScanRequest::new("example.com", "standard")).unwrap();
        let item = s.tick(Utc::now()).unwrap().remove(0);
        s.on_task_completed(
            item.task_id,
            item.lease,
            TaskOutcome::Failed(StageError::permanent("out of scope")),
        )
        .unwrap();

        let snap = s.status(id).unwrap();
        assert_eq!(snap.scan.status, ScanStatus::Failed);
        assert!(snap.is_finished());
        assert_eq!(snap.stage(StageKind::ProbeLiveness).unwrap().status, TaskStatus::Skipped);
        assert_eq!(snap.stage(StageKind::HarvestUrls).unwrap().status, TaskStatus::Skipped);
        assert!(s.is_idle());
    }

    #[test]
    fn test_cancel_queued_and_in_flight() {
        let mut s = scheduler(4, 3);
        let id = s.submit(&ScanRequest::new("example.com", "quick")).unwrap();
        let item = s.tick(Utc::now()).unwrap().remove(0);

        assert!(s.cancel(id).unwrap());
        assert!(item.cancel.is_cancelled());
        let snap = s.status(id).unwrap();
        assert_eq!(snap.scan.status, ScanStatus::Cancelled);
        assert!(!snap.is_finished(), "enumeration still in flight");
        assert_eq!(snap.stage(StageKind::ProbeLiveness).unwrap().status, TaskStatus::Cancelled);

        s.on_task_completed(item.task_id, item.lease, TaskOutcome::Cancelled { records: vec![] })
            .unwrap();
        let snap = s.status(id).unwrap();
        assert!(snap.is_finished());
        assert_eq!(snap.scan.status, ScanStatus::Cancelled);
        assert!(!s.cancel(id).unwrap());
    }

    #[test]
    fn test_events_follow_lifecycle() {
        let mut s = scheduler(4, 1);
        let id = s.submit(&ScanRequest::new("example.com", "subdomain")).unwrap();
        let item = s.tick(Utc::now()).unwrap().remove(0);
        s.on_task_completed(
            item.task_id,
            item.lease,
            TaskOutcome::Succeeded {
                records: vec![Record::subdomain("a.example.com")],
            },
        )
        .unwrap();

        let events = s.drain_events();
        assert!(matches!(events.first(), Some(ScanEvent::Submitted { .. })));
        assert!(matches!(events[1], ScanEvent::Dispatched { .. }));
        match events.last() {
            Some(ScanEvent::ScanFinished { scan_id, status, stats }) => {
                assert_eq!(*scan_id, id);
                assert_eq!(*status, ScanStatus::Completed);
                assert_eq!(stats.subdomains, 1);
            }
            other => panic!("Expected ScanFinished, got {other:?}"),
        }
    }

    #[test]
    fn test_purge_keeps_running_scans() {
        let mut s = scheduler(4, 3);
        let id = s.submit(&ScanRequest::new("example.com", "subdomain")).unwrap();
        assert!(s.purge_older_than(Duration::ZERO).unwrap().is_empty());
        assert!(s.status(id).is_ok());
    }
}
