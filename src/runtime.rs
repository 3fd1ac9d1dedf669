//! Async runtime around the scheduler.
//!
//! ```text
//!  submit/cancel ──► Scheduler (Mutex) ──tick──► WorkerPool ──► StageExecutor
//!                        ▲                           │
//!                        └──── WorkerReport ◄────────┘
//! ```
//!
//! One control loop owns dispatch: it ticks the scheduler, hands work items
//! to the pool, and applies worker reports. It wakes on a report, on a new
//! submission or cancel, and when the earliest retry backoff elapses.
//! Status reads go straight to the task store and never wait on the loop.

use crate::errors::{SchedulerError, StoreError, SubmitError};
use crate::executor::ExecutorRegistry;
use crate::notify::Notifier;
use crate::scheduler::{ScanEvent, ScanRequest, ScanSnapshot, Scheduler, snapshot};
use crate::state::{Scan, ScanId};
use crate::store::TaskStore;
use crate::worker::{WorkerPool, WorkerReport};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 1024;

/// Upper bound on how long the loop sleeps with nothing to wake it.
const IDLE_POLL: Duration = Duration::from_secs(5);

const ALERT_GRACE: Duration = Duration::from_secs(10);

struct Shared {
    scheduler: Mutex<Scheduler>,
    store: Arc<dyn TaskStore>,
    wake: Notify,
    events: broadcast::Sender<ScanEvent>,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Scheduler>, SchedulerError> {
        self.scheduler
            .lock()
            .map_err(|_| SchedulerError::Store(StoreError::LockPoisoned))
    }

    fn publish(&self, events: Vec<ScanEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }
}

/// Running orchestrator: scheduler, worker pool and control loop.
pub struct Orchestrator {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    control: JoinHandle<()>,
    alerts: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Start the control loop and a worker pool sized to the scheduler's
    /// capacity. Must be called inside a tokio runtime.
    pub fn start(scheduler: Scheduler, executors: ExecutorRegistry) -> Self {
        let store = scheduler.store().clone();
        let workers = scheduler.config().capacity;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            scheduler: Mutex::new(scheduler),
            store: store.clone(),
            wake: Notify::new(),
            events,
        });

        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(workers, Arc::new(executors), store, report_tx);
        let shutdown = CancellationToken::new();
        let control = tokio::spawn(control_loop(
            shared.clone(),
            pool,
            report_rx,
            shutdown.clone(),
        ));
        tracing::info!(workers, "Orchestrator started");

        Self {
            shared,
            shutdown,
            control,
            alerts: None,
        }
    }

    /// Forward finished-scan alerts to `notifier`.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.alerts = Some(notifier.spawn(self.subscribe()));
        self
    }

    /// Submit a scan. Returns as soon as the scan and its tasks exist.
    pub fn submit(&self, request: &ScanRequest) -> Result<ScanId, SubmitError> {
        let scan_id = {
            let mut scheduler = self.shared.lock().map_err(|_| StoreError::LockPoisoned)?;
            let id = scheduler.submit(request)?;
            self.shared.publish(scheduler.drain_events());
            id
        };
        self.shared.wake.notify_one();
        Ok(scan_id)
    }

    /// Cancel a scan. Returns `false` if it had already finished.
    pub fn cancel(&self, scan_id: ScanId) -> Result<bool, SchedulerError> {
        let applied = {
            let mut scheduler = self.shared.lock()?;
            let applied = scheduler.cancel(scan_id)?;
            self.shared.publish(scheduler.drain_events());
            applied
        };
        self.shared.wake.notify_one();
        Ok(applied)
    }

    /// Current status, read from the store.
    pub fn status(&self, scan_id: ScanId) -> Result<ScanSnapshot, SchedulerError> {
        Ok(snapshot(self.shared.store.as_ref(), scan_id)?)
    }

    pub fn list_scans(&self) -> Result<Vec<Scan>, SchedulerError> {
        Ok(self.shared.store.list_scans()?)
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.shared.store.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the scan is finished and return its final snapshot.
    pub async fn wait_for(&self, scan_id: ScanId) -> Result<ScanSnapshot, SchedulerError> {
        let mut events = self.subscribe();
        loop {
            let snap = self.status(scan_id)?;
            if snap.is_finished() {
                return Ok(snap);
            }
            match tokio::time::timeout(IDLE_POLL, events.recv()).await {
                Ok(Ok(ScanEvent::ScanFinished { scan_id: id, .. })) if id == scan_id => {}
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) | Err(_) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return self.status(scan_id);
                }
            }
        }
    }

    /// Stop the control loop and the workers. Unfinished tasks stay in the
    /// store for recovery on the next start.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.control.await {
            tracing::error!(error = %e, "Control loop panicked");
        }
        // Dropping the last sender closes the channel so the alert task
        // drains what is pending and exits
        drop(self.shared);
        if let Some(mut alerts) = self.alerts
            && tokio::time::timeout(ALERT_GRACE, &mut alerts).await.is_err()
        {
            tracing::warn!("Pending alerts not delivered before shutdown");
            alerts.abort();
        }
        tracing::info!("Orchestrator stopped");
    }
}

async fn control_loop(
    shared: Arc<Shared>,
    pool: WorkerPool,
    mut reports: mpsc::UnboundedReceiver<WorkerReport>,
    shutdown: CancellationToken,
) {
    loop {
        let next_retry = match dispatch(&shared, &pool) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(error = %e, "Dispatch failed");
                None
            }
        };
        let sleep_for = next_retry
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(IDLE_POLL)
            .min(IDLE_POLL);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            report = reports.recv() => match report {
                Some(report) => apply_report(&shared, report),
                None => break,
            },
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
    pool.shutdown().await;
}

/// Tick the scheduler and hand every work item to the pool. Returns the
/// earliest pending retry time.
fn dispatch(
    shared: &Shared,
    pool: &WorkerPool,
) -> Result<Option<chrono::DateTime<Utc>>, SchedulerError> {
    let mut scheduler = shared.lock()?;
    let items = scheduler.tick(Utc::now())?;
    for item in items {
        if let Err(item) = pool.submit(item) {
            tracing::error!(task_id = %item.task_id, "Worker pool closed, dropping work item");
        }
    }
    shared.publish(scheduler.drain_events());
    scheduler.next_retry_at()
}

fn apply_report(shared: &Shared, report: WorkerReport) {
    let Ok(mut scheduler) = shared.lock() else {
        tracing::error!("Scheduler lock poisoned, dropping worker report");
        return;
    };
    let result = match report {
        WorkerReport::Started { task_id, lease } => scheduler.on_task_started(task_id, lease),
        WorkerReport::Finished {
            task_id,
            lease,
            outcome,
        } => scheduler.on_task_completed(task_id, lease, outcome),
    };
    match result {
        Ok(()) => {}
        Err(SchedulerError::StaleReport { task }) => {
            tracing::debug!(task_id = %task, "Dropped stale worker report");
        }
        Err(e) => tracing::error!(error = %e, "Failed to apply worker report"),
    }
    shared.publish(scheduler.drain_events());
}
