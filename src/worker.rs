//! Fixed-size worker pool.
//!
//! Each worker slot pulls the next [`WorkItem`] off a shared queue, claims
//! the task in the store with the item's lease (`dispatched -> running`),
//! runs the stage executor under the task's timeout and reports the outcome
//! back to the control loop. Workers never schedule each other.

use crate::errors::{StageError, StoreError};
use crate::executor::ExecutorRegistry;
use crate::scheduler::{TaskOutcome, WorkItem};
use crate::state::{Lease, TaskId, TaskStatus};
use crate::store::TaskStore;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Message from a worker slot to the control loop.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReport {
    Started {
        task_id: TaskId,
        lease: Lease,
    },
    Finished {
        task_id: TaskId,
        lease: Lease,
        outcome: TaskOutcome,
    },
}

/// Pool of worker slots sharing one work queue.
pub struct WorkerPool {
    queue: mpsc::UnboundedSender<WorkItem>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn spawn(
        size: usize,
        executors: Arc<ExecutorRegistry>,
        store: Arc<dyn TaskStore>,
        reports: mpsc::UnboundedSender<WorkerReport>,
    ) -> Self {
        let (queue, rx) = mpsc::unbounded_channel::<WorkItem>();
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..size.max(1))
            .map(|slot| {
                let rx = rx.clone();
                let executors = executors.clone();
                let store = store.clone();
                let reports = reports.clone();
                tokio::spawn(async move {
                    loop {
                        let item = { rx.lock().await.recv().await };
                        let Some(item) = item else { break };
                        if let Some(report) =
                            run_item(slot, &item, &executors, store.as_ref(), &reports).await
                            && reports.send(report).is_err()
                        {
                            break;
                        }
                    }
                    tracing::debug!(slot, "Worker stopped");
                })
            })
            .collect();

        Self { queue, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Hand a dispatched task to the pool.
    pub fn submit(&self, item: WorkItem) -> Result<(), WorkItem> {
        self.queue.send(item).map_err(|e| e.0)
    }

    /// Stop all workers. In-flight tool processes are killed; their tasks
    /// stay dispatched or running in the store until recovered.
    pub async fn shutdown(self) {
        drop(self.queue);
        for handle in self.handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// Run one work item to completion. Returns `None` when the task could not
/// be claimed because its lease was revoked before the worker got to it.
/// Any other claim failure is reported as a transient stage failure so the
/// scheduler can retry the task instead of waiting on it forever.
pub async fn run_item(
    slot: usize,
    item: &WorkItem,
    executors: &ExecutorRegistry,
    store: &dyn TaskStore,
    reports: &mpsc::UnboundedSender<WorkerReport>,
) -> Option<WorkerReport> {
    let finished = |outcome: TaskOutcome| {
        Some(WorkerReport::Finished {
            task_id: item.task_id,
            lease: item.lease,
            outcome,
        })
    };

    if item.cancel.is_cancelled() {
        return finished(TaskOutcome::Cancelled {
            records: Vec::new(),
        });
    }

    match claim(item, store) {
        Ok(()) => {}
        Err(e @ StoreError::LeaseMismatch { .. }) => {
            tracing::debug!(slot, task_id = %item.task_id, error = %e, "Lease revoked before claim");
            return None;
        }
        Err(e) => {
            tracing::warn!(slot, task_id = %item.task_id, error = %e, "Could not claim task");
            return finished(TaskOutcome::Failed(StageError::transient(format!(
                "failed to claim task: {e}"
            ))));
        }
    }
    let _ = reports.send(WorkerReport::Started {
        task_id: item.task_id,
        lease: item.lease,
    });

    let span = tracing::info_span!(
        "stage",
        slot,
        scan_id = %item.scan_id,
        task_id = %item.task_id,
        stage = %item.kind,
        attempt = item.attempt
    );
    let outcome = execute_stage(item, executors).instrument(span).await;
    finished(outcome)
}

async fn execute_stage(item: &WorkItem, executors: &ExecutorRegistry) -> TaskOutcome {
    let Some(executor) = executors.get(item.kind) else {
        return TaskOutcome::Failed(StageError::tool_unavailable(
            item.kind.as_str(),
            "no executor registered for this stage",
        ));
    };

    tracing::debug!(executor = executor.name(), "Executing stage");
    let started = std::time::Instant::now();
    let result = tokio::time::timeout(
        item.timeout,
        executor.execute(item.kind, &item.input, &item.cancel),
    )
    .await;

    let outcome = match result {
        Err(_) if item.cancel.is_cancelled() => TaskOutcome::Cancelled {
            records: Vec::new(),
        },
        Err(_) => TaskOutcome::TimedOut {
            after: item.timeout,
        },
        Ok(Ok(output)) if output.cancelled => TaskOutcome::Cancelled {
            records: output.records,
        },
        Ok(Ok(output)) => TaskOutcome::Succeeded {
            records: output.records,
        },
        Ok(Err(_)) if item.cancel.is_cancelled() => TaskOutcome::Cancelled {
            records: Vec::new(),
        },
        Ok(Err(e)) => TaskOutcome::Failed(e),
    };

    tracing::debug!(
        outcome = outcome.label(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Stage attempt finished"
    );
    outcome
}

/// Move the task to `running` under the item's lease.
fn claim(item: &WorkItem, store: &dyn TaskStore) -> Result<(), StoreError> {
    let mut task = store.get_task(item.task_id)?;
    if task.status != TaskStatus::Dispatched {
        return Err(StoreError::LeaseMismatch {
            task: item.task_id,
            expected: Some(item.lease),
            found: task.lease,
        });
    }
    task.set_status(TaskStatus::Running);
    task.started_at = Some(Utc::now());
    store.update_task(&task, Some(item.lease))
}
