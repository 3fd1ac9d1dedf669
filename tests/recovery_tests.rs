//! Restart behavior with the journal-backed store.

mod common;

use common::{Scripted, finish, policy, scheduler_on, subdomains};
use reconflow::executor::ExecutorRegistry;
use reconflow::runtime::Orchestrator;
use reconflow::scheduler::{ScanRequest, snapshot};
use reconflow::stage::StageKind;
use reconflow::state::{ScanStatus, TaskStatus};
use reconflow::store::{JournalStore, TaskStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SECS_5: Duration = Duration::from_secs(5);

fn open(path: &Path) -> Arc<dyn TaskStore> {
    Arc::new(JournalStore::open(path).unwrap())
}

fn quick_executors() -> ExecutorRegistry {
    ExecutorRegistry::new()
        .with(
            StageKind::EnumerateSubdomains,
            Scripted::new(|_, _| Ok(subdomains(&["www", "mail"]))),
        )
        .with(StageKind::ProbeLiveness, Scripted::empty())
}

#[tokio::test]
async fn test_in_flight_task_is_requeued_after_crash() {
    let dir = TempDir::new().unwrap();
    let journal = dir.path().join("journal.jsonl");

    // First process: dispatch the root stage, then die without reporting
    let scan_id = {
        let mut scheduler = scheduler_on(open(&journal), 2, policy(SECS_5, 3));
        let id = scheduler
            .submit(&ScanRequest::new("example.com", "quick"))
            .unwrap();
        let items = scheduler.tick(chrono::Utc::now()).unwrap();
        assert_eq!(items.len(), 1);
        id
    };

    let store = open(&journal);
    let mut scheduler = scheduler_on(store.clone(), 2, policy(SECS_5, 3));
    assert_eq!(scheduler.recover().unwrap(), 1);

    let snap = snapshot(store.as_ref(), scan_id).unwrap();
    let root = snap.stage(StageKind::EnumerateSubdomains).unwrap();
    assert_eq!(root.status, TaskStatus::Queued);
    assert_eq!(root.attempt, 2);

    let orchestrator = Orchestrator::start(scheduler, quick_executors());
    let snap = finish(&orchestrator, scan_id).await;
    assert_eq!(snap.scan.status, ScanStatus::Completed);
    assert_eq!(snap.stats.subdomains, 2);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_lost_task_without_attempts_left_fails() {
    let dir = TempDir::new().unwrap();
    let journal = dir.path().join("journal.jsonl");

    let scan_id = {
        let mut scheduler = scheduler_on(open(&journal), 2, policy(SECS_5, 1));
        let id = scheduler
            .submit(&ScanRequest::new("example.com", "quick"))
            .unwrap();
        scheduler.tick(chrono::Utc::now()).unwrap();
        id
    };

    let store = open(&journal);
    let mut scheduler = scheduler_on(store.clone(), 2, policy(SECS_5, 1));
    assert_eq!(scheduler.recover().unwrap(), 1);
    assert!(scheduler.is_idle());

    let snap = snapshot(store.as_ref(), scan_id).unwrap();
    let root = snap.stage(StageKind::EnumerateSubdomains).unwrap();
    assert_eq!(root.status, TaskStatus::Failed);
    assert!(root.error.as_deref().unwrap().contains("worker lost"));
    assert_eq!(
        snap.stage(StageKind::ProbeLiveness).unwrap().status,
        TaskStatus::Skipped
    );
    assert_eq!(snap.scan.status, ScanStatus::Failed);
}

#[tokio::test]
async fn test_cancelled_scan_finalizes_on_recovery() {
    let dir = TempDir::new().unwrap();
    let journal = dir.path().join("journal.jsonl");

    let scan_id = {
        let mut scheduler = scheduler_on(open(&journal), 2, policy(SECS_5, 3));
        let id = scheduler
            .submit(&ScanRequest::new("example.com", "quick"))
            .unwrap();
        scheduler.tick(chrono::Utc::now()).unwrap();
        // Cancel requested while the root stage is in flight, then crash
        assert!(scheduler.cancel(id).unwrap());
        id
    };

    let store = open(&journal);
    let mut scheduler = scheduler_on(store.clone(), 2, policy(SECS_5, 3));
    scheduler.recover().unwrap();

    let snap = snapshot(store.as_ref(), scan_id).unwrap();
    assert!(snap.is_finished());
    assert_eq!(snap.scan.status, ScanStatus::Cancelled);
    assert!(snap.stages.iter().all(|s| s.status == TaskStatus::Cancelled));
}

#[tokio::test]
async fn test_finished_scans_survive_restart_and_can_be_purged() {
    let dir = TempDir::new().unwrap();
    let journal = dir.path().join("journal.jsonl");

    let scan_id = {
        let scheduler = scheduler_on(open(&journal), 2, policy(SECS_5, 3));
        let orchestrator = Orchestrator::start(scheduler, quick_executors());
        let id = orchestrator
            .submit(&ScanRequest::new("example.com", "quick"))
            .unwrap();
        assert_eq!(finish(&orchestrator, id).await.scan.status, ScanStatus::Completed);
        orchestrator.shutdown().await;
        id
    };

    let store = open(&journal);
    let mut scheduler = scheduler_on(store.clone(), 2, policy(SECS_5, 3));
    assert_eq!(scheduler.recover().unwrap(), 0);

    let snap = snapshot(store.as_ref(), scan_id).unwrap();
    assert_eq!(snap.scan.status, ScanStatus::Completed);
    assert_eq!(snap.stats.subdomains, 2);
    assert_eq!(scheduler.list_scans().unwrap().len(), 1);

    // A long retention keeps it, a zero retention removes it
    assert!(scheduler.purge_older_than(Duration::from_secs(3600)).unwrap().is_empty());
    assert_eq!(scheduler.purge_older_than(Duration::ZERO).unwrap(), vec![scan_id]);
    drop(scheduler);
    drop(store);

    let store = open(&journal);
    assert!(store.list_scans().unwrap().is_empty());
}
