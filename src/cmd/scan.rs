//! Run one scan to completion: `reconflow scan`.

use anyhow::{Context, Result};
use console::style;
use reconflow::config::ReconConfig;
use reconflow::executor::ExecutorRegistry;
use reconflow::notify::Notifier;
use reconflow::runtime::Orchestrator;
use reconflow::scheduler::{ScanEvent, ScanRequest, ScanSnapshot, Scheduler};
use reconflow::state::{ScanId, ScanStatus};
use reconflow::ui::{ScanUI, UiMode};
use tokio::sync::broadcast;

use super::open_store;

pub struct ScanArgs<'a> {
    pub target: &'a str,
    pub profile: &'a str,
    pub workers: Option<usize>,
    pub ui: &'a str,
    pub ephemeral: bool,
    pub verbose: bool,
}

pub async fn cmd_scan(project_dir: &std::path::Path, args: ScanArgs<'_>) -> Result<()> {
    let config = ReconConfig::with_cli_args(project_dir.to_path_buf(), args.workers)?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let store = open_store(&config, args.ephemeral)?;
    let executors = ExecutorRegistry::from_tools(|kind| config.toml.tool_spec(kind));
    let mut scheduler = Scheduler::new(store, config.toml.pipelines(), config.scheduler_config());
    let recovered = scheduler
        .recover()
        .context("Failed to recover interrupted scans")?;
    if recovered > 0 {
        tracing::info!(recovered, "Resuming stage tasks from an interrupted run");
    }

    let orchestrator = Orchestrator::start(scheduler, executors)
        .with_notifier(Notifier::new(config.webhook_url()));

    // Subscribe before submitting so the UI sees the Submitted event
    let events = orchestrator.subscribe();
    let request = ScanRequest::new(args.target, args.profile);
    let scan_id = match orchestrator.submit(&request) {
        Ok(id) => id,
        Err(e) => {
            orchestrator.shutdown().await;
            return Err(e).context("Scan rejected");
        }
    };

    let mode = UiMode::parse(args.ui);
    let display = tokio::spawn(render(events, scan_id, ScanUI::new(mode, args.verbose)));

    let outcome = wait_or_cancel(&orchestrator, scan_id).await;
    // Shutdown closes the event channel, so the display drains and exits
    orchestrator.shutdown().await;
    let _ = display.await;

    let snapshot = outcome?;
    if mode != UiMode::Json {
        println!();
        println!("Scan ID: {}", style(scan_id).cyan());
        println!(
            "Run 'reconflow status --scan {}' to inspect stage details.",
            scan_id
        );
    }
    if snapshot.scan.status == ScanStatus::Failed {
        anyhow::bail!("Scan {} failed: no stage succeeded", scan_id);
    }
    Ok(())
}

/// Wait for the scan, cancelling it cooperatively on Ctrl-C.
async fn wait_or_cancel(orchestrator: &Orchestrator, scan_id: ScanId) -> Result<ScanSnapshot> {
    tokio::select! {
        snapshot = orchestrator.wait_for(scan_id) => {
            return snapshot.context("Failed to read scan status");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
        }
    }

    eprintln!(
        "{}",
        style("Interrupted: cancelling scan, waiting for running stages...").yellow()
    );
    orchestrator
        .cancel(scan_id)
        .context("Failed to cancel scan")?;
    orchestrator
        .wait_for(scan_id)
        .await
        .context("Failed to read scan status")
}

async fn render(mut events: broadcast::Receiver<ScanEvent>, scan_id: ScanId, mut ui: ScanUI) {
    loop {
        match events.recv().await {
            Ok(event) if event.scan_id() == scan_id => {
                ui.handle_event(&event);
                if matches!(event, ScanEvent::ScanFinished { .. }) {
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "Progress display skipped events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    ui.finish();
}
