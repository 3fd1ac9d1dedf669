//! Inspect and clean up recorded scans: `reconflow status`, `reconflow cleanup`.

use anyhow::{Context, Result};
use console::style;
use reconflow::config::ReconConfig;
use reconflow::scheduler::{Scheduler, snapshot};
use reconflow::state::ScanId;
use reconflow::ui::{UiMode, print_snapshot};
use std::time::Duration;

use super::{open_store, open_store_read_only};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

pub fn cmd_status(project_dir: &std::path::Path, scan: Option<&str>, json: bool) -> Result<()> {
    let config = ReconConfig::new(project_dir.to_path_buf())?;
    if !config.journal_path().exists() {
        println!("No scans recorded yet.");
        return Ok(());
    }
    let store = open_store_read_only(&config)?;
    let mode = if json { UiMode::Json } else { UiMode::Full };

    if let Some(id) = scan {
        let scan_id: ScanId = id
            .parse()
            .with_context(|| format!("Invalid scan ID '{}'", id))?;
        let snap = snapshot(store.as_ref(), scan_id)
            .with_context(|| format!("Failed to read scan {}", scan_id))?;
        print_snapshot(&snap, mode);
        return Ok(());
    }

    let scans = store.list_scans().context("Failed to list scans")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&scans)?);
        return Ok(());
    }
    if scans.is_empty() {
        println!("No scans recorded yet.");
        return Ok(());
    }

    println!();
    println!(
        "{:<36}  {:<10}  {:<10}  {:<20}  {}",
        style("SCAN").bold(),
        style("PROFILE").bold(),
        style("STATUS").bold(),
        style("CREATED").bold(),
        style("TARGET").bold()
    );
    for scan in scans {
        println!(
            "{:<36}  {:<10}  {:<10}  {:<20}  {}",
            scan.id,
            scan.profile,
            scan.status,
            scan.created_at.format("%Y-%m-%d %H:%M:%S"),
            scan.target
        );
    }
    println!();
    Ok(())
}

pub fn cmd_cleanup(project_dir: &std::path::Path, days: u64) -> Result<()> {
    let config = ReconConfig::new(project_dir.to_path_buf())?;
    if !config.journal_path().exists() {
        println!("No scans recorded yet.");
        return Ok(());
    }
    let store = open_store(&config, false)?;
    let mut scheduler = Scheduler::new(store, config.toml.pipelines(), config.scheduler_config());

    let age = Duration::from_secs(days.saturating_mul(SECS_PER_DAY));
    let purged = scheduler
        .purge_older_than(age)
        .context("Failed to purge old scans")?;

    if purged.is_empty() {
        println!("No finished scans older than {} days.", days);
    } else {
        println!(
            "{} Removed {} finished scan(s) older than {} days.",
            style("✓").green(),
            purged.len(),
            days
        );
    }
    Ok(())
}
