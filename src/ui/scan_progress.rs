//! Scan progress UI.
//!
//! Renders the [`ScanEvent`] stream of one scan in one of three modes:
//! - `full`: header bar plus a spinner per running stage
//! - `minimal`: one line per stage outcome
//! - `json`: one JSON event per line for machine consumption

use crate::aggregate::ScanStats;
use crate::scheduler::{ScanEvent, ScanSnapshot};
use crate::stage::StageKind;
use crate::state::{ScanStatus, TaskStatus};
use crate::ui::icons::{CHECK, CLOCK, CROSS, RETRY, RUNNING, SKIP, SPARKLE, STOP, TARGET};
use console::{Emoji, StyledObject, Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::time::{Duration, Instant};

/// Output mode for the scan UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Progress bars and colors
    #[default]
    Full,
    /// Single-line status updates
    Minimal,
    /// JSON-formatted events
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn status_icon(status: TaskStatus) -> Emoji<'static, 'static> {
    match status {
        TaskStatus::Succeeded => CHECK,
        TaskStatus::Failed => CROSS,
        TaskStatus::Skipped => SKIP,
        TaskStatus::Cancelled => STOP,
        _ => RUNNING,
    }
}

fn styled_task_status(status: TaskStatus) -> StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        TaskStatus::Succeeded => s.green(),
        TaskStatus::Failed => s.red(),
        TaskStatus::Skipped | TaskStatus::Cancelled => s.dim(),
        _ => s.cyan(),
    }
}

fn styled_scan_status(status: ScanStatus) -> StyledObject<&'static str> {
    let s = style(status.as_str()).bold();
    match status {
        ScanStatus::Completed => s.green(),
        ScanStatus::Partial => s.yellow(),
        ScanStatus::Failed => s.red(),
        ScanStatus::Cancelled => s.dim(),
        _ => s.cyan(),
    }
}

fn stats_line(stats: &ScanStats) -> String {
    let mut line = format!(
        "subdomains {}  live hosts {}  open ports {}  urls {}  findings {}",
        style(stats.subdomains).cyan(),
        style(stats.live_hosts).cyan(),
        style(stats.open_ports).cyan(),
        style(stats.urls).cyan(),
        style(stats.findings).yellow().bold()
    );
    if stats.new_subdomains > 0 {
        line.push_str(&format!("  new {}", style(stats.new_subdomains).green().bold()));
    }
    line
}

/// Live progress display for one scan.
pub struct ScanUI {
    mode: UiMode,
    multi: MultiProgress,
    header_bar: ProgressBar,
    stage_bars: HashMap<StageKind, ProgressBar>,
    verbose: bool,
    term: Term,
    started: Instant,
}

impl ScanUI {
    pub fn new(mode: UiMode, verbose: bool) -> Self {
        let multi = if mode == UiMode::Full {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        let header_bar = multi.add(ProgressBar::new(0));
        header_bar.set_style(bar_style(
            "{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        ));
        header_bar.set_prefix("SCAN");
        header_bar.set_message("Submitting...");

        Self {
            mode,
            multi,
            header_bar,
            stage_bars: HashMap::new(),
            verbose,
            term: Term::stdout(),
            started: Instant::now(),
        }
    }

    pub fn handle_event(&mut self, event: &ScanEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &ScanEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &ScanEvent) {
        match event {
            ScanEvent::Submitted {
                target,
                profile,
                stages,
                ..
            } => {
                let _ = writeln!(
                    &self.term,
                    "Scan {} ({}): {} stages",
                    target,
                    profile,
                    stages.len()
                );
            }
            ScanEvent::RetryScheduled {
                stage,
                attempt,
                error,
                ..
            } => {
                let _ = writeln!(&self.term, "~ {} retry #{}: {}", stage, attempt, error);
            }
            ScanEvent::TaskFinished {
                stage,
                status,
                records,
                error,
                ..
            } => match error {
                Some(e) => {
                    let _ = writeln!(&self.term, "{} {} ({})", status, stage, e);
                }
                None => {
                    let _ = writeln!(&self.term, "{} {} ({} records)", status, stage, records);
                }
            },
            ScanEvent::NewSubdomains { hosts, .. } => {
                let _ = writeln!(&self.term, "+ {} new subdomains: {}", hosts.len(), hosts.join(", "));
            }
            ScanEvent::ScanFinished { status, stats, .. } => {
                let _ = writeln!(
                    &self.term,
                    "Done: {} ({} subdomains, {} live hosts, {} ports, {} urls, {} findings)",
                    status,
                    stats.subdomains,
                    stats.live_hosts,
                    stats.open_ports,
                    stats.urls,
                    stats.findings
                );
            }
            _ => {}
        }
    }

    fn handle_full(&mut self, event: &ScanEvent) {
        match event {
            ScanEvent::Submitted {
                target,
                profile,
                stages,
                ..
            } => self.on_submitted(target, profile, stages),
            ScanEvent::Dispatched { .. } => {}
            ScanEvent::Started { stage, attempt, .. } => self.on_started(*stage, *attempt),
            ScanEvent::RetryScheduled {
                stage,
                attempt,
                delay_ms,
                error,
                ..
            } => self.on_retry(*stage, *attempt, *delay_ms, error),
            ScanEvent::TaskFinished {
                stage,
                status,
                records,
                error,
                ..
            } => self.on_task_finished(*stage, *status, *records, error.as_deref()),
            ScanEvent::NewSubdomains { hosts, .. } => self.on_new_subdomains(hosts),
            ScanEvent::ScanFinished { status, stats, .. } => self.on_scan_finished(*status, stats),
        }
    }

    fn on_submitted(&self, target: &str, profile: &str, stages: &[StageKind]) {
        self.header_bar.set_length(stages.len() as u64);
        self.header_bar.set_message(style(target).bold().to_string());
        self.multi
            .println(format!(
                "{} Scanning {} with profile {}",
                TARGET,
                style(target).yellow().bold(),
                style(profile).cyan()
            ))
            .ok();
        if self.verbose {
            let names: Vec<&str> = stages.iter().map(|s| s.as_str()).collect();
            self.multi
                .println(format!("   stages: {}", style(names.join(", ")).dim()))
                .ok();
        }
    }

    fn on_started(&mut self, stage: StageKind, attempt: u32) {
        let bar = self
            .stage_bars
            .remove(&stage)
            .unwrap_or_else(|| self.multi.add(ProgressBar::new_spinner()));
        bar.set_style(bar_style("  {spinner:.green} {prefix:.bold} {msg} [{elapsed}]"));
        bar.set_prefix(stage.to_string());
        bar.set_message(if attempt > 1 {
            format!("{}attempt {}", RUNNING, attempt)
        } else {
            format!("{}running", RUNNING)
        });
        bar.enable_steady_tick(Duration::from_millis(100));
        self.stage_bars.insert(stage, bar);
    }

    fn on_retry(&mut self, stage: StageKind, attempt: u32, delay_ms: u64, error: &str) {
        let message = format!(
            "{}retry #{} in {}: {}",
            RETRY,
            attempt,
            format_duration(Duration::from_millis(delay_ms)),
            style(error).yellow()
        );
        match self.stage_bars.get(&stage) {
            Some(bar) => bar.set_message(message),
            None => {
                self.multi.println(format!("  {} {}", stage, message)).ok();
            }
        }
    }

    fn on_task_finished(
        &mut self,
        stage: StageKind,
        status: TaskStatus,
        records: usize,
        error: Option<&str>,
    ) {
        let detail = match error {
            Some(e) => format!("{} {}", styled_task_status(status), style(e).red()),
            None if status == TaskStatus::Succeeded => {
                format!("{} ({} records)", styled_task_status(status), records)
            }
            None => styled_task_status(status).to_string(),
        };
        let line = format!("  {}{} {}", status_icon(status), style(stage).bold(), detail);

        match self.stage_bars.remove(&stage) {
            Some(bar) => {
                bar.set_style(bar_style("  {msg}"));
                bar.finish_with_message(line);
            }
            None => {
                self.multi.println(line).ok();
            }
        }
        self.header_bar.inc(1);
    }

    fn on_new_subdomains(&self, hosts: &[String]) {
        self.multi
            .println(format!(
                "  {}{} new subdomains",
                SPARKLE,
                style(hosts.len()).green().bold()
            ))
            .ok();
        if self.verbose {
            for host in hosts {
                self.multi.println(format!("     {}", style(host).dim())).ok();
            }
        }
    }

    fn on_scan_finished(&mut self, status: ScanStatus, stats: &ScanStats) {
        for (_, bar) in self.stage_bars.drain() {
            bar.abandon();
        }
        self.header_bar.finish_with_message(format!(
            "{} {}",
            styled_scan_status(status),
            format_duration(self.started.elapsed())
        ));
        self.multi.println("").ok();
        self.multi
            .println(format!(
                "{} Scan {} in {}{}",
                SPARKLE,
                styled_scan_status(status),
                CLOCK,
                format_duration(self.started.elapsed())
            ))
            .ok();
        self.multi.println(format!("   {}", stats_line(stats))).ok();
    }

    /// Clear any bars left when the scan ends without a finish event.
    pub fn finish(&mut self) {
        for (_, bar) in self.stage_bars.drain() {
            bar.abandon();
        }
        if !self.header_bar.is_finished() {
            self.header_bar.abandon();
        }
    }
}

/// Print a status snapshot (used by `reconflow status`).
pub fn print_snapshot(snapshot: &ScanSnapshot, mode: UiMode) {
    if mode == UiMode::Json {
        if let Ok(json) = serde_json::to_string_pretty(snapshot) {
            println!("{}", json);
        }
        return;
    }

    let scan = &snapshot.scan;
    println!(
        "{} {}  {}  profile {}  {}",
        TARGET,
        style(scan.id).dim(),
        style(&scan.target).yellow().bold(),
        style(&scan.profile).cyan(),
        styled_scan_status(scan.status)
    );
    println!(
        "   created {}{}",
        scan.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        scan.finished_at
            .map(|f| format!("  finished {}", f.format("%Y-%m-%d %H:%M:%S UTC")))
            .unwrap_or_default()
    );
    for stage in &snapshot.stages {
        let mut line = format!(
            "   {}{:<24} {:<10} attempt {}/{}  {} records",
            status_icon(stage.status),
            stage.stage.as_str(),
            styled_task_status(stage.status),
            stage.attempt,
            stage.max_attempts,
            stage.records
        );
        if let Some(at) = stage.retry_at {
            line.push_str(&format!("  retry at {}", at.format("%H:%M:%S")));
        }
        if let Some(error) = &stage.error {
            line.push_str(&format!("  {}", style(error).red()));
        }
        println!("{}", line);
    }
    println!("   {}", stats_line(&snapshot.stats));
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ScanId, TaskId};

    fn scan_events() -> Vec<ScanEvent> {
        let scan_id = ScanId::new();
        let task_id = TaskId::new();
        vec![
            ScanEvent::Submitted {
                scan_id,
                target: "example.com".into(),
                profile: "subdomain".into(),
                stages: vec![StageKind::EnumerateSubdomains],
            },
            ScanEvent::Dispatched {
                scan_id,
                task_id,
                stage: StageKind::EnumerateSubdomains,
                attempt: 1,
            },
            ScanEvent::Started {
                scan_id,
                task_id,
                stage: StageKind::EnumerateSubdomains,
                attempt: 1,
            },
            ScanEvent::RetryScheduled {
                scan_id,
                task_id,
                stage: StageKind::EnumerateSubdomains,
                attempt: 2,
                delay_ms: 2000,
                error: "Transient failure: exit 1".into(),
            },
            ScanEvent::Started {
                scan_id,
                task_id,
                stage: StageKind::EnumerateSubdomains,
                attempt: 2,
            },
            ScanEvent::TaskFinished {
                scan_id,
                task_id,
                stage: StageKind::EnumerateSubdomains,
                status: TaskStatus::Succeeded,
                records: 4,
                error: None,
            },
            ScanEvent::NewSubdomains {
                scan_id,
                target: "example.com".into(),
                hosts: vec!["a.example.com".into(), "b.example.com".into()],
            },
            ScanEvent::ScanFinished {
                scan_id,
                status: ScanStatus::Completed,
                stats: ScanStats {
                    subdomains: 4,
                    new_subdomains: 2,
                    ..Default::default()
                },
            },
        ]
    }

    #[test]
    fn test_ui_mode_parse() {
        assert_eq!(UiMode::parse("json"), UiMode::Json);
        assert_eq!(UiMode::parse("MINIMAL"), UiMode::Minimal);
        assert_eq!(UiMode::parse("full"), UiMode::Full);
        assert_eq!(UiMode::parse("whatever"), UiMode::Full);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_full_mode_tracks_stage_bars() {
        let mut ui = ScanUI::new(UiMode::Full, true);
        let events = scan_events();

        for event in &events[..3] {
            ui.handle_event(event);
        }
        assert_eq!(ui.header_bar.length(), Some(1));
        assert!(ui.stage_bars.contains_key(&StageKind::EnumerateSubdomains));

        for event in &events[3..] {
            ui.handle_event(event);
        }
        assert!(ui.stage_bars.is_empty());
        assert_eq!(ui.header_bar.position(), 1);
        assert!(ui.header_bar.is_finished());
    }

    #[test]
    fn test_queued_cancel_without_bar_still_counts() {
        let mut ui = ScanUI::new(UiMode::Full, false);
        ui.handle_event(&ScanEvent::TaskFinished {
            scan_id: ScanId::new(),
            task_id: TaskId::new(),
            stage: StageKind::Crawl,
            status: TaskStatus::Cancelled,
            records: 0,
            error: None,
        });
        assert_eq!(ui.header_bar.position(), 1);
        ui.finish();
    }

    #[test]
    fn test_other_modes_handle_every_event() {
        for mode in [UiMode::Minimal, UiMode::Json] {
            let mut ui = ScanUI::new(mode, false);
            for event in &scan_events() {
                ui.handle_event(event);
            }
            assert!(ui.stage_bars.is_empty());
            ui.finish();
        }
    }
}
