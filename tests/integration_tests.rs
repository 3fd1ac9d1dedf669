//! Integration tests for the reconflow CLI
//!
//! These tests run the built binary against temporary project directories.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a reconflow Command rooted at a project directory
fn reconflow(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("reconflow");
    cmd.arg("--project-dir")
        .arg(dir.path())
        .env_remove("RUST_LOG")
        .env_remove("RECONFLOW_WORKERS")
        .env_remove("RECONFLOW_WEBHOOK_URL");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_reconflow_help() {
        cargo_bin_cmd!("reconflow")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("scan"))
            .stdout(predicate::str::contains("profiles"));
    }

    #[test]
    fn test_reconflow_version() {
        cargo_bin_cmd!("reconflow")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("reconflow"));
    }

    #[test]
    fn test_profiles_lists_builtins_with_waves() {
        let dir = create_temp_project();
        reconflow(&dir)
            .arg("profiles")
            .assert()
            .success()
            .stdout(predicate::str::contains("quick"))
            .stdout(predicate::str::contains("standard"))
            .stdout(predicate::str::contains("wave 1: enumerate-subdomains"))
            .stdout(predicate::str::contains("wave 2: probe-liveness"));
    }

    #[test]
    fn test_profiles_marks_invalid_custom_profile() {
        let dir = create_temp_project();
        fs::write(
            dir.path().join("reconflow.toml"),
            r#"
[profiles.loop]
stages = ["probe-liveness", "scan-ports"]
edges = [["probe-liveness", "scan-ports"], ["scan-ports", "probe-liveness"]]
"#,
        )
        .unwrap();

        reconflow(&dir)
            .arg("profiles")
            .assert()
            .success()
            .stdout(predicate::str::contains("loop"))
            .stdout(predicate::str::contains("(invalid)"))
            .stdout(predicate::str::contains("quick"));
    }
}

// =============================================================================
// Configuration Commands
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let dir = create_temp_project();
        reconflow(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created reconflow.toml"));

        let content = fs::read_to_string(dir.path().join("reconflow.toml")).unwrap();
        assert!(content.contains("[workers]"));
        assert!(content.contains("[retry]"));

        // A second init leaves the file alone
        reconflow(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_without_file() {
        let dir = create_temp_project();
        reconflow(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults (valid)"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_project();
        fs::write(
            dir.path().join("reconflow.toml"),
            r#"
[workers]
size = 0

[stages.port-scan]
timeout_secs = 30
"#,
        )
        .unwrap();

        reconflow(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("workers.size is 0"))
            .stdout(predicate::str::contains("Unknown stage 'port-scan'"));
    }

    #[test]
    fn test_config_show_includes_overrides() {
        let dir = create_temp_project();
        reconflow(&dir)
            .args(["config", "show"])
            .env("RECONFLOW_WORKERS", "7")
            .assert()
            .success()
            .stdout(predicate::str::contains("No reconflow.toml found"))
            .stdout(predicate::str::contains("workers = 7"))
            .stdout(predicate::str::contains("enumerate-subdomains"));
    }

    #[test]
    fn test_malformed_config_fails() {
        let dir = create_temp_project();
        fs::write(dir.path().join("reconflow.toml"), "[workers\nsize = 2").unwrap();

        reconflow(&dir).arg("profiles").assert().failure();
    }
}

// =============================================================================
// Scan Lifecycle
// =============================================================================

mod scans {
    use super::*;

    #[test]
    fn test_status_without_journal() {
        let dir = create_temp_project();
        reconflow(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No scans recorded yet."));
    }

    #[test]
    fn test_cleanup_without_journal() {
        let dir = create_temp_project();
        reconflow(&dir)
            .arg("cleanup")
            .assert()
            .success()
            .stdout(predicate::str::contains("No scans recorded yet."));
    }

    #[test]
    fn test_scan_rejects_unknown_profile() {
        let dir = create_temp_project();
        reconflow(&dir)
            .args(["scan", "example.com", "--profile", "nope", "--ephemeral"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Scan rejected"));
    }

    #[test]
    fn test_scan_rejects_url_target() {
        let dir = create_temp_project();
        reconflow(&dir)
            .args(["scan", "https://example.com", "--ephemeral"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("bare domain"));
    }

    #[test]
    fn test_status_rejects_bad_scan_id() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".reconflow")).unwrap();
        fs::write(dir.path().join(".reconflow/journal.jsonl"), "").unwrap();

        reconflow(&dir)
            .args(["status", "--scan", "not-a-uuid"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid scan ID"));
    }

    #[test]
    fn test_scan_refused_while_journal_is_held() {
        let dir = create_temp_project();
        let journal = dir.path().join(".reconflow/journal.jsonl");
        let held = reconflow::store::JournalStore::open(&journal).unwrap();

        reconflow(&dir)
            .args(["scan", "example.com", "--profile", "subdomain"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("in use by another reconflow process"));

        // Read-only commands still work alongside the holder
        reconflow(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No scans"));

        drop(held);
    }

    #[cfg(unix)]
    fn write_shell_enumerator(dir: &TempDir) {
        fs::write(
            dir.path().join("reconflow.toml"),
            r#"
[stages.enumerate-subdomains]
command = ["sh", "-c", "printf 'a.{target}\nb.{target}\n'"]
timeout_secs = 30
"#,
        )
        .unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_end_to_end_with_configured_tool() {
        let dir = create_temp_project();
        write_shell_enumerator(&dir);

        reconflow(&dir)
            .args(["scan", "example.com", "--profile", "subdomain", "--ui", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"event\":\"submitted\""))
            .stdout(predicate::str::contains("\"event\":\"scan_finished\""))
            .stdout(predicate::str::contains("\"status\":\"completed\""))
            .stdout(predicate::str::contains("\"subdomains\":2"))
            .stdout(predicate::str::contains("\"event\":\"new_subdomains\""))
            .stdout(predicate::str::contains("\"new_subdomains\":2"));

        assert!(dir.path().join(".reconflow/journal.jsonl").exists());

        reconflow(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("example.com"))
            .stdout(predicate::str::contains("completed"));

        reconflow(&dir)
            .args(["status", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"target\": \"example.com\""));

        // Nothing is old enough to purge
        reconflow(&dir)
            .args(["cleanup", "--days", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No finished scans older than 1 days."));
    }

    #[cfg(unix)]
    #[test]
    fn test_rescan_reports_no_new_subdomains() {
        let dir = create_temp_project();
        write_shell_enumerator(&dir);
        let scan = || {
            let mut cmd = reconflow(&dir);
            cmd.args(["scan", "example.com", "--profile", "subdomain", "--ui", "json"]);
            cmd
        };

        scan()
            .assert()
            .success()
            .stdout(predicate::str::contains("\"hosts\":[\"a.example.com\",\"b.example.com\"]"));

        scan()
            .assert()
            .success()
            .stdout(predicate::str::contains("\"subdomains\":2"))
            .stdout(predicate::str::contains("\"event\":\"new_subdomains\"").not())
            .stdout(predicate::str::contains("\"new_subdomains\":0"));
    }

    #[cfg(unix)]
    #[test]
    fn test_ephemeral_scan_writes_no_journal() {
        let dir = create_temp_project();
        write_shell_enumerator(&dir);

        reconflow(&dir)
            .args([
                "scan",
                "example.com",
                "--profile",
                "subdomain",
                "--ui",
                "minimal",
                "--ephemeral",
            ])
            .assert()
            .success();

        assert!(!dir.path().join(".reconflow/journal.jsonl").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_fails_when_every_stage_fails() {
        let dir = create_temp_project();
        fs::write(
            dir.path().join("reconflow.toml"),
            r#"
[retry]
max_attempts = 1

[stages.enumerate-subdomains]
command = ["sh", "-c", "echo boom >&2; exit 3"]
"#,
        )
        .unwrap();

        reconflow(&dir)
            .args([
                "scan",
                "example.com",
                "--profile",
                "subdomain",
                "--ui",
                "json",
                "--ephemeral",
            ])
            .assert()
            .failure()
            .stdout(predicate::str::contains("\"status\":\"failed\""))
            .stderr(predicate::str::contains("no stage succeeded"));
    }
}
