//! CLI integration tests for mssql-bulk-sync.
//!
//! These tests verify argument parsing, configuration commands and exit
//! codes. Nothing here needs a database.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
settings:
  default_batch_size: 500
jobs:
  orders:
    area: Sales
    source:
      connection_string: "Server=src.example.com,1433;Database=Shop;User Id=sync;Password=hunter2"
    target:
      connection_string: "Server=dst.example.com,1433;Database=Replica;User Id=sync;Password=hunter2"
    tables:
      orders: dbo.Orders
      lines: dbo.OrderLines
    target_tables:
      lines: archive.OrderLines
    schedules:
      midnight: true
  audit:
    area: Ops
    manual: true
    source:
      connection_string: "Server=src.example.com;Database=Ops"
    target:
      connection_string: "Server=dst.example.com;Database=OpsReplica"
    tables:
      audit: dbo.Audit
"#;

/// Get a command for the mssql-bulk-sync binary.
fn cmd() -> Command {
    Command::cargo_bin("mssql-bulk-sync").unwrap()
}

fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", content).unwrap();
    file
}

fn with_config(file: &NamedTempFile) -> Command {
    let mut command = cmd();
    command.args(["--config", file.path().to_str().unwrap()]);
    command
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("areas"))
        .stdout(predicate::str::contains("ids"))
        .stdout(predicate::str::contains("show"))
        .stdout(predicate::str::contains("schema"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("schedule"));
}

#[test]
fn test_global_flag_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: sync.yaml]"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--seed"))
        .stdout(predicate::str::contains("<AREA>"))
        .stdout(predicate::str::contains("<ID>"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mssql-bulk-sync"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_is_io_error() {
    cmd()
        .args(["--config", "nonexistent_sync.yaml", "validate"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("IO error"));
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let file = config_file("jobs: [\n");
    with_config(&file).arg("validate").assert().code(2);
}

#[test]
fn test_config_without_jobs_exits_with_code_2() {
    let file = config_file("settings:\n  default_batch_size: 10\n");
    with_config(&file).arg("validate").assert().code(2);
}

#[test]
fn test_unknown_verbosity_is_config_error() {
    let file = config_file(CONFIG);
    with_config(&file)
        .args(["--verbosity", "chatty", "validate"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown verbosity"));
}

// =============================================================================
// Configuration Commands
// =============================================================================

#[test]
fn test_validate_reports_job_count() {
    let file = config_file(CONFIG);
    with_config(&file)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("2 jobs"));
}

#[test]
fn test_areas() {
    let file = config_file(CONFIG);
    with_config(&file)
        .arg("areas")
        .assert()
        .success()
        .stdout(predicate::str::contains("Sales"))
        .stdout(predicate::str::contains("Ops"));
}

#[test]
fn test_ids_ignores_area_case() {
    let file = config_file(CONFIG);
    with_config(&file)
        .args(["--output-json", "ids", "sales"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"orders\""))
        .stdout(predicate::str::contains("audit").not());
}

#[test]
fn test_ids_unknown_area() {
    let file = config_file(CONFIG);
    with_config(&file)
        .args(["ids", "Finance"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_show_resolves_tables_without_secrets() {
    let file = config_file(CONFIG);
    with_config(&file)
        .args(["show", "Sales", "orders"])
        .assert()
        .success()
        .stdout(predicate::str::contains("archive.OrderLines"))
        .stdout(predicate::str::contains("dbo.Orders"))
        .stdout(predicate::str::contains("hunter2").not())
        .stdout(predicate::str::contains("Server=").not());
}

#[test]
fn test_show_job_in_wrong_area() {
    let file = config_file(CONFIG);
    with_config(&file)
        .args(["show", "Ops", "orders"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("job 'orders' not found in area 'Ops'"));
}

#[test]
fn test_run_unknown_job() {
    let file = config_file(CONFIG);
    with_config(&file)
        .args(["run", "Sales", "missing"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_schema_unknown_job() {
    let file = config_file(CONFIG);
    with_config(&file)
        .args(["schema", "Sales", "missing"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not found"));
}

// =============================================================================
// Schedule Command
// =============================================================================

#[test]
fn test_schedule_without_jobs_runs_nothing() {
    let file = config_file(CONFIG);
    with_config(&file).args(["schedule", "noon"]).assert().success();
}

#[test]
fn test_schedule_past_due_runs_nothing() {
    let file = config_file(CONFIG);
    with_config(&file)
        .args(["schedule", "Midnight", "--past-due"])
        .assert()
        .success();
}

#[test]
fn test_schedule_rejects_unknown_name() {
    let file = config_file(CONFIG);
    with_config(&file)
        .args(["schedule", "weekly"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown schedule 'weekly'"));
}
