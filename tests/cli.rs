use assert_fs::prelude::*;
use assert_fs::TempDir;
use std::process::Command;

/// Integration tests for restic-monitor CLI commands
/// These tests run the actual binary and verify its behavior

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_restic-monitor"))
}

#[test]
fn test_cli_help() {
    let output = bin().arg("--help").output().expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("doctor"));
    assert!(stdout.contains("--config"));
}

#[test]
fn test_cli_version() {
    let output = bin().arg("--version").output().expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("restic-monitor"));
}

#[test]
fn test_missing_config_fails() {
    let temp = TempDir::new().unwrap();
    let output = bin()
        .args(["--config", temp.child("missing.yaml").path().to_str().unwrap(), "doctor"])
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_invalid_yaml_fails() {
    let temp = TempDir::new().unwrap();
    let config = temp.child("config.yaml");
    config.write_str("repos: [this, is, not, a, map]\n").unwrap();

    let output = bin()
        .args(["--config", config.path().to_str().unwrap(), "doctor"])
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to parse config file"));
}

#[test]
fn test_run_without_valid_repos_fails() {
    let temp = TempDir::new().unwrap();
    let config = temp.child("config.yaml");
    config
        .write_str("repos:\n  broken:\n    repository: \"\"\n")
        .unwrap();

    let output = bin()
        .args(["--config", config.path().to_str().unwrap(), "run", "--dry-run"])
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No valid repositories"));
}

#[test]
fn test_doctor_reports_missing_restic() {
    let temp = TempDir::new().unwrap();
    let config = temp.child("config.yaml");
    config
        .write_str(
            r#"
repos:
  home:
    repository: /srv/restic/home
restic:
  binary: /nonexistent/restic
"#,
        )
        .unwrap();

    let output = bin()
        .args(["--config", config.path().to_str().unwrap(), "doctor"])
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Diagnostics"));
    assert!(stdout.contains("restic not found"));
    assert!(stdout.contains("home configured"));
    assert!(stdout.contains("Some checks failed (1 errors"));
}
