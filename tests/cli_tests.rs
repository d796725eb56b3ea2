//! Binary smoke tests for the `validate` subcommand.

use assert_cmd::Command;
use predicates::prelude::*;

const CONFIG: &str = r#"
providers:
  - name: offline
    service: mock
    runs:
      - name: echo
        model: none
      - name: echo-again
        model: none
"#;

const TASKS: &str = r#"
tasks:
  - name: capital
    prompt: Capital of France?
    response_format:
      text: one word
    expected: ["Paris"]
"#;

#[test]
fn validate_accepts_well_formed_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.yaml");
    let tasks = dir.path().join("tasks.yaml");
    std::fs::write(&config, CONFIG).unwrap();
    std::fs::write(&tasks, TASKS).unwrap();

    Command::cargo_bin("mindtrial")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .arg("--tasks")
        .arg(&tasks)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("2 executions per batch"));
}

#[test]
fn validate_rejects_duplicate_run_names() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.yaml");
    let tasks = dir.path().join("tasks.yaml");
    std::fs::write(&config, CONFIG.replace("echo-again", "echo")).unwrap();
    std::fs::write(&tasks, TASKS).unwrap();

    Command::cargo_bin("mindtrial")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .arg("--tasks")
        .arg(&tasks)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate run"));
}

#[test]
fn validate_fails_on_missing_file() {
    Command::cargo_bin("mindtrial")
        .unwrap()
        .args(["--config", "does-not-exist.yaml", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does-not-exist.yaml"));
}
