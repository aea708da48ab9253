//! End-to-end tests of the `genflow` binary

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn genflow() -> Command {
    let mut cmd = Command::cargo_bin("genflow").unwrap();
    cmd.env_remove("GENFLOW_CONFIG")
        .env_remove("GENFLOW_DATABASE__URL")
        .env("GENFLOW_LOG_LEVEL", "error");
    cmd
}

#[test]
fn test_help_lists_commands() {
    genflow()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("init-log"));
}

#[test]
fn test_run_without_model_fails() {
    genflow()
        .arg("run")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("run_model"));
}

#[test]
fn test_config_show_masks_password() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("genflow.toml");
    fs::write(
        &path,
        "[database]\nurl = \"postgresql://etl:hunter2@db:5432/warehouse\"\n\n[engine]\nbatch_size = 250\n",
    )
    .unwrap();

    genflow()
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("batch_size = 250"))
        .stdout(predicate::str::contains("etl:****@db"))
        .stdout(predicate::str::contains("hunter2").not());

    genflow()
        .args(["config", "show", "--show-passwords", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("hunter2"));
}

#[test]
fn test_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("genflow.toml");
    fs::write(&path, "[engine]\nbatch_size = 0\n").unwrap();

    genflow()
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}
