//! Command line integration tests for the `testagency` binary.

mod common;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn testagency_cmd() -> Command {
    Command::cargo_bin("testagency").unwrap()
}

#[test]
fn test_help_lists_commands() {
    testagency_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("explore"))
        .stdout(predicate::str::contains("frameworks"));
}

#[test]
fn test_validate_accepts_config() {
    let dir = TempDir::new().unwrap();
    let config = common::write_config(dir.path());

    testagency_cmd()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Current runtime: net-4.0"));
}

#[test]
fn test_validate_rejects_unknown_runtime() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("testagency.toml");
    fs::write(&config, "[runtime]\ncurrent = \"cobol-1.0\"\n").unwrap();

    testagency_cmd()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_frameworks_lists_available_runtimes() {
    let dir = TempDir::new().unwrap();
    let config = common::write_config(dir.path());

    testagency_cmd()
        .arg("--config")
        .arg(&config)
        .arg("frameworks")
        .assert()
        .success()
        .stdout(predicate::str::contains("Current runtime: net-4.0"))
        .stdout(predicate::str::contains("net-2.0"));
}

#[test]
fn test_run_reports_missing_file() {
    let dir = TempDir::new().unwrap();
    let config = common::write_config(dir.path());

    testagency_cmd()
        .arg("--config")
        .arg(&config)
        .args(["run", "--process", "single"])
        .arg(dir.path().join("missing_tests"))
        .assert()
        .failure()
        .stdout(predicate::str::contains("Some tests failed."))
        .stdout(predicate::str::contains("File not found"));
}

#[test]
fn test_run_rejects_malformed_setting() {
    let dir = TempDir::new().unwrap();
    let config = common::write_config(dir.path());

    testagency_cmd()
        .arg("--config")
        .arg(&config)
        .args(["run", "--setting", "NoEqualsSign", "some_tests"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected key=value"));
}

#[test]
fn test_run_rejects_unknown_process_model() {
    testagency_cmd()
        .args(["run", "--process", "sideways", "some_tests"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown process model"));
}

#[cfg(unix)]
mod executables {
    use super::*;

    #[test]
    fn test_run_passing_executable() {
        let dir = TempDir::new().unwrap();
        let config = common::write_config(dir.path());
        let exe = common::write_test_executable(dir.path(), "math_tests", common::PASSING_SCRIPT);

        testagency_cmd()
            .arg("--config")
            .arg(&config)
            .args(["run", "--process", "single"])
            .arg(&exe)
            .assert()
            .success()
            .stdout(predicate::str::contains("Passed:    2"))
            .stdout(predicate::str::contains("All tests passed!"));
    }

    #[test]
    fn test_run_failing_executable_exits_nonzero() {
        let dir = TempDir::new().unwrap();
        let config = common::write_config(dir.path());
        let exe = common::write_test_executable(dir.path(), "math_tests", common::FAILING_SCRIPT);

        testagency_cmd()
            .arg("--config")
            .arg(&config)
            .args(["run", "--process", "single"])
            .arg(&exe)
            .assert()
            .failure()
            .stdout(predicate::str::contains("math::divides"))
            .stdout(predicate::str::contains("attempt to divide by zero"));
    }

    #[test]
    fn test_explore_lists_cases() {
        let dir = TempDir::new().unwrap();
        let config = common::write_config(dir.path());
        let exe = common::write_test_executable(dir.path(), "math_tests", common::PASSING_SCRIPT);

        testagency_cmd()
            .arg("--config")
            .arg(&config)
            .args(["explore", "--process", "single"])
            .arg(&exe)
            .assert()
            .success()
            .stdout(predicate::str::contains("Found 2 tests:"))
            .stdout(predicate::str::contains("math::subtracts"));
    }

    #[test]
    fn test_explore_json() {
        let dir = TempDir::new().unwrap();
        let config = common::write_config(dir.path());
        let exe = common::write_test_executable(dir.path(), "math_tests", common::PASSING_SCRIPT);

        let output = testagency_cmd()
            .arg("--config")
            .arg(&config)
            .args(["explore", "--process", "single", "--format", "json"])
            .arg(&exe)
            .output()
            .unwrap();
        assert!(output.status.success());

        let tree: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(tree["kind"], "package");
    }

    #[test]
    fn test_run_relative_paths_from_working_dir() {
        let dir = TempDir::new().unwrap();
        let config = common::write_config(dir.path());
        common::write_test_executable(dir.path(), "passing_tests", common::PASSING_SCRIPT);
        common::write_test_executable(dir.path(), "more_tests", common::PASSING_SCRIPT);

        testagency_cmd()
            .current_dir(dir.path())
            .arg("--config")
            .arg(&config)
            .args(["run", "--process", "single", "passing_tests", "more_tests"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Passed:    4"));
    }

    const PROJECT: &str = r#"
active_config = "all"

[[config]]
name = "all"
files = ["passing_tests", "failing_tests"]

[[config]]
name = "passing"
files = ["passing_tests"]
"#;

    fn write_project(dir: &std::path::Path) -> std::path::PathBuf {
        common::write_test_executable(dir, "passing_tests", common::PASSING_SCRIPT);
        common::write_test_executable(dir, "failing_tests", common::FAILING_SCRIPT);
        let project = dir.join("suite.testproj");
        fs::write(&project, PROJECT).unwrap();
        project
    }

    #[test]
    fn test_run_project_uses_active_config() {
        let dir = TempDir::new().unwrap();
        let config = common::write_config(dir.path());
        let project = write_project(dir.path());

        testagency_cmd()
            .arg("--config")
            .arg(&config)
            .args(["run", "--process", "single"])
            .arg(&project)
            .assert()
            .failure()
            .stdout(predicate::str::contains("Passed:    3"))
            .stdout(predicate::str::contains("math::divides"));
    }

    #[test]
    fn test_run_project_with_named_config() {
        let dir = TempDir::new().unwrap();
        let config = common::write_config(dir.path());
        let project = write_project(dir.path());

        testagency_cmd()
            .arg("--config")
            .arg(&config)
            .args(["run", "--process", "single", "--project-config", "passing"])
            .arg(&project)
            .assert()
            .success()
            .stdout(predicate::str::contains("Passed:    2"))
            .stdout(predicate::str::contains("All tests passed!"));
    }

    #[test]
    fn test_run_project_with_unknown_config_fails() {
        let dir = TempDir::new().unwrap();
        let config = common::write_config(dir.path());
        let project = write_project(dir.path());

        testagency_cmd()
            .arg("--config")
            .arg(&config)
            .args(["run", "--process", "single", "--project-config", "profile"])
            .arg(&project)
            .assert()
            .failure()
            .stderr(predicate::str::contains("no configuration named profile"));
    }
}
