//! CLI surface tests: `--version` and `--validate`.

#![allow(clippy::unwrap_used)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn write_actions(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn version_prints_and_exits_zero() {
    Command::cargo_bin("rec")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("rec"));
}

#[test]
fn validate_prints_action_table() {
    let actions = write_actions(
        r#"
on:
  alert.created:
    name: handle_alert
    script: ./scripts/handle.sh
callable:
  restart_service:
    script: ./scripts/restart.sh
    timeout: 60
"#,
    );

    Command::cargo_bin("rec")
        .unwrap()
        .args(["--actions"])
        .arg(actions.path())
        .arg("--validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("handle_alert"))
        .stdout(predicate::str::contains("restart_service"))
        .stdout(predicate::str::contains("configuration valid"));
}

#[test]
fn validate_rejects_duplicate_ids() {
    let actions = write_actions(
        r#"
on:
  alert.created:
    name: restart_service
    script: ./a.sh
callable:
  restart_service:
    script: ./b.sh
"#,
    );

    Command::cargo_bin("rec")
        .unwrap()
        .args(["--actions"])
        .arg(actions.path())
        .arg("--validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Duplicate action id"));
}

#[test]
fn validate_rejects_action_with_both_bodies() {
    let actions = write_actions(
        r#"
callable:
  confused:
    script: ./a.sh
    http:
      url: https://example.com
"#,
    );

    Command::cargo_bin("rec")
        .unwrap()
        .args(["--actions"])
        .arg(actions.path())
        .arg("--validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("actions file error"));
}

#[test]
fn missing_actions_file_fails() {
    Command::cargo_bin("rec")
        .unwrap()
        .args(["--actions", "/nonexistent/actions.yaml", "--validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("actions file error"));
}

#[test]
fn bad_main_config_fails_before_actions_load() {
    let config = {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(b"[pool]\nmin_workers = 5\nmax_workers = 1\n")
            .unwrap();
        file
    };
    let actions = write_actions("{}");

    Command::cargo_bin("rec")
        .unwrap()
        .args(["--config"])
        .arg(config.path())
        .args(["--actions"])
        .arg(actions.path())
        .arg("--validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration error"));
}
