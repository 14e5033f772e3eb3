use std::fs;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn prints_version() {
    let exe = env!("CARGO_BIN_EXE_social-tui");
    let output = Command::new(exe)
        .arg("--version")
        .output()
        .expect("run social-tui --version");
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("stdout utf8");
    assert!(
        stdout.contains(env!("CARGO_PKG_VERSION")),
        "stdout was: {}",
        stdout.trim()
    );
}

#[test]
fn prints_help() {
    Command::cargo_bin("social-tui")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--version"))
        .stdout(predicate::str::contains("--token <TOKEN>"))
        .stdout(predicate::str::contains("--demo"));
}

#[test]
fn token_is_saved_to_the_given_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("social").join("config.yaml");

    Command::cargo_bin("social-tui")
        .unwrap()
        .arg("--config")
        .arg(&path)
        .args(["--token", "  secret-token  "])
        .assert()
        .success()
        .stdout(predicate::str::contains("Saved access token"));

    let saved = fs::read_to_string(&path).unwrap();
    assert!(saved.contains("token: secret-token"), "config was: {saved}");
}

#[test]
fn token_needs_a_value() {
    Command::cargo_bin("social-tui")
        .unwrap()
        .arg("--token")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--token needs a value"));
}

#[test]
fn unknown_flags_are_rejected() {
    Command::cargo_bin("social-tui")
        .unwrap()
        .arg("--frobnicate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown argument"));
}
