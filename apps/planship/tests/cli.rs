use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_both_subcommands() {
    Command::cargo_bin("planship")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("publish"))
        .stdout(predicate::str::contains("sync-features"));
}

#[test]
fn publish_without_credentials_fails_before_any_network_call() {
    Command::cargo_bin("planship")
        .unwrap()
        .env_clear()
        .arg("publish")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Missing required environment variables"));
}

#[test]
fn sync_features_without_credentials_fails() {
    Command::cargo_bin("planship")
        .unwrap()
        .env_clear()
        .args(["sync-features", "--pattern", "nothing/*.feature"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Missing required environment variables"));
}
