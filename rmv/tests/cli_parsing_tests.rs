//! CLI argument parsing tests for rmv.
//!
//! These verify that flags, aliases and value formats keep parsing the same
//! way across versions.

use assert_cmd::Command;

#[test]
fn test_help_runs() {
    Command::cargo_bin("rmv")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn test_version_runs() {
    Command::cargo_bin("rmv")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn test_missing_paths_fail() {
    Command::cargo_bin("rmv").unwrap().assert().failure();
}

#[test]
fn test_single_path_fails() {
    Command::cargo_bin("rmv")
        .unwrap()
        .arg("/tmp/only-one")
        .assert()
        .failure();
}

#[test]
fn test_chunk_size_limit_accepts_human_sizes() {
    for value in ["64MiB", "128 MB", "1GiB"] {
        Command::cargo_bin("rmv")
            .unwrap()
            .args(["--chunk-size-limit", value, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_chunk_size_limit_rejects_garbage() {
    Command::cargo_bin("rmv")
        .unwrap()
        .args(["--chunk-size-limit", "lots", "/tmp/a", "/tmp/b"])
        .assert()
        .failure();
}

#[test]
fn test_max_workers_rejects_non_numeric() {
    Command::cargo_bin("rmv")
        .unwrap()
        .args(["--max-workers", "many", "/tmp/a", "/tmp/b"])
        .assert()
        .failure();
}

#[test]
fn test_verbose_occurrences_accumulate() {
    Command::cargo_bin("rmv")
        .unwrap()
        .args(["-vvv", "--help"])
        .assert()
        .success();
}

#[test]
fn test_boolean_flags_parse() {
    Command::cargo_bin("rmv")
        .unwrap()
        .args([
            "--copy-only",
            "--create-symlink",
            "--resume",
            "--progress",
            "--summary",
            "--help",
        ])
        .assert()
        .success();
}
