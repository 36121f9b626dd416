//! End-to-end tests driving the built `rmv` binary on real trees.

use predicates::prelude::PredicateBooleanExt;

fn setup_tree(files: &[(&str, &str)]) -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf)
{
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("data");
    let target = tmp.path().join("volume");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::create_dir_all(&target).unwrap();
    for (name, content) in files {
        let path = source.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
    }
    (tmp, source, target)
}

const TREE: &[(&str, &str)] = &[
    ("readme.txt", "hello"),
    ("assets/logo.bin", "logo-bytes"),
    ("assets/icons/small.bin", "small"),
    ("assets/icons/large.bin", "large"),
    ("save/slot1.dat", "slot one"),
];

fn assert_mirrored(target: &std::path::Path) {
    for (name, content) in TREE {
        let path = target.join("data").join(name);
        let found =
            std::fs::read_to_string(&path).unwrap_or_else(|_| panic!("missing {path:?}"));
        assert_eq!(&found, content);
    }
}

#[test]
fn check_rmv_help() {
    let mut cmd = assert_cmd::Command::cargo_bin("rmv").unwrap();
    cmd.arg("--help").assert();
}

#[test]
fn moves_a_tree_and_removes_the_source() {
    let (_tmp, source, target) = setup_tree(TREE);
    let mut cmd = assert_cmd::Command::cargo_bin("rmv").unwrap();
    cmd.args([
        source.to_str().unwrap(),
        target.to_str().unwrap(),
        "--max-workers",
        "2",
        "--subprocess-timeout-sec",
        "30",
    ])
    .assert()
    .success();
    assert_mirrored(&target);
    assert!(!source.exists());
}

#[test]
fn copy_only_keeps_the_source_intact() {
    let (_tmp, source, target) = setup_tree(TREE);
    let mut cmd = assert_cmd::Command::cargo_bin("rmv").unwrap();
    cmd.args([
        source.to_str().unwrap(),
        target.to_str().unwrap(),
        "--copy-only",
        "--max-workers",
        "2",
        "--subprocess-timeout-sec",
        "30",
    ])
    .assert()
    .success();
    assert_mirrored(&target);
    for (name, content) in TREE {
        assert_eq!(
            std::fs::read_to_string(source.join(name)).unwrap(),
            *content
        );
    }
    // no cache residue after a successful run
    assert!(!source.join("_fast_transfer_cache_").exists());
}

#[test]
fn summary_reports_transferred_files() {
    let (_tmp, source, target) = setup_tree(TREE);
    let mut cmd = assert_cmd::Command::cargo_bin("rmv").unwrap();
    cmd.args([
        source.to_str().unwrap(),
        target.to_str().unwrap(),
        "--copy-only",
        "--summary",
        "--subprocess-timeout-sec",
        "30",
    ])
    .assert()
    .success()
    .stdout(
        predicates::str::contains("files transferred: 5")
            .and(predicates::str::contains("tasks failed: 0")),
    );
}

#[test]
fn progress_percentages_reach_one_hundred() {
    let (_tmp, source, target) = setup_tree(TREE);
    let mut cmd = assert_cmd::Command::cargo_bin("rmv").unwrap();
    cmd.args([
        source.to_str().unwrap(),
        target.to_str().unwrap(),
        "--progress",
        "--subprocess-timeout-sec",
        "30",
    ])
    .assert()
    .success()
    .stderr(predicates::str::contains("[100%]"));
}

#[test]
fn missing_source_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cmd = assert_cmd::Command::cargo_bin("rmv").unwrap();
    cmd.args([
        tmp.path().join("absent").to_str().unwrap(),
        tmp.path().join("volume").to_str().unwrap(),
    ])
    .assert()
    .failure();
}

#[test]
fn target_inside_source_fails() {
    let (_tmp, source, _target) = setup_tree(TREE);
    let nested = source.join("inner-target");
    let mut cmd = assert_cmd::Command::cargo_bin("rmv").unwrap();
    cmd.args([source.to_str().unwrap(), nested.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn resume_after_completion_is_a_cheap_no_op() {
    let (_tmp, source, target) = setup_tree(&[("solo.bin", "solo")]);
    // a stored session that says everything is already done
    let cache = source.join("_fast_transfer_cache_");
    std::fs::create_dir_all(&cache).unwrap();
    let session = serde_json::json!({
        "source_dir": source,
        "target_dir": target,
        "total_transfer_size": 4,
        "task_plan": [{
            "type": "pack",
            "task_id": "only-task",
            "pack_id": 1,
            "files": [{"path": source.join("solo.bin"), "size": 4}]
        }],
        "completed_task_ids": ["only-task"]
    });
    std::fs::write(
        cache.join("transfer_session.json"),
        serde_json::to_string_pretty(&session).unwrap(),
    )
    .unwrap();
    let mut cmd = assert_cmd::Command::cargo_bin("rmv").unwrap();
    cmd.args([
        source.to_str().unwrap(),
        target.to_str().unwrap(),
        "--resume",
        "--copy-only",
        "--subprocess-timeout-sec",
        "30",
    ])
    .assert()
    .success();
    // no task ran, the leftover source file was never re-copied
    assert!(!target.join("data").join("solo.bin").exists());
    assert!(!cache.exists());
}
