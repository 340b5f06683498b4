//! Merge-driver scenarios: file-level 3-way merges the way git invokes them,
//! plus determinism and idempotence properties.

mod common;

use beadsd::merge::{merge_files, merge_issues};
use beadsd::model::Status;
use beadsd::sync::{find_conflict_marker, parse_jsonl};
use common::{issue, ts, write_jsonl};
use proptest::prelude::*;
use std::fs;
use tempfile::TempDir;

fn merge_dir() -> (TempDir, std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("base.jsonl");
    let left = temp.path().join("left.jsonl");
    let right = temp.path().join("right.jsonl");
    (temp, base, left, right)
}

#[test]
fn disjoint_edits_merge_without_conflict() {
    let (_temp, base_path, left_path, right_path) = merge_dir();

    let base = issue("bd-1", "T", 100);
    let mut left = base.clone();
    left.title = "T2".to_string();
    left.updated_at = ts(200);
    let mut right = base.clone();
    right.status = Status::InProgress;
    right.updated_at = ts(300);

    write_jsonl(&base_path, &[base]);
    write_jsonl(&left_path, &[left]);
    write_jsonl(&right_path, &[right]);

    let (content, had_conflicts) = merge_files(&base_path, &left_path, &right_path).unwrap();
    assert!(!had_conflicts);

    let merged = parse_jsonl(content.as_bytes()).unwrap();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].title, "T2");
    assert_eq!(merged[0].status, Status::InProgress);
    assert_eq!(merged[0].updated_at, ts(300));
    assert!(find_conflict_marker(content.as_bytes()).is_none());
}

#[test]
fn conflicting_title_emits_block_and_blocks_import() {
    let (_temp, base_path, left_path, right_path) = merge_dir();

    let base = issue("bd-1", "T", 100);
    let mut left = base.clone();
    left.title = "Tl".to_string();
    let mut right = base.clone();
    right.title = "Tr".to_string();

    write_jsonl(&base_path, &[base]);
    write_jsonl(&left_path, &[left]);
    write_jsonl(&right_path, &[right]);

    let (content, had_conflicts) = merge_files(&base_path, &left_path, &right_path).unwrap();
    assert!(had_conflicts);

    // Left wins in the merged record; all three lines appear in the block.
    let first_line = content.lines().next().unwrap();
    assert!(first_line.contains("\"title\":\"Tl\""));
    assert!(content.contains("\"title\":\"T\""));
    assert!(content.contains("\"title\":\"Tr\""));

    // The envelope is exactly what the importer refuses.
    assert!(find_conflict_marker(content.as_bytes()).is_some());
}

#[test]
fn driver_binary_rewrites_left_and_signals_conflicts() {
    let (_temp, base_path, left_path, right_path) = merge_dir();

    let base = issue("bd-1", "T", 100);
    let mut left = base.clone();
    left.title = "Tl".to_string();
    let mut right = base.clone();
    right.title = "Tr".to_string();

    write_jsonl(&base_path, &[base]);
    write_jsonl(&left_path, &[left]);
    write_jsonl(&right_path, &[right]);

    // git merge drivers signal conflicts via a non-zero exit.
    assert_cmd::Command::cargo_bin("beadsd")
        .unwrap()
        .arg("merge")
        .arg(&base_path)
        .arg(&left_path)
        .arg(&right_path)
        .assert()
        .code(1)
        .stderr(predicates::str::contains("conflicts"));

    let rewritten = fs::read_to_string(&left_path).unwrap();
    assert!(rewritten.lines().next().unwrap().contains("\"title\":\"Tl\""));
    assert!(rewritten.contains("<<<<<<< LEFT"));
    assert!(rewritten.contains(">>>>>>> RIGHT"));
}

#[test]
fn driver_binary_clean_merge_exits_zero() {
    let (_temp, base_path, left_path, right_path) = merge_dir();

    let base = issue("bd-1", "T", 100);
    let mut left = base.clone();
    left.description = Some("details".to_string());

    write_jsonl(&base_path, &[base.clone()]);
    write_jsonl(&left_path, &[left.clone()]);
    write_jsonl(&right_path, &[base]);

    assert_cmd::Command::cargo_bin("beadsd")
        .unwrap()
        .arg("merge")
        .arg(&base_path)
        .arg(&left_path)
        .arg(&right_path)
        .assert()
        .success();

    let merged = parse_jsonl(&fs::read(&left_path).unwrap()).unwrap();
    assert_eq!(merged[0].description.as_deref(), Some("details"));
}

#[test]
fn blank_lines_in_inputs_are_tolerated() {
    let (_temp, base_path, left_path, right_path) = merge_dir();

    let record = issue("bd-1", "T", 100);
    let line = serde_json::to_string(&record).unwrap();
    fs::write(&base_path, format!("\n{line}\n\n")).unwrap();
    fs::write(&left_path, format!("{line}\n")).unwrap();
    fs::write(&right_path, format!("\n{line}\n")).unwrap();

    let (content, had_conflicts) = merge_files(&base_path, &left_path, &right_path).unwrap();
    assert!(!had_conflicts);
    assert_eq!(parse_jsonl(content.as_bytes()).unwrap().len(), 1);
}

// === Properties ===

prop_compose! {
    fn arb_issue()(
        idx in 1u32..6,
        created in 0i64..4,
        title in "[a-z]{1,8}",
        closed in any::<bool>(),
        priority in 0i32..5,
    ) -> beadsd::model::Issue {
        let mut record = issue(&format!("bd-{idx}"), &title, i64::from(idx) * 10 + created);
        record.priority = beadsd::model::Priority(priority);
        if closed {
            record.status = Status::Closed;
            record.closed_at = Some(record.updated_at);
        }
        record
    }
}

fn dedup_by_key(issues: Vec<beadsd::model::Issue>) -> Vec<beadsd::model::Issue> {
    let mut map = std::collections::BTreeMap::new();
    for record in issues {
        map.insert(record.key(), record);
    }
    map.into_values().collect()
}

proptest! {
    #[test]
    fn merge_is_deterministic(
        base in proptest::collection::vec(arb_issue(), 0..5),
        left in proptest::collection::vec(arb_issue(), 0..5),
        right in proptest::collection::vec(arb_issue(), 0..5),
    ) {
        let one = merge_issues(&base, &left, &right).render().unwrap();
        let two = merge_issues(&base, &left, &right).render().unwrap();
        prop_assert_eq!(one, two);
    }

    #[test]
    fn merge_of_identical_states_is_identity(
        state in proptest::collection::vec(arb_issue(), 0..5),
    ) {
        let state = dedup_by_key(state);
        let outcome = merge_issues(&state, &state, &state);
        prop_assert!(!outcome.had_conflicts());
        prop_assert_eq!(outcome.merged, state);
    }

    #[test]
    fn merge_with_equal_left_right_returns_that_side(
        base in proptest::collection::vec(arb_issue(), 0..5),
        side in proptest::collection::vec(arb_issue(), 0..5),
    ) {
        let base = dedup_by_key(base);
        let side = dedup_by_key(side);
        let outcome = merge_issues(&base, &side, &side);
        prop_assert!(!outcome.had_conflicts());
        prop_assert_eq!(outcome.merged, side);
    }

    #[test]
    fn no_duplicate_keys_in_output(
        base in proptest::collection::vec(arb_issue(), 0..6),
        left in proptest::collection::vec(arb_issue(), 0..6),
        right in proptest::collection::vec(arb_issue(), 0..6),
    ) {
        let outcome = merge_issues(&base, &left, &right);
        let mut keys: Vec<_> = outcome.merged.iter().map(beadsd::model::Issue::key).collect();
        let before = keys.len();
        keys.dedup();
        prop_assert_eq!(before, keys.len());
    }
}
