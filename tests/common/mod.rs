//! Shared fixtures for integration tests.

#![allow(dead_code)]

use beadsd::model::{Issue, IssueType, Priority, Status};
use chrono::{DateTime, TimeZone, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn issue(id: &str, title: &str, created: i64) -> Issue {
    Issue {
        id: id.to_string(),
        title: title.to_string(),
        description: None,
        design: None,
        acceptance_criteria: None,
        notes: None,
        status: Status::Open,
        priority: Priority::MEDIUM,
        issue_type: IssueType::Task,
        assignee: None,
        external_ref: None,
        source_repo: None,
        created_at: ts(created),
        updated_at: ts(created),
        closed_at: None,
        labels: vec![],
        dependencies: vec![],
        comments: vec![],
    }
}

/// Serialize issues to a JSONL file, one record per line.
pub fn write_jsonl(path: &Path, issues: &[Issue]) {
    let mut contents = String::new();
    for issue in issues {
        contents.push_str(&serde_json::to_string(issue).unwrap());
        contents.push('\n');
    }
    fs::write(path, contents).unwrap();
}

/// A workspace with a `.beads` directory and an empty canonical database
/// file.
pub struct Workspace {
    pub root: TempDir,
    pub beads_dir: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let beads_dir = root.path().join(".beads");
        fs::create_dir(&beads_dir).unwrap();
        fs::write(beads_dir.join("beads.db"), b"").unwrap();
        Self { root, beads_dir }
    }

    pub fn jsonl_path(&self) -> PathBuf {
        self.beads_dir.join("issues.jsonl")
    }
}
