//! Three-way merge of JSONL issue files.
//!
//! Invoked by git as a merge driver on `issues.jsonl`. The engine is a pure
//! function over the `(base, left, right)` inputs: no storage, no daemon, no
//! side effects, so it runs wherever git runs. Records are matched by
//! `IssueKey = (id, created_at)`; the sorted key union makes output bytes
//! reproducible for any fixed input triple.
//!
//! On conflict the merged content is still produced (left wins field-wise)
//! and a git-style conflict block carrying the full left/base/right JSON
//! lines is appended; the auto-import pipeline refuses files containing such
//! blocks until an operator resolves them.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::model::{Issue, IssueKey, Status};
use crate::sync::parse_jsonl;

/// Labels used in conflict envelopes.
const LEFT_LABEL: &str = "LEFT";
const BASE_LABEL: &str = "BASE";
const RIGHT_LABEL: &str = "RIGHT";

/// Result of merging three JSONL states.
#[derive(Debug)]
pub struct MergeOutcome {
    /// Merged records in sorted key order.
    pub merged: Vec<Issue>,
    /// Keys that required a conflict block, in sorted order.
    pub conflicts: Vec<ConflictRecord>,
}

impl MergeOutcome {
    #[must_use]
    pub fn had_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Render the merged file: one JSON line per record, then conflict
    /// blocks. Deterministic for fixed inputs.
    pub fn render(&self) -> Result<String> {
        let mut out = String::new();
        for issue in &self.merged {
            out.push_str(&serde_json::to_string(issue)?);
            out.push('\n');
        }
        for conflict in &self.conflicts {
            conflict.render(&mut out)?;
        }
        Ok(out)
    }
}

/// An irreconcilable record, serialized as a git-style conflict envelope.
#[derive(Debug)]
pub struct ConflictRecord {
    pub key: IssueKey,
    pub left: Option<Issue>,
    pub base: Option<Issue>,
    pub right: Option<Issue>,
}

impl ConflictRecord {
    fn render(&self, out: &mut String) -> Result<()> {
        let _ = writeln!(out, "<<<<<<< {LEFT_LABEL}");
        if let Some(issue) = &self.left {
            out.push_str(&serde_json::to_string(issue)?);
            out.push('\n');
        }
        let _ = writeln!(out, "||||||| {BASE_LABEL}");
        if let Some(issue) = &self.base {
            out.push_str(&serde_json::to_string(issue)?);
            out.push('\n');
        }
        out.push_str("=======\n");
        if let Some(issue) = &self.right {
            out.push_str(&serde_json::to_string(issue)?);
            out.push('\n');
        }
        let _ = writeln!(out, ">>>>>>> {RIGHT_LABEL}");
        Ok(())
    }
}

/// Merge three parsed issue sets.
#[must_use]
pub fn merge_issues(base: &[Issue], left: &[Issue], right: &[Issue]) -> MergeOutcome {
    let base_map = key_map(base);
    let left_map = key_map(left);
    let right_map = key_map(right);

    let mut keys: BTreeSet<IssueKey> = BTreeSet::new();
    keys.extend(base_map.keys().cloned());
    keys.extend(left_map.keys().cloned());
    keys.extend(right_map.keys().cloned());

    let mut outcome = MergeOutcome {
        merged: Vec::new(),
        conflicts: Vec::new(),
    };

    for key in keys {
        let b = base_map.get(&key);
        let l = left_map.get(&key);
        let r = right_map.get(&key);

        match (b, l, r) {
            (None, None, None) => {}

            // Present everywhere: merge field by field.
            (Some(b), Some(l), Some(r)) => {
                let (merged, conflicting) = merge_record(b, l, r);
                if conflicting {
                    outcome.conflicts.push(ConflictRecord {
                        key,
                        left: Some((*l).clone()),
                        base: Some((*b).clone()),
                        right: Some((*r).clone()),
                    });
                }
                outcome.merged.push(merged);
            }

            // Added on both sides.
            (None, Some(l), Some(r)) => {
                if l == r {
                    outcome.merged.push((*l).clone());
                } else {
                    outcome.merged.push((*l).clone());
                    outcome.conflicts.push(ConflictRecord {
                        key,
                        left: Some((*l).clone()),
                        base: None,
                        right: Some((*r).clone()),
                    });
                }
            }

            // Deleted on the right.
            (Some(b), Some(l), None) => {
                if *b == *l {
                    // Unmodified since base: accept the deletion.
                } else {
                    outcome.merged.push((*l).clone());
                    outcome.conflicts.push(ConflictRecord {
                        key,
                        left: Some((*l).clone()),
                        base: Some((*b).clone()),
                        right: None,
                    });
                }
            }

            // Deleted on the left.
            (Some(b), None, Some(r)) => {
                if *b == *r {
                    // Unmodified since base: accept the deletion.
                } else {
                    outcome.merged.push((*r).clone());
                    outcome.conflicts.push(ConflictRecord {
                        key,
                        left: None,
                        base: Some((*b).clone()),
                        right: Some((*r).clone()),
                    });
                }
            }

            // One-sided additions and deletions.
            (None, Some(l), None) => outcome.merged.push((*l).clone()),
            (None, None, Some(r)) => outcome.merged.push((*r).clone()),
            (Some(_), None, None) => {}
        }
    }

    outcome
}

/// Merge the three input files and return the merged content.
pub fn merge_files(base: &Path, left: &Path, right: &Path) -> Result<(String, bool)> {
    let base_issues = parse_jsonl(&fs::read(base)?)?;
    let left_issues = parse_jsonl(&fs::read(left)?)?;
    let right_issues = parse_jsonl(&fs::read(right)?)?;

    let outcome = merge_issues(&base_issues, &left_issues, &right_issues);
    Ok((outcome.render()?, outcome.had_conflicts()))
}

fn key_map(issues: &[Issue]) -> BTreeMap<IssueKey, &Issue> {
    // Later lines win on duplicate keys within one file; the invariant that a
    // file never carries two records with the same key is enforced here.
    issues.iter().map(|issue| (issue.key(), issue)).collect()
}

/// Field-level merge of a record present in all three states.
///
/// Returns the merged record and whether any scalar field had all three
/// values pairwise distinct (the record-level conflict signal).
fn merge_record(base: &Issue, left: &Issue, right: &Issue) -> (Issue, bool) {
    let mut merged = left.clone();
    let mut conflicting = false;

    macro_rules! scalar {
        ($field:ident) => {
            merged.$field = pick_scalar(
                &base.$field,
                &left.$field,
                &right.$field,
                &mut conflicting,
            );
        };
    }

    scalar!(title);
    scalar!(description);
    scalar!(design);
    scalar!(acceptance_criteria);
    scalar!(notes);
    scalar!(status);
    scalar!(issue_type);
    scalar!(priority);
    scalar!(assignee);
    scalar!(external_ref);
    scalar!(source_repo);

    merged.dependencies = union_dependencies(left, right);
    merged.labels = union_labels(left, right);
    merged.comments = union_comments(left, right);

    merged.updated_at = left.updated_at.max(right.updated_at);
    merged.closed_at = match (left.closed_at, right.closed_at) {
        (Some(l), Some(r)) => Some(l.max(r)),
        (Some(l), None) => Some(l),
        (None, Some(r)) => Some(r),
        (None, None) => None,
    };
    // A record merged back to a non-closed status sheds any closure stamp.
    if merged.status != Status::Closed {
        merged.closed_at = None;
    }

    (merged, conflicting)
}

/// One-side-changed wins; both-changed (or neither) takes left. All three
/// pairwise distinct flags the enclosing record as conflicting.
fn pick_scalar<T: Clone + PartialEq>(base: &T, left: &T, right: &T, conflicting: &mut bool) -> T {
    if left != right && left != base && right != base {
        *conflicting = true;
    }

    if base == left && base != right {
        right.clone()
    } else {
        left.clone()
    }
}

fn union_dependencies(left: &Issue, right: &Issue) -> Vec<crate::model::Dependency> {
    let mut seen: HashSet<(String, String, String)> = HashSet::new();
    let mut out = Vec::new();

    for dep in left.dependencies.iter().chain(right.dependencies.iter()) {
        let (a, b, c) = dep.dedup_key();
        if seen.insert((a.to_string(), b.to_string(), c.to_string())) {
            out.push(dep.clone());
        }
    }
    out
}

fn union_labels(left: &Issue, right: &Issue) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for label in left.labels.iter().chain(right.labels.iter()) {
        if seen.insert(label.clone()) {
            out.push(label.clone());
        }
    }
    out
}

fn union_comments(left: &Issue, right: &Issue) -> Vec<crate::model::Comment> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for comment in left.comments.iter().chain(right.comments.iter()) {
        let key = (
            comment.author.clone(),
            comment.body.clone(),
            comment.created_at,
        );
        if seen.insert(key) {
            out.push(comment.clone());
        }
    }
    out
}
