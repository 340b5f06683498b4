//! Export and auto-import between `SQLite` storage and the JSONL shadow.
//!
//! The JSONL is treated as a content-addressed input rather than an event
//! stream: import is gated on the file's SHA-256 against the stored
//! `last_import_hash`, which makes the pipeline robust to rename-on-write
//! editors and avoids any file watching.

pub mod git;

pub use git::{GitClient, SystemGit};

use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{BeadsError, Result};
use crate::model::Issue;
use crate::storage::{ImportOutcome, SqliteStorage, meta};
use crate::util::{is_valid_id_format, sha256_bytes};

/// Maximum accepted JSONL line length.
pub const MAX_LINE_BYTES: usize = 2 * 1024 * 1024;

/// Git conflict markers refused by the importer.
const CONFLICT_START: &str = "<<<<<<<";
const CONFLICT_SEPARATOR: &str = "=======";
const CONFLICT_END: &str = ">>>>>>>";

/// User-facing message sinks consumed by the pipeline.
///
/// The daemon routes these to `tracing`; tests capture them directly.
pub trait Notifier: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Default notifier backed by the `tracing` macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn debug(&self, message: &str) {
        tracing::debug!("{message}");
    }
    fn info(&self, message: &str) {
        tracing::info!("{message}");
    }
    fn warn(&self, message: &str) {
        tracing::warn!("{message}");
    }
    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }
}

// === Export ===

/// Result of a JSONL export.
#[derive(Debug, Default)]
pub struct ExportResult {
    pub exported_count: usize,
    pub exported_ids: Vec<String>,
    /// Hex SHA-256 of the written bytes.
    pub content_hash: String,
}

/// Export all issues (sorted by ID, relations populated) to `output_path`.
///
/// The write is atomic: content goes to `<output>.tmp` and is renamed over
/// the canonical path. An empty database refuses to overwrite a non-empty
/// JSONL unless `force` is set.
pub fn export_to_jsonl(
    storage: &mut SqliteStorage,
    output_path: &Path,
    force: bool,
) -> Result<ExportResult> {
    let issues = storage.all_issues_for_export()?;

    if issues.is_empty() && !force {
        let existing = count_issue_lines(output_path)?;
        if existing > 0 {
            return Err(BeadsError::Config(format!(
                "Refusing to export an empty database over '{}' ({existing} issues). \
                 This would lose data; set force_empty_export to override.",
                output_path.display()
            )));
        }
    }

    let mut buffer = Vec::with_capacity(issues.len() * 256);
    for issue in &issues {
        serde_json::to_writer(&mut buffer, issue)?;
        buffer.push(b'\n');
    }

    let tmp_path = output_path.with_extension("jsonl.tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&buffer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, output_path)?;

    let exported_ids: Vec<String> = issues.iter().map(|issue| issue.id.clone()).collect();
    storage.clear_dirty_issues(&exported_ids)?;
    storage.set_metadata(meta::LAST_EXPORT_TIME, &Utc::now().to_rfc3339())?;

    Ok(ExportResult {
        exported_count: issues.len(),
        exported_ids,
        content_hash: sha256_bytes(&buffer),
    })
}

fn count_issue_lines(path: &Path) -> Result<usize> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(BeadsError::Io(e)),
    };
    Ok(contents.lines().filter(|l| !l.trim().is_empty()).count())
}

// === Parse ===

/// Stream-decode a JSONL byte buffer into issues.
///
/// Blank lines are skipped; a line over [`MAX_LINE_BYTES`] or a decode error
/// fails with the 1-based line number (decode errors carry an 80-char
/// snippet). The `closed_at` invariant is repaired after decoding.
pub fn parse_jsonl(bytes: &[u8]) -> Result<Vec<Issue>> {
    let now = Utc::now();
    let mut issues = Vec::new();

    for (idx, raw) in bytes.split(|&b| b == b'\n').enumerate() {
        let line_num = idx + 1;
        if raw.len() > MAX_LINE_BYTES {
            return Err(BeadsError::JsonlLineTooLong {
                line: line_num,
                max_bytes: MAX_LINE_BYTES,
            });
        }

        let line = std::str::from_utf8(raw).map_err(|e| BeadsError::JsonlParse {
            line: line_num,
            reason: format!("invalid UTF-8: {e}"),
            snippet: String::new(),
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let mut issue: Issue =
            serde_json::from_str(line).map_err(|e| BeadsError::JsonlParse {
                line: line_num,
                reason: e.to_string(),
                snippet: snippet(line),
            })?;

        if !is_valid_id_format(&issue.id) {
            return Err(BeadsError::JsonlParse {
                line: line_num,
                reason: format!("invalid issue id '{}'", issue.id),
                snippet: snippet(line),
            });
        }

        issue.repair_closed_at(now);
        issues.push(issue);
    }

    Ok(issues)
}

fn snippet(line: &str) -> String {
    line.chars().take(80).collect()
}

/// A detected git conflict marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMarker {
    /// 1-based line number.
    pub line: usize,
    /// Branch label after `<<<<<<<`/`>>>>>>>`, when git wrote one.
    pub branch: Option<String>,
}

/// Scan for git conflict markers, returning the first one found.
#[must_use]
pub fn find_conflict_marker(bytes: &[u8]) -> Option<ConflictMarker> {
    for (idx, raw) in bytes.split(|&b| b == b'\n').enumerate() {
        let line = String::from_utf8_lossy(raw);
        if let Some(branch) = detect_conflict_marker(&line) {
            return Some(ConflictMarker {
                line: idx + 1,
                branch,
            });
        }
    }
    None
}

/// The inner `Option` is the branch label; separators carry none.
fn detect_conflict_marker(line: &str) -> Option<Option<String>> {
    if let Some(branch) = line.strip_prefix(CONFLICT_START) {
        let branch = branch.trim();
        return Some((!branch.is_empty()).then(|| branch.to_string()));
    }
    if line.starts_with(CONFLICT_SEPARATOR) {
        return Some(None);
    }
    if let Some(branch) = line.strip_prefix(CONFLICT_END) {
        let branch = branch.trim();
        return Some((!branch.is_empty()).then(|| branch.to_string()));
    }
    None
}

// === Auto-import ===

/// Outcome of [`auto_import_if_newer`].
#[derive(Debug, Default)]
pub struct AutoImportReport {
    /// The JSONL was absent or unreadable; nothing happened.
    pub skipped_missing: bool,
    /// Hash matched `last_import_hash`; nothing happened.
    pub skipped_unchanged: bool,
    /// Importer result when an import ran.
    pub outcome: Option<ImportOutcome>,
}

impl AutoImportReport {
    /// Did an import actually run?
    #[must_use]
    pub const fn imported(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Import the JSONL if its content hash differs from the last imported one.
///
/// Pipeline: hash gate, conflict-marker scan, parse, delegate to `import`
/// (the `ImportFunc` collaborator), report remaps, fire `on_changed`, commit
/// `last_import_hash`/`last_import_time`. A failure to persist the hash is
/// logged loudly (it causes redundant future imports) but is not fatal.
///
/// No-op when the file is absent or unreadable.
pub fn auto_import_if_newer<F>(
    storage: &mut SqliteStorage,
    jsonl_path: &Path,
    mut import: F,
    notifier: &dyn Notifier,
    on_changed: &mut dyn FnMut(bool),
) -> Result<AutoImportReport>
where
    F: FnMut(&mut SqliteStorage, &[Issue]) -> Result<ImportOutcome>,
{
    let bytes = match fs::read(jsonl_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            notifier.debug(&format!(
                "auto-import skipped: cannot read '{}': {e}",
                jsonl_path.display()
            ));
            return Ok(AutoImportReport {
                skipped_missing: true,
                ..AutoImportReport::default()
            });
        }
    };

    let current_hash = sha256_bytes(&bytes);
    if storage.get_metadata(meta::LAST_IMPORT_HASH)?.as_deref() == Some(current_hash.as_str()) {
        return Ok(AutoImportReport {
            skipped_unchanged: true,
            ..AutoImportReport::default()
        });
    }

    // git's default text merge can leave markers in the file even when the
    // JSONL merge driver is not configured.
    if let Some(marker) = find_conflict_marker(&bytes) {
        return Err(BeadsError::ConflictMarkers {
            path: jsonl_path.to_path_buf(),
            line: marker.line,
            branch: marker.branch,
        });
    }

    let issues = parse_jsonl(&bytes)?;
    let outcome = import(storage, &issues)?;

    if !outcome.id_mapping.is_empty() {
        notifier.info(&remap_report(&outcome, &issues));
    }

    if outcome.changed() {
        // Remapped rows invalidate previously exported lines wholesale; the
        // caller must rebuild the entire JSONL rather than append.
        on_changed(!outcome.id_mapping.is_empty());
    }

    if let Err(e) = persist_import_metadata(storage, &current_hash) {
        notifier.error(&format!(
            "failed to record last_import_hash (future imports will redo this work): {e}"
        ));
    }

    Ok(AutoImportReport {
        outcome: Some(outcome),
        ..AutoImportReport::default()
    })
}

fn persist_import_metadata(storage: &mut SqliteStorage, hash: &str) -> Result<()> {
    storage.set_metadata(meta::LAST_IMPORT_HASH, hash)?;
    storage.set_metadata(meta::LAST_IMPORT_TIME, &Utc::now().to_rfc3339())?;
    Ok(())
}

/// Deterministic, ordered report of the first ten ID remaps.
fn remap_report(outcome: &ImportOutcome, issues: &[Issue]) -> String {
    let mut lines = vec![format!(
        "import remapped {} colliding id(s):",
        outcome.id_mapping.len()
    )];

    // BTreeMap iteration gives old-id order.
    for (old, new) in outcome.id_mapping.iter().take(10) {
        let title = issues
            .iter()
            .find(|issue| issue.id == *old)
            .map_or("", |issue| issue.title.as_str());
        lines.push(format!("  {old} -> {new} ({title})"));
    }

    if outcome.id_mapping.len() > 10 {
        lines.push(format!("  ... and {} more", outcome.id_mapping.len() - 10));
    }

    lines.join("\n")
}

/// Compare the stored `last_import_time` with the JSONL's mtime.
///
/// Returns `true` when the file on disk is newer than the last import, i.e.
/// clients should expect `auto_import_if_newer` to do work. Missing file or
/// missing metadata both report not-stale / first-import respectively.
pub fn check_staleness(storage: &SqliteStorage, jsonl_path: &Path) -> Result<bool> {
    let Ok(metadata) = fs::metadata(jsonl_path) else {
        return Ok(false);
    };
    let mtime: DateTime<Utc> = metadata.modified()?.into();

    let Some(last_import) = storage.get_metadata(meta::LAST_IMPORT_TIME)? else {
        return Ok(true);
    };
    let last_import = DateTime::parse_from_rfc3339(&last_import)
        .map_err(|e| BeadsError::Config(format!("corrupt last_import_time: {e}")))?
        .with_timezone(&Utc);

    Ok(mtime > last_import)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IssueType, Priority, Status};
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<(String, String)>>,
    }

    impl RecordingNotifier {
        fn infos(&self) -> Vec<String> {
            self.messages
                .lock()
                .iter()
                .filter(|(level, _)| level == "info")
                .map(|(_, msg)| msg.clone())
                .collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn debug(&self, message: &str) {
            self.messages
                .lock()
                .push(("debug".to_string(), message.to_string()));
        }
        fn info(&self, message: &str) {
            self.messages
                .lock()
                .push(("info".to_string(), message.to_string()));
        }
        fn warn(&self, message: &str) {
            self.messages
                .lock()
                .push(("warn".to_string(), message.to_string()));
        }
        fn error(&self, message: &str) {
            self.messages
                .lock()
                .push(("error".to_string(), message.to_string()));
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn issue(id: &str, title: &str, created: i64) -> Issue {
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

    fn write_jsonl(dir: &TempDir, issues: &[Issue]) -> std::path::PathBuf {
        let path = dir.path().join("issues.jsonl");
        let mut contents = String::new();
        for issue in issues {
            contents.push_str(&serde_json::to_string(issue).unwrap());
            contents.push('\n');
        }
        fs::write(&path, contents).unwrap();
        path
    }

    fn run_auto_import(
        storage: &mut SqliteStorage,
        path: &Path,
    ) -> (AutoImportReport, Vec<bool>, RecordingNotifier) {
        let notifier = RecordingNotifier::default();
        let mut changes = Vec::new();
        let report = auto_import_if_newer(
            storage,
            path,
            SqliteStorage::import_issues,
            &notifier,
            &mut |full| changes.push(full),
        )
        .unwrap();
        (report, changes, notifier)
    }

    #[test]
    fn clean_import_records_hash_and_time() {
        let temp = TempDir::new().unwrap();
        let path = write_jsonl(&temp, &[issue("bd-1", "A", 1_700_000_000)]);
        let mut storage = SqliteStorage::open_memory().unwrap();

        let (report, changes, _) = run_auto_import(&mut storage, &path);
        let outcome = report.outcome.unwrap();
        assert_eq!(outcome.created, 1);
        assert!(outcome.id_mapping.is_empty());
        assert_eq!(changes, vec![false]);

        let expected_hash = sha256_bytes(&fs::read(&path).unwrap());
        assert_eq!(
            storage.get_metadata(meta::LAST_IMPORT_HASH).unwrap(),
            Some(expected_hash)
        );
        assert!(storage.get_metadata(meta::LAST_IMPORT_TIME).unwrap().is_some());
    }

    #[test]
    fn unchanged_hash_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let path = write_jsonl(&temp, &[issue("bd-1", "A", 1)]);
        let mut storage = SqliteStorage::open_memory().unwrap();

        let (first, _, _) = run_auto_import(&mut storage, &path);
        assert!(first.imported());

        let (second, changes, _) = run_auto_import(&mut storage, &path);
        assert!(second.skipped_unchanged);
        assert!(!second.imported());
        assert!(changes.is_empty());
    }

    #[test]
    fn missing_file_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let mut storage = SqliteStorage::open_memory().unwrap();
        let (report, _, _) = run_auto_import(&mut storage, &temp.path().join("nope.jsonl"));
        assert!(report.skipped_missing);
    }

    #[test]
    fn conflict_markers_refuse_import() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("issues.jsonl");
        let line = serde_json::to_string(&issue("bd-1", "A", 1)).unwrap();
        fs::write(
            &path,
            format!("<<<<<<< HEAD\n{line}\n=======\n{line}\n>>>>>>> theirs\n"),
        )
        .unwrap();

        let mut storage = SqliteStorage::open_memory().unwrap();
        let notifier = RecordingNotifier::default();
        let err = auto_import_if_newer(
            &mut storage,
            &path,
            SqliteStorage::import_issues,
            &notifier,
            &mut |_| panic!("must not import"),
        )
        .unwrap_err();

        match err {
            BeadsError::ConflictMarkers { line, branch, .. } => {
                assert_eq!(line, 1);
                assert_eq!(branch.as_deref(), Some("HEAD"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(storage.count_issues().unwrap(), 0);
        assert!(storage.get_metadata(meta::LAST_IMPORT_HASH).unwrap().is_none());
    }

    #[test]
    fn conflict_marker_scan_captures_branch_labels() {
        let start = find_conflict_marker(b"{}\n<<<<<<< ours\n").unwrap();
        assert_eq!(start.line, 2);
        assert_eq!(start.branch.as_deref(), Some("ours"));

        let separator = find_conflict_marker(b"=======\n").unwrap();
        assert_eq!(separator.line, 1);
        assert!(separator.branch.is_none());

        let end = find_conflict_marker(b">>>>>>> origin/main\n").unwrap();
        assert_eq!(end.branch.as_deref(), Some("origin/main"));

        assert!(find_conflict_marker(b"{\"id\":\"bd-1\"}\n").is_none());
    }

    #[test]
    fn collision_remap_reports_and_forces_full_export() {
        let temp = TempDir::new().unwrap();
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage.upsert_issue(&issue("bd-1", "Original", 10)).unwrap();

        let path = write_jsonl(&temp, &[issue("bd-1", "A", 999)]);
        let (report, changes, notifier) = run_auto_import(&mut storage, &path);

        let outcome = report.outcome.unwrap();
        assert_eq!(outcome.id_mapping.get("bd-1"), Some(&"bd-2".to_string()));
        assert_eq!(changes, vec![true]);

        let infos = notifier.infos();
        assert_eq!(infos.len(), 1);
        assert!(infos[0].contains("bd-1 -> bd-2 (A)"), "got: {}", infos[0]);
    }

    #[test]
    fn parse_repairs_closed_at() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("issues.jsonl");
        fs::write(
            &path,
            r#"{"id":"bd-1","title":"t","status":"closed","priority":2,"issue_type":"task","created_at":"2025-01-01T00:00:00Z","updated_at":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let issues = parse_jsonl(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(issues[0].status, Status::Closed);
        assert!(issues[0].closed_at.is_some());
    }

    #[test]
    fn parse_error_carries_line_and_snippet() {
        let bytes = b"\n{\"id\":\"bd-1\",\"title\":\"ok\",\"created_at\":\"2025-01-01T00:00:00Z\",\"updated_at\":\"2025-01-01T00:00:00Z\"}\nnot json at all\n";
        let err = parse_jsonl(bytes).unwrap_err();
        match err {
            BeadsError::JsonlParse { line, snippet, .. } => {
                assert_eq!(line, 3);
                assert_eq!(snippet, "not json at all");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parse_rejects_oversized_line_precisely() {
        let ok_line = serde_json::to_string(&issue("bd-1", "A", 1)).unwrap();
        let mut bytes = ok_line.clone().into_bytes();
        bytes.push(b'\n');
        bytes.extend(vec![b'x'; MAX_LINE_BYTES + 1]);
        bytes.push(b'\n');

        let err = parse_jsonl(&bytes).unwrap_err();
        assert!(matches!(err, BeadsError::JsonlLineTooLong { line: 2, .. }));
    }

    #[test]
    fn parse_accepts_line_at_the_limit() {
        let mut issue = issue("bd-1", "A", 1);
        let overhead = serde_json::to_string(&issue).unwrap().len();
        issue.title = "x".repeat(MAX_LINE_BYTES - overhead);
        let line = serde_json::to_string(&issue).unwrap();
        assert!(line.len() <= MAX_LINE_BYTES);

        let parsed = parse_jsonl(format!("{line}\n").as_bytes()).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn export_roundtrips_through_parse() {
        let temp = TempDir::new().unwrap();
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage.upsert_issue(&issue("bd-2", "B", 20)).unwrap();
        storage.upsert_issue(&issue("bd-1", "A", 10)).unwrap();

        let path = temp.path().join("issues.jsonl");
        let result = export_to_jsonl(&mut storage, &path, false).unwrap();
        assert_eq!(result.exported_count, 2);
        assert!(storage.dirty_issue_ids().unwrap().is_empty());

        let parsed = parse_jsonl(&fs::read(&path).unwrap()).unwrap();
        let ids: Vec<&str> = parsed.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["bd-1", "bd-2"]);
    }

    #[test]
    fn export_refuses_empty_db_over_populated_jsonl() {
        let temp = TempDir::new().unwrap();
        let path = write_jsonl(&temp, &[issue("bd-1", "A", 1)]);

        let mut storage = SqliteStorage::open_memory().unwrap();
        let err = export_to_jsonl(&mut storage, &path, false).unwrap_err();
        assert!(err.to_string().contains("Refusing to export"));

        // force overrides the guard
        export_to_jsonl(&mut storage, &path, true).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn staleness_tracks_mtime_against_last_import() {
        let temp = TempDir::new().unwrap();
        let path = write_jsonl(&temp, &[issue("bd-1", "A", 1)]);
        let mut storage = SqliteStorage::open_memory().unwrap();

        // Nothing imported yet: stale.
        assert!(check_staleness(&storage, &path).unwrap());

        run_auto_import(&mut storage, &path);
        assert!(!check_staleness(&storage, &path).unwrap());
    }
}
