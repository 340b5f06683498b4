//! One tick of the daemon's sync loop.
//!
//! Steps run strictly in order: export, commit (optional), pull, import,
//! push (optional). No step begins before the previous completes; export
//! failure aborts the tick, and a row-count decrease across the import is
//! surfaced as data loss.

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{SyncConfig, WorkspacePaths};
use crate::error::{BeadsError, Result};
use crate::storage::SqliteStorage;
use crate::sync::{self, GitClient, Notifier};

/// Hard deadline for one sync tick.
pub const TICK_DEADLINE_SECS: u64 = 120;

/// What a tick actually did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub exported: usize,
    pub committed: bool,
    pub pulled: bool,
    pub imported: bool,
    pub pushed: bool,
}

/// Execute one sync cycle: export -> commit -> pull -> import -> push.
///
/// The storage mutex is held only inside the export and import steps so RPC
/// clients stay responsive while git talks to the network. Cancellation is
/// checked between steps; a cancelled tick returns an error and the next
/// interval retries.
pub fn run_sync_tick(
    storage: &Mutex<SqliteStorage>,
    paths: &WorkspacePaths,
    config: &SyncConfig,
    git: &dyn GitClient,
    notifier: &dyn Notifier,
    cancel: &CancellationToken,
) -> Result<TickOutcome> {
    let mut outcome = TickOutcome::default();

    // 1. Export. Failure aborts the tick; no further steps run.
    {
        let mut storage = storage.lock();
        let export = sync::export_to_jsonl(
            &mut storage,
            &paths.jsonl_path,
            config.force_empty_export,
        )?;
        outcome.exported = export.exported_count;
    }
    check_cancelled(cancel)?;

    // 2. Commit (optional).
    if config.auto_commit && git.has_changes(&paths.jsonl_path)? {
        let message = format!("bd daemon sync: {}", Utc::now().to_rfc3339());
        git.commit(&paths.jsonl_path, &message)?;
        outcome.committed = true;
    }
    check_cancelled(cancel)?;

    // 3. Pull. A non-fast-forward failure aborts; the next tick retries.
    let has_upstream = git.has_upstream()?;
    if has_upstream {
        git.pull()?;
        outcome.pulled = true;
    }
    check_cancelled(cancel)?;

    // 4. Import. The row count must not decrease across an import.
    {
        let mut storage = storage.lock();
        let before = storage.count_issues()?;
        let report = sync::auto_import_if_newer(
            &mut storage,
            &paths.jsonl_path,
            SqliteStorage::import_issues,
            notifier,
            &mut |_needs_full_export| {},
        )?;
        outcome.imported = report.imported();

        let after = storage.count_issues()?;
        if after < before {
            return Err(BeadsError::DataLoss { before, after });
        }
    }
    check_cancelled(cancel)?;

    // 5. Push (optional; requires auto-commit and something committed this
    //    tick). Failure is logged, not fatal.
    if config.auto_commit && has_upstream && outcome.committed {
        match git.push() {
            Ok(()) => outcome.pushed = true,
            Err(e) => notifier.warn(&format!("push failed (will retry next tick): {e}")),
        }
    }

    Ok(outcome)
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(BeadsError::Config("sync tick cancelled".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Issue, IssueType, Priority, Status};
    use crate::sync::TracingNotifier;
    use chrono::TimeZone;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Records the call sequence and simulates upstream/commit behavior.
    #[derive(Default)]
    struct MockGit {
        calls: Mutex<Vec<String>>,
        upstream: bool,
        dirty: AtomicBool,
        fail_pull: bool,
    }

    impl MockGit {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl GitClient for MockGit {
        fn has_upstream(&self) -> Result<bool> {
            self.calls.lock().push("has_upstream".to_string());
            Ok(self.upstream)
        }

        fn has_changes(&self, _path: &Path) -> Result<bool> {
            self.calls.lock().push("has_changes".to_string());
            Ok(self.dirty.load(Ordering::SeqCst))
        }

        fn commit(&self, _path: &Path, message: &str) -> Result<()> {
            assert!(message.starts_with("bd daemon sync: "));
            self.calls.lock().push("commit".to_string());
            self.dirty.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn pull(&self) -> Result<()> {
            self.calls.lock().push("pull".to_string());
            if self.fail_pull {
                return Err(BeadsError::Git {
                    args: "pull --ff-only".to_string(),
                    stderr: "fatal: Not possible to fast-forward".to_string(),
                });
            }
            Ok(())
        }

        fn push(&self) -> Result<()> {
            self.calls.lock().push("push".to_string());
            Ok(())
        }
    }

    fn workspace() -> (TempDir, WorkspacePaths) {
        let temp = TempDir::new().unwrap();
        let beads = temp.path().join(".beads");
        fs::create_dir(&beads).unwrap();
        fs::write(beads.join("beads.db"), b"").unwrap();
        let paths = WorkspacePaths::resolve(&beads, Some(&PathBuf::from(":memory:"))).unwrap();
        (temp, paths)
    }

    fn seeded_storage() -> Mutex<SqliteStorage> {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage
            .upsert_issue(&Issue {
                id: "bd-1".to_string(),
                title: "Seed".to_string(),
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
                created_at: chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                updated_at: chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                closed_at: None,
                labels: vec![],
                dependencies: vec![],
                comments: vec![],
            })
            .unwrap();
        Mutex::new(storage)
    }

    #[test]
    fn tick_runs_steps_in_order_with_auto_commit() {
        let (_temp, paths) = workspace();
        let storage = seeded_storage();
        let git = MockGit {
            upstream: true,
            ..MockGit::default()
        };
        git.dirty.store(true, Ordering::SeqCst);
        let config = SyncConfig {
            auto_commit: true,
            ..SyncConfig::default()
        };

        let outcome = run_sync_tick(
            &storage,
            &paths,
            &config,
            &git,
            &TracingNotifier,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(outcome.exported, 1);
        assert!(outcome.committed);
        assert!(outcome.pulled);
        assert!(outcome.pushed);
        assert_eq!(
            git.calls(),
            vec!["has_changes", "commit", "has_upstream", "pull", "push"]
        );
    }

    #[test]
    fn push_is_skipped_without_auto_commit() {
        let (_temp, paths) = workspace();
        let storage = seeded_storage();
        let git = MockGit {
            upstream: true,
            ..MockGit::default()
        };

        let outcome = run_sync_tick(
            &storage,
            &paths,
            &SyncConfig::default(),
            &git,
            &TracingNotifier,
            &CancellationToken::new(),
        )
        .unwrap();

        assert!(!outcome.committed);
        assert!(outcome.pulled);
        assert!(!outcome.pushed);
        assert!(!git.calls().contains(&"push".to_string()));
    }

    #[test]
    fn clean_tree_skips_commit_and_import_no_ops() {
        let (_temp, paths) = workspace();
        let storage = seeded_storage();
        let git = MockGit {
            upstream: true,
            ..MockGit::default()
        };
        let config = SyncConfig {
            auto_commit: true,
            ..SyncConfig::default()
        };

        // First tick exports and imports the fresh JSONL.
        run_sync_tick(
            &storage,
            &paths,
            &config,
            &git,
            &TracingNotifier,
            &CancellationToken::new(),
        )
        .unwrap();

        // Second tick: identical bytes, clean tree, unchanged hash.
        let outcome = run_sync_tick(
            &storage,
            &paths,
            &config,
            &git,
            &TracingNotifier,
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(!outcome.committed);
        assert!(!outcome.imported);
        assert!(outcome.pulled);
        // Nothing committed, so nothing to push.
        assert!(!outcome.pushed);
        assert!(!git.calls().contains(&"push".to_string()));
    }

    #[test]
    fn failed_pull_aborts_before_import() {
        let (_temp, paths) = workspace();
        let storage = seeded_storage();
        let git = MockGit {
            upstream: true,
            fail_pull: true,
            ..MockGit::default()
        };

        let err = run_sync_tick(
            &storage,
            &paths,
            &SyncConfig::default(),
            &git,
            &TracingNotifier,
            &CancellationToken::new(),
        )
        .unwrap_err();

        assert!(matches!(err, BeadsError::Git { .. }));
        let calls = git.calls();
        assert!(calls.contains(&"pull".to_string()));
        assert!(!calls.contains(&"push".to_string()));
    }

    #[test]
    fn cancelled_token_stops_the_tick() {
        let (_temp, paths) = workspace();
        let storage = seeded_storage();
        let git = MockGit::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_sync_tick(
            &storage,
            &paths,
            &SyncConfig::default(),
            &git,
            &TracingNotifier,
            &cancel,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
