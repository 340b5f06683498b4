//! Workspace discovery and configuration.
//!
//! Configuration sources and precedence (highest wins):
//! 1. CLI overrides
//! 2. Environment variables (`BEADS_*`)
//! 3. Project config (`.beads/config.yaml` or `.beads/config.json`)
//! 4. Defaults

use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BeadsError, Result};

/// Default JSONL filename inside `.beads`.
pub const DEFAULT_JSONL_FILENAME: &str = "issues.jsonl";
/// Well-known RPC socket filename.
pub const SOCKET_FILENAME: &str = "bd.sock";
/// Advisory lock file carrying the daemon's JSON payload.
pub const LOCK_FILENAME: &str = "daemon.lock";
/// Plain-integer PID mirror of the lock.
pub const PID_FILENAME: &str = "daemon.pid";
/// Side-channel file holding the last fatal startup diagnostic.
pub const ERROR_FILENAME: &str = "daemon-error";
/// Daemon log file.
pub const LOG_FILENAME: &str = "daemon.log";

/// Override: skip the repository fingerprint check.
pub const ENV_IGNORE_REPO_MISMATCH: &str = "BEADS_IGNORE_REPO_MISMATCH";
/// Override: skip the daemon version check.
pub const ENV_IGNORE_VERSION_MISMATCH: &str = "BEADS_IGNORE_VERSION_MISMATCH";

/// Resolved per-workspace filesystem layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    /// The workspace root (parent of `.beads`).
    pub workspace_root: PathBuf,
    /// The `.beads` directory.
    pub beads_dir: PathBuf,
    /// Canonical database.
    pub db_path: PathBuf,
    /// JSONL shadow file.
    pub jsonl_path: PathBuf,
    /// RPC socket.
    pub socket_path: PathBuf,
    /// Advisory lock file.
    pub lock_path: PathBuf,
    /// PID mirror file.
    pub pid_path: PathBuf,
    /// Startup-error side channel.
    pub error_path: PathBuf,
    /// Daemon log.
    pub log_path: PathBuf,
}

impl WorkspacePaths {
    /// Resolve the full layout for a `.beads` directory.
    ///
    /// The database is the configured path when given, otherwise the single
    /// non-backup `*.db` file in `.beads`.
    ///
    /// # Errors
    ///
    /// `NoDatabase` when nothing resolves; `AmbiguousDatabase` when more than
    /// one non-backup database is present.
    pub fn resolve(beads_dir: &Path, db_override: Option<&Path>) -> Result<Self> {
        let workspace_root = beads_dir
            .parent()
            .map_or_else(|| beads_dir.to_path_buf(), Path::to_path_buf);

        let db_path = match db_override {
            Some(path) => path.to_path_buf(),
            None => discover_database(beads_dir)?,
        };

        Ok(Self {
            workspace_root,
            beads_dir: beads_dir.to_path_buf(),
            db_path,
            jsonl_path: resolve_jsonl_path(beads_dir),
            socket_path: beads_dir.join(SOCKET_FILENAME),
            lock_path: beads_dir.join(LOCK_FILENAME),
            pid_path: beads_dir.join(PID_FILENAME),
            error_path: beads_dir.join(ERROR_FILENAME),
            log_path: beads_dir.join(LOG_FILENAME),
        })
    }
}

/// Discover the active `.beads` directory.
///
/// Honors `BEADS_DIR` when set, otherwise walks up from `start` (or CWD).
///
/// # Errors
///
/// Returns `NoDatabase` if no ancestor contains a `.beads` directory.
pub fn discover_beads_dir(start: Option<&Path>) -> Result<PathBuf> {
    if let Ok(value) = env::var("BEADS_DIR") {
        if !value.trim().is_empty() {
            let path = PathBuf::from(value);
            if path.is_dir() {
                return Ok(path);
            }
        }
    }

    let start_dir = match start {
        Some(path) => path.to_path_buf(),
        None => env::current_dir()?,
    };

    let mut current = start_dir.clone();
    loop {
        let candidate = current.join(".beads");
        if candidate.is_dir() {
            return Ok(candidate);
        }
        if !current.pop() {
            break;
        }
    }

    Err(BeadsError::NoDatabase { start: start_dir })
}

/// Find the canonical database in a `.beads` directory.
///
/// Exactly one non-backup `*.db` file is expected; zero is `NoDatabase`, more
/// than one is a fatal configuration error.
pub fn discover_database(beads_dir: &Path) -> Result<PathBuf> {
    let mut candidates = Vec::new();

    for entry in fs::read_dir(beads_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".db") || is_backup_database(name) {
            continue;
        }
        if entry.file_type()?.is_file() {
            candidates.push(name.to_string());
        }
    }

    candidates.sort();
    match candidates.len() {
        0 => Err(BeadsError::NoDatabase {
            start: beads_dir.to_path_buf(),
        }),
        1 => Ok(beads_dir.join(&candidates[0])),
        _ => Err(BeadsError::AmbiguousDatabase {
            dir: beads_dir.to_path_buf(),
            candidates,
        }),
    }
}

/// Backup and scratch databases never count toward the ambiguity check.
#[must_use]
pub fn is_backup_database(filename: &str) -> bool {
    filename.contains("backup") || filename.ends_with(".bak.db") || filename.starts_with('.')
}

fn resolve_jsonl_path(beads_dir: &Path) -> PathBuf {
    if let Ok(env_path) = env::var("BEADS_JSONL") {
        if !env_path.trim().is_empty() {
            return PathBuf::from(env_path);
        }
    }

    let preferred = beads_dir.join(DEFAULT_JSONL_FILENAME);
    if preferred.is_file() {
        return preferred;
    }

    // A single custom-named *.jsonl in .beads is accepted; merge artifacts and
    // anything ambiguous fall back to the default name.
    let mut found: Vec<PathBuf> = Vec::new();
    if let Ok(entries) = fs::read_dir(beads_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl")
                && !is_excluded_jsonl(&path)
            {
                found.push(path);
            }
        }
    }

    if found.len() == 1 {
        found.remove(0)
    } else {
        preferred
    }
}

/// JSONL files that should never be treated as the main export file.
fn is_excluded_jsonl(path: &Path) -> bool {
    const EXCLUDED: &[&str] = &["deletions.jsonl", "beads.base.jsonl", "sync_base.jsonl"];
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| EXCLUDED.contains(&name) || name.ends_with(".tmp"))
}

/// Daemon behavior knobs from `.beads/config.yaml` / `.beads/config.json`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Seconds between sync-loop ticks.
    pub sync_interval_secs: u64,
    /// Commit the JSONL after export and push after import.
    pub auto_commit: bool,
    /// Explicit database path, overriding discovery.
    pub database: Option<PathBuf>,
    /// Refuse/allow exporting an empty database over a non-empty JSONL.
    pub force_empty_export: bool,
    /// Log filter when `RUST_LOG` is unset, e.g. "info" or "beadsd=debug".
    pub log_filter: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 30,
            auto_commit: false,
            database: None,
            force_empty_export: false,
            log_filter: "info".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load from `.beads/config.yaml`, falling back to `.beads/config.json`,
    /// then defaults. A present-but-invalid file is an error; a missing file
    /// is not.
    pub fn load(beads_dir: &Path) -> Result<Self> {
        let yaml_path = beads_dir.join("config.yaml");
        if yaml_path.is_file() {
            let contents = fs::read_to_string(&yaml_path)?;
            return Ok(serde_yaml::from_str(&contents)?);
        }

        let json_path = beads_dir.join("config.json");
        if json_path.is_file() {
            let contents = fs::read_to_string(&json_path)?;
            return Ok(serde_json::from_str(&contents)?);
        }

        Ok(Self::default())
    }
}

/// True when the given override env var is set to a truthy value.
#[must_use]
pub fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|v| {
        let v = v.trim();
        v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn beads_dir() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".beads");
        fs::create_dir(&dir).unwrap();
        (temp, dir)
    }

    #[test]
    fn discover_database_single_candidate() {
        let (_temp, dir) = beads_dir();
        fs::write(dir.join("beads.db"), b"").unwrap();
        fs::write(dir.join("beads.backup.db"), b"").unwrap();

        let found = discover_database(&dir).unwrap();
        assert_eq!(found.file_name().unwrap(), "beads.db");
    }

    #[test]
    fn discover_database_rejects_ambiguity() {
        let (_temp, dir) = beads_dir();
        fs::write(dir.join("one.db"), b"").unwrap();
        fs::write(dir.join("two.db"), b"").unwrap();

        let err = discover_database(&dir).unwrap_err();
        assert!(matches!(err, BeadsError::AmbiguousDatabase { ref candidates, .. }
            if candidates == &vec!["one.db".to_string(), "two.db".to_string()]));
    }

    #[test]
    fn discover_database_none_found() {
        let (_temp, dir) = beads_dir();
        assert!(matches!(
            discover_database(&dir),
            Err(BeadsError::NoDatabase { .. })
        ));
    }

    #[test]
    fn discover_beads_dir_walks_upward() {
        let temp = TempDir::new().unwrap();
        let beads = temp.path().join(".beads");
        fs::create_dir(&beads).unwrap();
        let nested = temp.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();

        let found = discover_beads_dir(Some(&nested)).unwrap();
        assert_eq!(found.canonicalize().unwrap(), beads.canonicalize().unwrap());
    }

    #[test]
    fn workspace_paths_layout() {
        let (_temp, dir) = beads_dir();
        fs::write(dir.join("beads.db"), b"").unwrap();

        let paths = WorkspacePaths::resolve(&dir, None).unwrap();
        assert_eq!(paths.socket_path, dir.join("bd.sock"));
        assert_eq!(paths.lock_path, dir.join("daemon.lock"));
        assert_eq!(paths.pid_path, dir.join("daemon.pid"));
        assert_eq!(paths.jsonl_path, dir.join("issues.jsonl"));
        assert_eq!(paths.workspace_root, dir.parent().unwrap());
    }

    #[test]
    fn sync_config_defaults_when_missing() {
        let (_temp, dir) = beads_dir();
        let config = SyncConfig::load(&dir).unwrap();
        assert_eq!(config.sync_interval_secs, 30);
        assert!(!config.auto_commit);
    }

    #[test]
    fn sync_config_reads_yaml() {
        let (_temp, dir) = beads_dir();
        fs::write(
            dir.join("config.yaml"),
            "sync_interval_secs: 5\nauto_commit: true\n",
        )
        .unwrap();

        let config = SyncConfig::load(&dir).unwrap();
        assert_eq!(config.sync_interval_secs, 5);
        assert!(config.auto_commit);
    }

    #[test]
    fn sync_config_rejects_unknown_keys() {
        let (_temp, dir) = beads_dir();
        fs::write(dir.join("config.yaml"), "no_such_knob: 1\n").unwrap();
        assert!(SyncConfig::load(&dir).is_err());
    }
}
