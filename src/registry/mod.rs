//! Cross-workspace daemon registry and discovery.
//!
//! The registry is an index, not a coordinator: a JSON array at
//! `~/.beads/registry.json` listing daemons that registered at startup.
//! Liveness is probed on read and dead entries are compacted lazily; no
//! strong consistency is claimed.

use nix::sys::signal::kill;
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

use crate::config::SOCKET_FILENAME;
use crate::error::{BeadsError, Result};
use crate::rpc::client::try_connect_with_timeout;
use crate::rpc::StatusReply;
use chrono::{DateTime, Utc};

/// One registered daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryEntry {
    pub workspace_path: PathBuf,
    pub socket_path: PathBuf,
    pub database_path: PathBuf,
    pub pid: u32,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

/// A registry entry as seen by `list()`: always a live process, possibly
/// with an unresponsive socket.
#[derive(Debug, Clone)]
pub struct DaemonRecord {
    pub entry: RegistryEntry,
    /// False when the PID is alive but the socket probe failed; the
    /// registry-claimed fields stand in for live status.
    pub responsive: bool,
    pub status: Option<StatusReply>,
}

/// What `list()` observed: live daemons plus the entries it compacted away.
#[derive(Debug, Default)]
pub struct ListReport {
    pub live: Vec<DaemonRecord>,
    /// Entries whose PIDs were dead; already removed from the file.
    pub dead: Vec<RegistryEntry>,
}

/// The on-disk registry with in-process write serialization.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Registry {
    /// Registry at an explicit path (tests use temp dirs).
    #[must_use]
    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// The well-known per-user registry, `~/.beads/registry.json`.
    pub fn open_default() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| BeadsError::Config("cannot determine home directory".to_string()))?;
        Ok(Self::at(home.join(".beads").join("registry.json")))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add an entry, replacing any prior entry for the same workspace or the
    /// same PID.
    pub fn register(&self, entry: &RegistryEntry) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut entries = self.read_entries()?;
        entries.retain(|e| e.workspace_path != entry.workspace_path && e.pid != entry.pid);
        entries.push(entry.clone());
        self.write_entries(&entries)
    }

    /// Remove entries matching the workspace and PID. Missing entries are
    /// not an error.
    pub fn unregister(&self, workspace_path: &Path, pid: u32) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut entries = self.read_entries()?;
        entries.retain(|e| !(e.workspace_path == workspace_path && e.pid == pid));
        self.write_entries(&entries)
    }

    /// All live daemons. Dead PIDs are dropped from both the returned list
    /// and the rewritten file (they come back in `dead` so callers can sweep
    /// their sockets); live entries get their `Status` spliced in when the
    /// socket answers within the probe budget.
    pub async fn list(&self) -> Result<ListReport> {
        let (entries, dead) = {
            let _guard = self.write_lock.lock();
            let all = self.read_entries()?;
            let (live, dead): (Vec<RegistryEntry>, Vec<RegistryEntry>) =
                all.into_iter().partition(|e| pid_alive(e.pid));
            if !dead.is_empty() {
                self.write_entries(&live)?;
            }
            (live, dead)
        };

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let probe =
                try_connect_with_timeout(&entry.socket_path, Duration::from_millis(500)).await;
            let record = match probe {
                Ok(Some(status)) => DaemonRecord {
                    entry,
                    responsive: true,
                    status: Some(status),
                },
                Ok(None) | Err(_) => {
                    tracing::debug!(
                        workspace = %entry.workspace_path.display(),
                        "daemon alive but socket unresponsive"
                    );
                    DaemonRecord {
                        entry,
                        responsive: false,
                        status: None,
                    }
                }
            };
            records.push(record);
        }

        Ok(ListReport {
            live: records,
            dead,
        })
    }

    fn read_entries(&self) -> Result<Vec<RegistryEntry>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BeadsError::Io(e)),
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str(&contents) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                // A corrupt registry is an index, not data; start over.
                tracing::warn!("registry unreadable ({e}); treating as empty");
                Ok(Vec::new())
            }
        }
    }

    /// Atomic write: temp file then rename. The file is always a JSON
    /// array, `[]` when empty, never `null`.
    fn write_entries(&self, entries: &[RegistryEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Signal-0 process liveness probe.
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Unlink socket files whose daemons are dead. Returns how many were
/// removed.
pub fn cleanup_stale_sockets(entries: &[RegistryEntry]) -> usize {
    let mut removed = 0;
    for entry in entries {
        if !pid_alive(entry.pid) && entry.socket_path.exists() {
            match fs::remove_file(&entry.socket_path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::debug!(
                    socket = %entry.socket_path.display(),
                    "failed to remove stale socket: {e}"
                ),
            }
        }
    }
    removed
}

/// Best-effort legacy discovery: a bounded walk locating `bd.sock` files.
///
/// Hidden directories are skipped except `.beads`; `node_modules`, `vendor`
/// and `.git` are never descended into.
#[must_use]
pub fn discover_sockets(root: &Path) -> Vec<PathBuf> {
    const MAX_DEPTH: usize = 10;

    let mut sockets = Vec::new();
    let walker = WalkDir::new(root)
        .max_depth(MAX_DEPTH)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                if name == ".beads" {
                    return true;
                }
                if name.starts_with('.') && entry.depth() > 0 {
                    return false;
                }
                if name == "node_modules" || name == "vendor" {
                    return false;
                }
            }
            true
        });

    for entry in walker.flatten() {
        if !entry.file_type().is_dir() && entry.file_name().to_string_lossy() == SOCKET_FILENAME {
            sockets.push(entry.into_path());
        }
    }

    sockets.sort();
    sockets
}
