//! Error types for the Beads coordination core.
//!
//! # Design
//!
//! - `thiserror` derive for structured variants
//! - `anyhow` integration at the binary edge only
//! - A distinguished exit code for the lock conflict so supervisors can tell
//!   "another daemon owns this workspace" from a genuine failure

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a clean run.
pub const EXIT_OK: i32 = 0;
/// Generic fatal error.
pub const EXIT_FAILURE: i32 = 1;
/// Another daemon already holds the workspace lock; do not restart.
pub const EXIT_ALREADY_LOCKED: i32 = 11;

/// Primary error type for coordination-core operations.
#[derive(Error, Debug)]
pub enum BeadsError {
    // === Startup preconditions ===
    /// No database could be resolved for the workspace.
    #[error("No beads database found (searched upward from '{start}')")]
    NoDatabase { start: PathBuf },

    /// More than one non-backup database file in `.beads`.
    #[error("Ambiguous databases in '{dir}': found {candidates:?}; remove or rename extras")]
    AmbiguousDatabase {
        dir: PathBuf,
        candidates: Vec<String>,
    },

    /// The database belongs to a different repository.
    #[error(
        "Repository fingerprint mismatch: database has '{stored}', workspace computes '{computed}'.\n\
         Set BEADS_IGNORE_REPO_MISMATCH=1 to override."
    )]
    RepoMismatch { stored: String, computed: String },

    /// The database was last touched by an incompatible daemon version.
    #[error(
        "Version mismatch: database has bd_version '{stored}', daemon is '{current}'.\n\
         Set BEADS_IGNORE_VERSION_MISMATCH=1 to override."
    )]
    VersionMismatch { stored: String, current: String },

    // === Concurrency ===
    /// Another daemon holds the advisory lock for this workspace.
    #[error("Daemon already running for this workspace (lock held on '{path}')")]
    DaemonLocked { path: PathBuf },

    /// An RPC exclusive-lock token is outstanding.
    #[error("Exclusive lock busy: held by '{holder}'")]
    ExclusiveBusy { holder: String },

    // === User content ===
    /// Failed to decode a JSONL line.
    #[error("JSONL parse error at line {line}: {reason}\n  {snippet}")]
    JsonlParse {
        line: usize,
        reason: String,
        snippet: String,
    },

    /// A JSONL line exceeded the scanner budget.
    #[error("JSONL line {line} exceeds the {max_bytes}-byte limit")]
    JsonlLineTooLong { line: usize, max_bytes: usize },

    /// Git conflict markers found in the JSONL.
    #[error(
        "Merge conflict markers detected in '{path}' (first at line {line}{}).\n\
         Resolve the conflict, then re-run; nothing was imported.",
        .branch.as_ref().map_or_else(String::new, |b| format!(", branch '{b}'"))
    )]
    ConflictMarkers {
        path: PathBuf,
        line: usize,
        /// Branch label following the `<<<<<<<`/`>>>>>>>` marker, when git
        /// wrote one.
        branch: Option<String>,
    },

    /// Invalid status value.
    #[error("Invalid status: {status}")]
    InvalidStatus { status: String },

    /// Issue ID format is invalid.
    #[error("Invalid issue ID format: {id}")]
    InvalidId { id: String },

    // === Integrity ===
    /// Row count decreased across an import.
    #[error("Data loss detected: issue count dropped from {before} to {after} during import")]
    DataLoss { before: usize, after: usize },

    // === RPC / discovery ===
    /// A daemon socket exists but did not answer a health probe in time.
    #[error("Daemon at '{socket}' did not respond within {timeout_ms}ms")]
    DaemonUnresponsive { socket: PathBuf, timeout_ms: u64 },

    /// The RPC peer returned an error reply.
    #[error("RPC error: {message}")]
    Rpc { message: String },

    /// Malformed or oversized RPC frame.
    #[error("RPC protocol error: {0}")]
    Protocol(String),

    // === Upstream subsystems ===
    /// A git subprocess failed.
    #[error("git {args} failed: {stderr}")]
    Git { args: String, stderr: String },

    /// `SQLite` database error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wrapped anyhow error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BeadsError {
    /// True when the failure is the non-alarming "someone else owns the
    /// workspace" case; supervisors should not restart on it.
    #[must_use]
    pub const fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::DaemonLocked { .. })
    }

    /// True for fatal startup preconditions that belong in the
    /// `.beads/daemon-error` side-channel file.
    #[must_use]
    pub const fn is_startup_precondition(&self) -> bool {
        matches!(
            self,
            Self::NoDatabase { .. }
                | Self::AmbiguousDatabase { .. }
                | Self::RepoMismatch { .. }
                | Self::VersionMismatch { .. }
        )
    }

    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        if self.is_lock_conflict() {
            EXIT_ALREADY_LOCKED
        } else {
            EXIT_FAILURE
        }
    }
}

/// Result type using `BeadsError`.
pub type Result<T> = std::result::Result<T, BeadsError>;
