//! Daemon lifecycle: singleton lock, database validation, RPC startup,
//! registry membership, the sync loop, and clean shutdown.
//!
//! At most one daemon runs per workspace. The OS advisory lock on
//! `daemon.lock` is the source of truth; the PID file next to it is a
//! portability aid only.

pub mod sync_loop;

pub use sync_loop::{TICK_DEADLINE_SECS, TickOutcome, run_sync_tick};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{
    self, ENV_IGNORE_REPO_MISMATCH, ENV_IGNORE_VERSION_MISMATCH, SyncConfig, WorkspacePaths,
    env_flag,
};
use crate::error::{BeadsError, Result};
use crate::registry::{Registry, RegistryEntry};
use crate::rpc::server::{RpcServer, ServerIdentity};
use crate::storage::{SqliteStorage, meta};
use crate::sync::{SystemGit, TracingNotifier};
use crate::util::repo_fingerprint;

/// Daemon version, compared against the database's `bd_version` key.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Budget for the RPC readiness wait; elapsing is a warning, not a failure.
const READINESS_WARN_SECS: u64 = 5;

/// CLI-level overrides applied on top of the workspace config.
#[derive(Debug, Default, Clone)]
pub struct DaemonOptions {
    /// Start discovery here instead of the current directory.
    pub workspace: Option<PathBuf>,
    /// Explicit database path.
    pub db: Option<PathBuf>,
    /// Override the configured sync interval.
    pub interval_secs: Option<u64>,
    /// Override the configured auto-commit flag.
    pub auto_commit: Option<bool>,
}

/// JSON payload written into `daemon.lock` under truncation.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct LockPayload {
    pub pid: u32,
    pub database_path: PathBuf,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

/// Run the daemon to completion. The returned error maps to the process
/// exit code (`DaemonLocked` is the distinguished non-restart case).
pub async fn run(options: DaemonOptions) -> Result<()> {
    let beads_dir = config::discover_beads_dir(options.workspace.as_deref())?;

    let mut sync_config = SyncConfig::load(&beads_dir)?;
    if let Some(interval) = options.interval_secs {
        sync_config.sync_interval_secs = interval;
    }
    if let Some(auto_commit) = options.auto_commit {
        sync_config.auto_commit = auto_commit;
    }

    // The log sink opens before anything that can fail loudly.
    let _log_guard = init_daemon_logging(&beads_dir, &sync_config.log_filter)?;
    info!(version = VERSION, beads_dir = %beads_dir.display(), "daemon starting");

    let db_override = options
        .db
        .clone()
        .or_else(|| sync_config.database.clone());
    match startup(&beads_dir, db_override.as_deref()).await {
        Ok(daemon) => {
            // A stale diagnostic from an earlier failed start is misleading
            // once we are up.
            let _ = fs::remove_file(&daemon.paths.error_path);
            daemon.serve(sync_config).await
        }
        Err(e) => {
            if !e.is_lock_conflict() {
                write_error_file(&beads_dir, &e);
            }
            error!("daemon startup failed: {e}");
            Err(e)
        }
    }
}

/// A fully started daemon, ready to serve.
struct Daemon {
    paths: WorkspacePaths,
    storage: Arc<Mutex<SqliteStorage>>,
    server: crate::rpc::server::StartedServer,
    registry: Registry,
    cancel: CancellationToken,
    // Held for the advisory lock; released on drop at shutdown.
    lock_file: File,
}

/// Ordered startup: resolve paths, acquire the lock, open and validate
/// storage, start the RPC server, register.
async fn startup(beads_dir: &Path, db_override: Option<&Path>) -> Result<Daemon> {
    // 1. Resolve the database, including the ambiguity check.
    let paths = WorkspacePaths::resolve(beads_dir, db_override)?;
    debug!(db = %paths.db_path.display(), jsonl = %paths.jsonl_path.display(), "paths resolved");

    // 2. Advisory lock before touching anything shared.
    let lock_file = acquire_lock(&paths)?;

    // 3. Open storage and validate its fingerprints.
    let mut storage = SqliteStorage::open(&paths.db_path)?;
    validate_database(&mut storage, &paths.workspace_root)?;
    let storage = Arc::new(Mutex::new(storage));

    // 4. RPC server; block on readiness with a soft 5-second budget.
    let cancel = CancellationToken::new();
    let identity = ServerIdentity {
        workspace_path: paths.workspace_root.clone(),
        database_path: paths.db_path.clone(),
        jsonl_path: paths.jsonl_path.clone(),
        version: VERSION.to_string(),
    };
    let mut server = RpcServer::start(
        &paths.socket_path,
        Arc::clone(&storage),
        identity,
        cancel.child_token(),
    )?;

    let ready = server
        .ready
        .take()
        .expect("readiness receiver present at startup");
    match tokio::time::timeout(Duration::from_secs(READINESS_WARN_SECS), ready).await {
        Ok(_) => info!(socket = %paths.socket_path.display(), "RPC server ready"),
        Err(_) => {
            warn!("RPC server did not signal readiness within {READINESS_WARN_SECS}s; continuing");
        }
    }

    // 5. Announce ourselves to other workspaces.
    let registry = Registry::open_default()?;
    let entry = RegistryEntry {
        workspace_path: paths.workspace_root.clone(),
        socket_path: paths.socket_path.clone(),
        database_path: paths.db_path.clone(),
        pid: std::process::id(),
        version: VERSION.to_string(),
        started_at: Utc::now(),
    };
    if let Err(e) = registry.register(&entry) {
        // Discovery degrades; the daemon itself is fine.
        warn!("registry registration failed: {e}");
    }

    Ok(Daemon {
        paths,
        storage,
        server,
        registry,
        cancel,
        lock_file,
    })
}

impl Daemon {
    /// The event loop: multiplexes the sync ticker, signals, client
    /// shutdown requests, and RPC server errors.
    async fn serve(self, sync_config: SyncConfig) -> Result<()> {
        let Self {
            paths,
            storage,
            server,
            registry,
            cancel,
            lock_file,
        } = self;
        let shutdown_requested = Arc::clone(&server.shutdown_requested);
        let mut error_rx = server.error_rx;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        let mut ticker =
            tokio::time::interval(Duration::from_secs(sync_config.sync_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = sync_config.sync_interval_secs,
            auto_commit = sync_config.auto_commit,
            "entering sync loop"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_tick(&storage, &paths, &sync_config, &cancel).await;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    // Reload is not supported; stay up.
                    info!("received SIGHUP; ignoring");
                }
                () = shutdown_requested.notified() => {
                    info!("shutdown requested over RPC");
                    break;
                }
                maybe_err = error_rx.recv() => {
                    if let Some(e) = maybe_err {
                        error!("RPC server failed: {e}; shutting down");
                    }
                    break;
                }
            }
        }

        // Ordered shutdown: cancel the root token, stop the RPC server,
        // remove the PID and socket files, release the lock, unregister.
        cancel.cancel();
        server.handle.stop().await;

        for path in [&paths.pid_path, &paths.socket_path] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove {}: {e}", path.display());
                }
            }
        }

        if let Err(e) = registry.unregister(&paths.workspace_root, std::process::id()) {
            warn!("registry unregister failed: {e}");
        }

        drop(lock_file);
        info!("daemon stopped");
        Ok(())
    }
}

/// One ticker firing: run the sync cycle on the blocking pool under the
/// 2-minute deadline.
async fn run_tick(
    storage: &Arc<Mutex<SqliteStorage>>,
    paths: &WorkspacePaths,
    sync_config: &SyncConfig,
    cancel: &CancellationToken,
) {
    let storage = Arc::clone(storage);
    let paths = paths.clone();
    let config = sync_config.clone();
    let tick_cancel = cancel.child_token();
    let blocking_cancel = tick_cancel.clone();

    let tick = tokio::task::spawn_blocking(move || {
        let git = SystemGit::new(&paths.workspace_root);
        run_sync_tick(
            &storage,
            &paths,
            &config,
            &git,
            &TracingNotifier,
            &blocking_cancel,
        )
    });

    match tokio::time::timeout(Duration::from_secs(TICK_DEADLINE_SECS), tick).await {
        Ok(Ok(Ok(outcome))) => {
            debug!(
                exported = outcome.exported,
                committed = outcome.committed,
                pulled = outcome.pulled,
                imported = outcome.imported,
                pushed = outcome.pushed,
                "sync tick complete"
            );
        }
        Ok(Ok(Err(e))) => warn!("sync tick failed: {e}"),
        Ok(Err(join_err)) => error!("sync tick panicked: {join_err}"),
        Err(_elapsed) => {
            tick_cancel.cancel();
            warn!("sync tick exceeded the {TICK_DEADLINE_SECS}s deadline; cancelled");
        }
    }
}

/// Acquire the advisory exclusive lock and write its payload plus the PID
/// mirror file.
///
/// Open without truncation first: truncating before holding the lock would
/// wipe a running daemon's payload.
fn acquire_lock(paths: &WorkspacePaths) -> Result<File> {
    let mut lock_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&paths.lock_path)?;

    lock_file
        .try_lock_exclusive()
        .map_err(|_| BeadsError::DaemonLocked {
            path: paths.lock_path.clone(),
        })?;

    let payload = LockPayload {
        pid: std::process::id(),
        database_path: paths.db_path.clone(),
        version: VERSION.to_string(),
        started_at: Utc::now(),
    };
    lock_file.set_len(0)?;
    lock_file.write_all(&serde_json::to_vec_pretty(&payload)?)?;
    lock_file.flush()?;

    fs::write(&paths.pid_path, format!("{}\n", std::process::id()))?;

    Ok(lock_file)
}

/// Validate the database belongs to this repository and daemon version.
///
/// Both checks can be bypassed with `BEADS_IGNORE_*` env vars; absent keys
/// are upgraded in place.
fn validate_database(storage: &mut SqliteStorage, workspace_root: &Path) -> Result<()> {
    let computed = repo_fingerprint(workspace_root);
    match storage.get_metadata(meta::REPO_ID)? {
        None => {
            // Legacy database: adopt the current repository.
            storage.set_metadata(meta::REPO_ID, &computed)?;
        }
        Some(stored) if stored != computed => {
            if env_flag(ENV_IGNORE_REPO_MISMATCH) {
                warn!(
                    "repository fingerprint mismatch ignored via {ENV_IGNORE_REPO_MISMATCH} \
                     (stored {stored}, computed {computed})"
                );
            } else {
                return Err(BeadsError::RepoMismatch { stored, computed });
            }
        }
        Some(_) => {}
    }

    match storage.get_metadata(meta::BD_VERSION)? {
        None => {
            storage.set_metadata(meta::BD_VERSION, VERSION)?;
        }
        Some(stored) if stored != VERSION => {
            let compatible = semver::Version::parse(&stored)
                .ok()
                .zip(semver::Version::parse(VERSION).ok())
                .is_some_and(|(a, b)| a == b);
            if compatible || env_flag(ENV_IGNORE_VERSION_MISMATCH) {
                if !compatible {
                    warn!(
                        "version mismatch ignored via {ENV_IGNORE_VERSION_MISMATCH} \
                         (database {stored}, daemon {VERSION})"
                    );
                }
                storage.set_metadata(meta::BD_VERSION, VERSION)?;
            } else {
                return Err(BeadsError::VersionMismatch {
                    stored,
                    current: VERSION.to_string(),
                });
            }
        }
        Some(_) => {}
    }

    Ok(())
}

/// Write the human-readable diagnostic to `.beads/daemon-error`.
fn write_error_file(beads_dir: &Path, error: &BeadsError) {
    let path = beads_dir.join(config::ERROR_FILENAME);
    if let Err(e) = fs::write(&path, format!("{error}\n")) {
        error!("failed to write {}: {e}", path.display());
    }
}

// === Logging ===

/// Default rotation threshold, overridable via `BEADS_DAEMON_LOG_MAX_SIZE`.
const DEFAULT_LOG_MAX_SIZE: u64 = 10 * 1024 * 1024;
/// Rotated files kept, overridable via `BEADS_DAEMON_LOG_MAX_BACKUPS`.
const DEFAULT_LOG_MAX_BACKUPS: u32 = 3;

/// Open the rotating daemon log sink.
///
/// Rotation is size-based and happens at startup: `daemon.log` shifts to
/// `.1`, `.1` to `.2`, and so on. `RUST_LOG` takes precedence over the
/// configured filter. `BEADS_DAEMON_LOG_MAX_AGE` and `_COMPRESS` are
/// accepted for compatibility and ignored.
fn init_daemon_logging(
    beads_dir: &Path,
    log_filter: &str,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let log_path = beads_dir.join(config::LOG_FILENAME);
    let max_size = env_u64("BEADS_DAEMON_LOG_MAX_SIZE", DEFAULT_LOG_MAX_SIZE);
    let max_backups = env_u64("BEADS_DAEMON_LOG_MAX_BACKUPS", u64::from(DEFAULT_LOG_MAX_BACKUPS));
    rotate_log(&log_path, max_size, u32::try_from(max_backups).unwrap_or(u32::MAX));

    let appender = tracing_appender::rolling::never(
        beads_dir,
        log_path
            .file_name()
            .ok_or_else(|| BeadsError::Config("invalid log path".to_string()))?,
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_filter.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .init();

    Ok(guard)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Shift-rotate the log when it exceeds the size threshold. Best-effort:
/// rotation failures never block startup.
fn rotate_log(log_path: &Path, max_size: u64, max_backups: u32) {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(_) => return,
    };
    if size < max_size || max_backups == 0 {
        return;
    }

    let base = log_path.display().to_string();
    for i in (1..max_backups).rev() {
        let _ = fs::rename(format!("{base}.{i}"), format!("{base}.{}", i + 1));
    }
    let _ = fs::rename(log_path, format!("{base}.1"));
}
