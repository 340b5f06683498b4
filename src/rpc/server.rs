//! RPC server: Unix-domain socket accept loop and request handlers.
//!
//! Each connection is served in its own task; a `CancellationToken` rooted at
//! the daemon's shutdown token is handed to every handler so client
//! disconnects and daemon shutdown both cut work short.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{Request, Response, StatusReply, read_message, write_message};
use crate::error::{BeadsError, Result};
use crate::storage::SqliteStorage;

/// An outstanding RPC-level exclusive lock.
#[derive(Debug, Clone)]
struct ExclusiveGrant {
    token: String,
    holder: String,
    expires_at: Instant,
}

/// Static identity reported by `Status`, plus the JSONL path data-plane
/// handlers re-check before reading.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub workspace_path: PathBuf,
    pub database_path: PathBuf,
    pub jsonl_path: PathBuf,
    pub version: String,
}

struct ServerState {
    storage: Arc<Mutex<SqliteStorage>>,
    identity: ServerIdentity,
    started: Instant,
    last_activity: Mutex<DateTime<Utc>>,
    exclusive: Mutex<Option<ExclusiveGrant>>,
    shutdown_requested: Arc<Notify>,
    token_counter: AtomicU64,
}

/// Handle to a running server's accept loop.
pub struct ServerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop the accept loop and wait for it to drain.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Everything a freshly started server hands back to the daemon.
pub struct StartedServer {
    pub handle: ServerHandle,
    /// One-shot readiness signal; fires once the listener is bound and the
    /// accept loop is running. `Option` so the daemon can consume it.
    pub ready: Option<oneshot::Receiver<()>>,
    /// Fires when a client asked the daemon to stop.
    pub shutdown_requested: Arc<Notify>,
    /// Fatal accept-loop errors surface here; the daemon treats one as a
    /// shutdown cause.
    pub error_rx: mpsc::Receiver<BeadsError>,
}

/// The RPC server.
pub struct RpcServer;

impl RpcServer {
    /// Bind the socket and start the accept loop.
    pub fn start(
        socket_path: &Path,
        storage: Arc<Mutex<SqliteStorage>>,
        identity: ServerIdentity,
        cancel: CancellationToken,
    ) -> Result<StartedServer> {
        // A previous daemon that died without cleanup leaves a stale socket
        // file; binding requires the path to be free.
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;

        let shutdown_requested = Arc::new(Notify::new());
        let state = Arc::new(ServerState {
            storage,
            identity,
            started: Instant::now(),
            last_activity: Mutex::new(Utc::now()),
            exclusive: Mutex::new(None),
            shutdown_requested: Arc::clone(&shutdown_requested),
            token_counter: AtomicU64::new(0),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let (error_tx, error_rx) = mpsc::channel(1);

        let accept_state = Arc::clone(&state);
        let accept_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let _ = ready_tx.send(());
            accept_loop(listener, accept_state, accept_cancel, error_tx).await;
        });

        Ok(StartedServer {
            handle: ServerHandle { cancel, task },
            ready: Some(ready_rx),
            shutdown_requested,
            error_rx,
        })
    }
}

async fn accept_loop(
    listener: UnixListener,
    state: Arc<ServerState>,
    cancel: CancellationToken,
    error_tx: mpsc::Sender<BeadsError>,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("RPC accept loop stopping");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let state = Arc::clone(&state);
                        let conn_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &state, &conn_cancel).await {
                                match e {
                                    BeadsError::Io(ref io)
                                        if io.kind() == std::io::ErrorKind::UnexpectedEof =>
                                    {
                                        debug!("client disconnected");
                                    }
                                    other => warn!("connection error: {other}"),
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept failed: {e}");
                        let _ = error_tx.send(BeadsError::Io(e)).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Serve one connection; persistent clients may issue multiple requests.
async fn handle_connection(
    mut stream: UnixStream,
    state: &Arc<ServerState>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let request: Request = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            message = read_message(&mut stream) => message?,
        };

        let response = handle_request(state, request, cancel);
        write_message(&mut stream, &response).await?;
    }
}

fn handle_request(
    state: &Arc<ServerState>,
    request: Request,
    cancel: &CancellationToken,
) -> Response {
    if !matches!(request, Request::Status) {
        *state.last_activity.lock() = Utc::now();
    }

    match request {
        Request::Status => Response::Status(status_reply(state)),

        Request::AcquireExclusive { holder, ttl_secs } => {
            let mut exclusive = state.exclusive.lock();
            if let Some(grant) = exclusive.as_ref() {
                if grant.expires_at > Instant::now() {
                    return Response::ExclusiveBusy {
                        holder: grant.holder.clone(),
                    };
                }
            }
            let token = mint_token(state, &holder);
            // Cap the TTL so a bad client cannot wedge the daemon (or
            // overflow Instant arithmetic).
            let ttl = Duration::from_secs(ttl_secs.min(24 * 60 * 60));
            *exclusive = Some(ExclusiveGrant {
                token: token.clone(),
                holder,
                expires_at: Instant::now() + ttl,
            });
            Response::ExclusiveGranted { token }
        }

        Request::ReleaseExclusive { token } => {
            let mut exclusive = state.exclusive.lock();
            if exclusive.as_ref().is_some_and(|g| g.token == token) {
                *exclusive = None;
            }
            Response::Ok
        }

        Request::Shutdown => {
            state.shutdown_requested.notify_one();
            Response::Ok
        }

        Request::ListIssues { token } => {
            with_data_plane(state, token.as_deref(), cancel, |storage| {
                Ok(Response::Issues {
                    issues: storage.all_issues_for_export()?,
                })
            })
        }

        Request::GetIssue { id, token } => {
            with_data_plane(state, token.as_deref(), cancel, |storage| {
                Ok(Response::Issue {
                    issue: storage.get_issue(&id)?.map(Box::new),
                })
            })
        }

        Request::UpsertIssue { issue, token } => {
            with_data_plane(state, token.as_deref(), cancel, |storage| {
                storage.upsert_issue(&issue)?;
                Ok(Response::Ok)
            })
        }
    }
}

/// Run a data-plane operation unless it is suspended by a live exclusive
/// lock (requests carrying the lock's own token pass through).
fn with_data_plane(
    state: &Arc<ServerState>,
    token: Option<&str>,
    cancel: &CancellationToken,
    op: impl FnOnce(&mut SqliteStorage) -> Result<Response>,
) -> Response {
    {
        let exclusive = state.exclusive.lock();
        if let Some(grant) = exclusive.as_ref() {
            let live = grant.expires_at > Instant::now();
            if live && token != Some(grant.token.as_str()) {
                return Response::Error {
                    message: format!("exclusive lock active (holder '{}')", grant.holder),
                };
            }
        }
    }

    if cancel.is_cancelled() {
        return Response::Error {
            message: "request cancelled".to_string(),
        };
    }

    let mut storage = state.storage.lock();

    // The JSONL may have moved underneath us (a pull, a hand edit); any
    // operation observing JSONL-derived state re-imports first. The hash
    // gate makes the common case a single metadata read.
    if let Err(e) = crate::sync::auto_import_if_newer(
        &mut storage,
        &state.identity.jsonl_path,
        SqliteStorage::import_issues,
        &crate::sync::TracingNotifier,
        &mut |_| {},
    ) {
        return Response::Error {
            message: format!("auto-import failed: {e}"),
        };
    }

    match op(&mut storage) {
        Ok(response) => response,
        Err(e) => Response::Error {
            message: e.to_string(),
        },
    }
}

fn status_reply(state: &Arc<ServerState>) -> StatusReply {
    let exclusive = state.exclusive.lock();
    let live_grant = exclusive
        .as_ref()
        .filter(|grant| grant.expires_at > Instant::now());

    StatusReply {
        workspace_path: state.identity.workspace_path.clone(),
        database_path: state.identity.database_path.clone(),
        pid: std::process::id(),
        version: state.identity.version.clone(),
        uptime_seconds: state.started.elapsed().as_secs(),
        last_activity_time: *state.last_activity.lock(),
        exclusive_lock_active: live_grant.is_some(),
        exclusive_lock_holder: live_grant.map(|grant| grant.holder.clone()),
    }
}

fn mint_token(state: &Arc<ServerState>, holder: &str) -> String {
    let counter = state.token_counter.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(counter.to_le_bytes());
    hasher.update(
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_le_bytes(),
    );
    hasher.update(holder.as_bytes());
    let digest = hasher.finalize();
    format!("{digest:x}")[..32].to_string()
}
