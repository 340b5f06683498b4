//! RPC client and the discovery health probe.

use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;

use super::{PROBE_TIMEOUT_MS, Request, Response, StatusReply, read_message, write_message};
use crate::error::{BeadsError, Result};

/// A connected RPC client. Connections are cheap; short-lived CLI processes
/// open one per command.
pub struct DaemonClient {
    stream: UnixStream,
}

impl DaemonClient {
    /// Connect to a daemon socket.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        Ok(Self { stream })
    }

    /// Issue one request and read its reply.
    pub async fn call(&mut self, request: &Request) -> Result<Response> {
        write_message(&mut self.stream, request).await?;
        let response: Response = read_message(&mut self.stream).await?;
        if let Response::Error { message } = response {
            return Err(BeadsError::Rpc { message });
        }
        Ok(response)
    }

    /// Fetch the daemon's status.
    pub async fn status(&mut self) -> Result<StatusReply> {
        match self.call(&Request::Status).await? {
            Response::Status(status) => Ok(status),
            other => Err(BeadsError::Protocol(format!(
                "unexpected reply to Status: {other:?}"
            ))),
        }
    }
}

/// Connect and run `Status` within `timeout`.
///
/// `Ok(None)` means "no daemon" (nothing is listening); an error means a
/// daemon appears present but unhealthy. Discovery treats the two very
/// differently.
pub async fn try_connect_with_timeout(
    socket_path: &Path,
    timeout: Duration,
) -> Result<Option<StatusReply>> {
    let probe = async {
        let mut client = DaemonClient::connect(socket_path).await?;
        client.status().await
    };

    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(BeadsError::Io(e)))
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            ) =>
        {
            Ok(None)
        }
        Ok(Err(e)) => Err(e),
        Err(_elapsed) => Err(BeadsError::DaemonUnresponsive {
            socket: socket_path.to_path_buf(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Probe with the default 500 ms budget.
pub async fn probe(socket_path: &Path) -> Result<Option<StatusReply>> {
    try_connect_with_timeout(socket_path, Duration::from_millis(PROBE_TIMEOUT_MS)).await
}
