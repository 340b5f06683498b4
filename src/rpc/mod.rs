//! RPC boundary between clients and the workspace daemon.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload. Clients
//! discover compatibility via the `version` field of the `Status` reply.

pub mod client;
pub mod server;

pub use client::{DaemonClient, try_connect_with_timeout};
pub use server::{RpcServer, ServerIdentity, StartedServer};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BeadsError, Result};
use crate::model::Issue;

/// Frames larger than this are rejected as protocol errors.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Default deadline for client connect + status probes.
pub const PROBE_TIMEOUT_MS: u64 = 500;

/// Request from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Request {
    /// Informational status; always available once the socket is listening.
    Status,

    /// Request the RPC-level exclusive lock for bulk mutations.
    AcquireExclusive { holder: String, ttl_secs: u64 },

    /// Release a previously granted token. Idempotent.
    ReleaseExclusive { token: String },

    /// Re-export the JSONL and gracefully stop the daemon.
    Shutdown,

    // Data-plane operations, delegated to storage. Requests made while an
    // exclusive lock is outstanding must carry its token.
    ListIssues {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    GetIssue {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    UpsertIssue {
        issue: Box<Issue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

/// Reply from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Response {
    Status(StatusReply),
    ExclusiveGranted { token: String },
    ExclusiveBusy { holder: String },
    Ok,
    Issues { issues: Vec<Issue> },
    Issue { issue: Option<Box<Issue>> },
    Error { message: String },
}

/// The `Status` reply payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReply {
    pub workspace_path: PathBuf,
    pub database_path: PathBuf,
    pub pid: u32,
    pub version: String,
    pub uptime_seconds: u64,
    pub last_activity_time: DateTime<Utc>,
    pub exclusive_lock_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_lock_holder: Option<String>,
}

/// Write one length-prefixed JSON message.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| BeadsError::Protocol("message exceeds frame limit".to_string()))?;
    if len > MAX_FRAME_BYTES {
        return Err(BeadsError::Protocol(format!(
            "message of {len} bytes exceeds the {MAX_FRAME_BYTES}-byte frame limit"
        )));
    }

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON message.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(BeadsError::Protocol(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_BYTES}-byte limit"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}
