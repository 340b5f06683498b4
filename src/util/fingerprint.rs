//! Repository fingerprints.
//!
//! The daemon refuses to open a database that was initialized for a different
//! repository. The fingerprint prefers the git `remote.origin.url` (stable
//! across clones of the same remote); workspaces without a remote fall back to
//! the canonicalized workspace root, which pins the database to its directory.

use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Command;

/// Compute the fingerprint for a workspace root.
///
/// Never fails: a missing git binary or remote degrades to the path-based
/// fingerprint.
#[must_use]
pub fn repo_fingerprint(workspace_root: &Path) -> String {
    let seed = origin_url(workspace_root).unwrap_or_else(|| {
        workspace_root
            .canonicalize()
            .unwrap_or_else(|_| workspace_root.to_path_buf())
            .to_string_lossy()
            .into_owned()
    });

    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn origin_url(workspace_root: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(workspace_root)
        .args(["config", "--get", "remote.origin.url"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if url.is_empty() { None } else { Some(url) }
}
