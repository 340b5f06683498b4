//! Shared helpers: content hashing, repository fingerprints, ID validation.

pub mod fingerprint;
pub mod hash;

pub use fingerprint::repo_fingerprint;
pub use hash::{sha256_bytes, sha256_file};

use once_cell::sync::Lazy;
use regex::Regex;

/// Issue IDs are `prefix-integer`, e.g. `bd-42`. The prefix starts with a
/// letter; nothing else is accepted on import.
static ID_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*-[0-9]+$").expect("static regex"));

/// Check whether an issue ID has the canonical `prefix-integer` shape.
#[must_use]
pub fn is_valid_id_format(id: &str) -> bool {
    ID_FORMAT.is_match(id)
}

/// Split a canonical ID into its prefix and numeric suffix.
#[must_use]
pub fn split_id(id: &str) -> Option<(&str, u64)> {
    let (prefix, num) = id.rsplit_once('-')?;
    if prefix.is_empty() || !prefix.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    num.parse().ok().map(|n| (prefix, n))
}
