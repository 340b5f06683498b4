//! Storage for the coordination core.
//!
//! The core consumes a narrow slice of the storage engine: issue upsert and
//! listing for export, the dirty set, the metadata table, and the
//! collision-remapping importer. Everything else (query planning, search,
//! compaction) lives outside this crate.

pub mod schema;
pub mod sqlite;

pub use sqlite::{ImportOutcome, SqliteStorage};

/// Metadata keys owned by the coordination core.
pub mod meta {
    /// Hex SHA-256 of the last successfully imported JSONL bytes.
    pub const LAST_IMPORT_HASH: &str = "last_import_hash";
    /// RFC 3339 timestamp of the last successful import.
    pub const LAST_IMPORT_TIME: &str = "last_import_time";
    /// RFC 3339 timestamp of the last successful export.
    pub const LAST_EXPORT_TIME: &str = "last_export_time";
    /// Repository fingerprint; absent on legacy databases.
    pub const REPO_ID: &str = "repo_id";
    /// Daemon version that last touched the database.
    pub const BD_VERSION: &str = "bd_version";
    /// Prefix for collision-remap provenance rows:
    /// `remapped_from:<old-id>:<created_at_nanos>` -> assigned id.
    pub const REMAPPED_FROM_PREFIX: &str = "remapped_from:";
}
