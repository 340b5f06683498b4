//! `SQLite` storage implementation.

use crate::error::{BeadsError, Result};
use crate::model::{Comment, Dependency, Issue, IssueType, Priority, Status};
use crate::storage::meta;
use crate::storage::schema::apply_schema;
use crate::util::split_id;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// SQLite-based storage backend.
///
/// The owning daemon holds the only open handle while it runs; all other
/// processes reach the data through the daemon's RPC surface.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
}

/// Result of a bulk import, per the `ImportFunc` contract.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Rows inserted (including remapped inserts).
    pub created: usize,
    /// Rows updated in place.
    pub updated: usize,
    /// Original JSONL ID -> assigned ID, for records whose IDs collided with
    /// rows of a different identity. Empty when no remapping occurred.
    pub id_mapping: BTreeMap<String, String>,
}

impl ImportOutcome {
    /// True when any row was created, updated, or remapped.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.created > 0 || self.updated > 0 || !self.id_mapping.is_empty()
    }
}

impl SqliteStorage {
    /// Open a connection to the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, Some(30_000))
    }

    /// Open with an explicit busy timeout (ms).
    pub fn open_with_timeout(path: &Path, lock_timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;
        if let Some(timeout) = lock_timeout_ms {
            conn.busy_timeout(Duration::from_millis(timeout))?;
        }
        conn.pragma_update(None, "foreign_keys", "ON")?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database for testing.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    // === Metadata ===

    /// Get a metadata value by key.
    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let result =
            self.conn
                .query_row("SELECT value FROM metadata WHERE key = ?", [key], |row| {
                    row.get(0)
                });
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(BeadsError::Database(e)),
        }
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)",
            [key, value],
        )?;
        Ok(())
    }

    /// Delete a metadata key. Missing keys are not an error.
    pub fn delete_metadata(&mut self, key: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM metadata WHERE key = ?", [key])?;
        Ok(count > 0)
    }

    // === Issues ===

    /// Count all issues.
    pub fn count_issues(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT count(*) FROM issues", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Fetch a single issue with relations populated.
    pub fn get_issue(&self, id: &str) -> Result<Option<Issue>> {
        let issue = self
            .conn
            .query_row(
                "SELECT id, title, description, design, acceptance_criteria, notes,
                        status, priority, issue_type, assignee, external_ref, source_repo,
                        created_at, updated_at, closed_at
                 FROM issues WHERE id = ?",
                [id],
                row_to_issue,
            )
            .optional()?;

        let Some(mut issue) = issue else {
            return Ok(None);
        };
        self.populate_relations(&mut issue)?;
        Ok(Some(issue))
    }

    /// All issues sorted by ID with dependencies, labels, and comments
    /// populated, ready for export.
    pub fn all_issues_for_export(&self) -> Result<Vec<Issue>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, design, acceptance_criteria, notes,
                    status, priority, issue_type, assignee, external_ref, source_repo,
                    created_at, updated_at, closed_at
             FROM issues ORDER BY id",
        )?;
        let mut issues = stmt
            .query_map([], row_to_issue)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for issue in &mut issues {
            self.populate_relations(issue)?;
        }
        Ok(issues)
    }

    /// Insert or replace an issue and its relations, marking it dirty.
    pub fn upsert_issue(&mut self, issue: &Issue) -> Result<()> {
        let tx = self.conn.transaction()?;
        write_issue(&tx, issue)?;
        mark_dirty_tx(&tx, &issue.id)?;
        tx.commit()?;
        Ok(())
    }

    fn populate_relations(&self, issue: &mut Issue) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT issue_id, depends_on_id, type, created_at
             FROM dependencies WHERE issue_id = ? ORDER BY depends_on_id, type",
        )?;
        issue.dependencies = stmt
            .query_map([&issue.id], |row| {
                Ok(Dependency {
                    issue_id: row.get(0)?,
                    depends_on_id: row.get(1)?,
                    dep_type: row.get(2)?,
                    created_at: parse_ts(row, 3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = self
            .conn
            .prepare_cached("SELECT label FROM labels WHERE issue_id = ? ORDER BY label")?;
        issue.labels = stmt
            .query_map([&issue.id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare_cached(
            "SELECT id, issue_id, author, text, created_at
             FROM comments WHERE issue_id = ? ORDER BY created_at, id",
        )?;
        issue.comments = stmt
            .query_map([&issue.id], |row| {
                Ok(Comment {
                    id: row.get(0)?,
                    issue_id: row.get(1)?,
                    author: row.get(2)?,
                    body: row.get(3)?,
                    created_at: parse_ts(row, 4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(())
    }

    // === Dirty set ===

    /// IDs of all issues modified since their last export, oldest first.
    pub fn dirty_issue_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT issue_id FROM dirty_issues ORDER BY marked_at, issue_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Clear dirty flags for the given issue IDs.
    pub fn clear_dirty_issues(&mut self, issue_ids: &[String]) -> Result<usize> {
        if issue_ids.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut cleared = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM dirty_issues WHERE issue_id = ?")?;
            for id in issue_ids {
                cleared += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(cleared)
    }

    /// Mark a single issue dirty.
    pub fn mark_dirty(&mut self, issue_id: &str) -> Result<()> {
        mark_dirty_tx(&self.conn, issue_id)
    }

    // === Import ===

    /// Bulk-import parsed issues with ID-collision remapping.
    ///
    /// Identity is `(id, created_at)`:
    /// - unknown id: insert as-is
    /// - same id, same `created_at`: same issue; newer `updated_at` wins
    /// - same id, different `created_at`: different identity; the incoming
    ///   record is remapped to the next free sequential id for its prefix
    ///
    /// Remaps are recorded as `remapped_from:<id>:<nanos>` metadata rows so a
    /// later import of the same original identity re-uses the assignment
    /// instead of minting another id.
    pub fn import_issues(&mut self, issues: &[Issue]) -> Result<ImportOutcome> {
        let tx = self.conn.transaction()?;
        let mut outcome = ImportOutcome::default();

        for incoming in issues {
            let provenance_key = remap_key(&incoming.id, incoming.created_at);
            let prior_assignment: Option<String> = tx
                .query_row(
                    "SELECT value FROM metadata WHERE key = ?",
                    [&provenance_key],
                    |row| row.get(0),
                )
                .optional()?;

            // An identity we already remapped comes back under its old id in
            // stale JSONL; route it to the recorded assignment.
            let (effective_id, was_remapped) = match prior_assignment {
                Some(assigned) => {
                    outcome
                        .id_mapping
                        .insert(incoming.id.clone(), assigned.clone());
                    (assigned, true)
                }
                None => (incoming.id.clone(), false),
            };

            let existing: Option<(DateTime<Utc>, DateTime<Utc>)> = tx
                .query_row(
                    "SELECT created_at, updated_at FROM issues WHERE id = ?",
                    [&effective_id],
                    |row| Ok((parse_ts(row, 0)?, parse_ts(row, 1)?)),
                )
                .optional()?;

            match existing {
                None => {
                    let mut record = incoming.clone();
                    record.id.clone_from(&effective_id);
                    write_issue(&tx, &record)?;
                    mark_dirty_tx(&tx, &record.id)?;
                    outcome.created += 1;
                }
                Some((created_at, updated_at))
                    if created_at == incoming.created_at || was_remapped =>
                {
                    if incoming.updated_at > updated_at {
                        let mut record = incoming.clone();
                        record.id.clone_from(&effective_id);
                        write_issue(&tx, &record)?;
                        mark_dirty_tx(&tx, &record.id)?;
                        outcome.updated += 1;
                    }
                }
                Some(_) => {
                    // Same id, different identity: remap the incoming record.
                    let assigned = next_free_id_tx(&tx, &incoming.id)?;
                    let mut record = incoming.clone();
                    record.id.clone_from(&assigned);
                    write_issue(&tx, &record)?;
                    mark_dirty_tx(&tx, &assigned)?;
                    tx.execute(
                        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)",
                        [&provenance_key, &assigned],
                    )?;
                    outcome.id_mapping.insert(incoming.id.clone(), assigned);
                    outcome.created += 1;
                }
            }
        }

        tx.commit()?;
        Ok(outcome)
    }
}

fn remap_key(id: &str, created_at: DateTime<Utc>) -> String {
    format!(
        "{}{}:{}",
        meta::REMAPPED_FROM_PREFIX,
        id,
        created_at.timestamp_nanos_opt().unwrap_or_default()
    )
}

/// Next free `prefix-N` where N is one past the highest numeric suffix in use.
fn next_free_id_tx(tx: &Transaction<'_>, colliding_id: &str) -> Result<String> {
    let prefix = split_id(colliding_id).map_or_else(
        || {
            colliding_id
                .rsplit_once('-')
                .map_or(colliding_id, |(p, _)| p)
                .to_string()
        },
        |(p, _)| p.to_string(),
    );

    let pattern = format!("{prefix}-%");
    let mut stmt = tx.prepare("SELECT id FROM issues WHERE id LIKE ?")?;
    let ids = stmt
        .query_map([&pattern], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let max = ids
        .iter()
        .filter_map(|id| split_id(id))
        .filter(|(p, _)| *p == prefix)
        .map(|(_, n)| n)
        .max()
        .unwrap_or(0);

    Ok(format!("{prefix}-{}", max + 1))
}

fn write_issue(conn: &Connection, issue: &Issue) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO issues
            (id, title, description, design, acceptance_criteria, notes,
             status, priority, issue_type, assignee, external_ref, source_repo,
             created_at, updated_at, closed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            issue.id,
            issue.title,
            issue.description,
            issue.design,
            issue.acceptance_criteria,
            issue.notes,
            issue.status.as_str(),
            issue.priority.0,
            issue.issue_type.as_str(),
            issue.assignee,
            issue.external_ref,
            issue.source_repo,
            issue.created_at.to_rfc3339(),
            issue.updated_at.to_rfc3339(),
            issue.closed_at.map(|dt| dt.to_rfc3339()),
        ],
    )?;

    // Relations are replaced wholesale; JSONL carries the full set.
    conn.execute("DELETE FROM dependencies WHERE issue_id = ?", [&issue.id])?;
    for dep in &issue.dependencies {
        conn.execute(
            "INSERT OR REPLACE INTO dependencies (issue_id, depends_on_id, type, created_at)
             VALUES (?, ?, ?, ?)",
            params![
                issue.id,
                dep.depends_on_id,
                dep.dep_type,
                dep.created_at.to_rfc3339()
            ],
        )?;
    }

    conn.execute("DELETE FROM labels WHERE issue_id = ?", [&issue.id])?;
    for label in &issue.labels {
        conn.execute(
            "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
            params![issue.id, label],
        )?;
    }

    conn.execute("DELETE FROM comments WHERE issue_id = ?", [&issue.id])?;
    for comment in &issue.comments {
        conn.execute(
            "INSERT INTO comments (issue_id, author, text, created_at) VALUES (?, ?, ?, ?)",
            params![
                issue.id,
                comment.author,
                comment.body,
                comment.created_at.to_rfc3339()
            ],
        )?;
    }

    Ok(())
}

fn mark_dirty_tx(conn: &Connection, issue_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO dirty_issues (issue_id, marked_at) VALUES (?, ?)",
        params![issue_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn row_to_issue(row: &Row<'_>) -> rusqlite::Result<Issue> {
    let status: String = row.get(6)?;
    let issue_type: String = row.get(8)?;
    Ok(Issue {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        design: row.get(3)?,
        acceptance_criteria: row.get(4)?,
        notes: row.get(5)?,
        status: Status::from_str(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::other(e.to_string())),
            )
        })?,
        priority: Priority(row.get(7)?),
        issue_type: IssueType::from_str(&issue_type).unwrap_or_default(),
        assignee: row.get(9)?,
        external_ref: row.get(10)?,
        source_repo: row.get(11)?,
        created_at: parse_ts(row, 12)?,
        updated_at: parse_ts(row, 13)?,
        closed_at: parse_opt_ts(row, 14)?,
        labels: vec![],
        dependencies: vec![],
        comments: vec![],
    })
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        None => Ok(None),
        Some(text) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}
