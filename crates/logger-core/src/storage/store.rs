//! SQLite entry store
//!
//! Durable CRUD and full-text search over entries. Every write checks
//! that exactly one row was affected so silent no-ops surface as
//! `StoreError::Failure`.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::error::{StoreError, StoreResult};
use super::schema::migrate;
use crate::models::EntryRecord;

const SELECT_ENTRY: &str = "SELECT id, text, color, created, modified FROM entry";

/// All entries, in no particular order
#[derive(Debug, Clone, Default)]
pub struct EntriesResponse {
    pub entries: Vec<EntryRecord>,
}

/// SQLite-backed entry store
pub struct EntryStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl EntryStore {
    /// Open or create the database at `path`, applying pending migrations
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDirectory {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let mut conn = Connection::open(path)?;
        let version = migrate(&mut conn)?;
        info!(path = %path.display(), version, "Opened entry database");

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self { conn, path: None })
    }

    /// Location of the database file, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ==================== Queries ====================

    /// Get all entries; callers sort as they need
    pub fn entries(&self) -> StoreResult<EntriesResponse> {
        let mut stmt = self.conn.prepare(&format!("{SELECT_ENTRY};"))?;
        let entries = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EntriesResponse { entries })
    }

    /// Get an entry by id
    pub fn entry(&self, id: i64) -> StoreResult<EntryRecord> {
        self.conn
            .query_row(
                &format!("{SELECT_ENTRY} WHERE id = ?1;"),
                params![id],
                record_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::Missing(format!("Entry for id '{id}' not found")))
    }

    /// Number of stored entries
    pub fn count(&self) -> StoreResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM entry", [], |row| row.get(0))?)
    }

    /// Search entry text, returning ids in relevance order.
    ///
    /// Each word of the query becomes a quoted prefix term, so the query
    /// is never interpreted as FTS syntax. Blank queries match nothing.
    pub fn search(&self, query: &str) -> StoreResult<Vec<i64>> {
        let Some(expr) = match_expression(query) else {
            return Ok(Vec::new());
        };

        let mut stmt = self.conn.prepare(
            "SELECT rowid FROM entry_index WHERE entry_index MATCH ?1 ORDER BY rank;",
        )?;
        let ids = stmt
            .query_map(params![expr], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        debug!(query, hits = ids.len(), "Searched entries");
        Ok(ids)
    }

    // ==================== Writes ====================

    /// Insert a new entry; the store assigns the id
    pub fn insert(&self, record: &EntryRecord) -> StoreResult<EntryRecord> {
        let changed = self.conn.execute(
            "INSERT INTO entry (text, color, created, modified) VALUES (?1, ?2, ?3, ?4);",
            params![record.text, record.color, record.created, record.modified],
        )?;
        if changed != 1 {
            return Err(StoreError::Failure("Failed to insert entry".to_string()));
        }
        self.entry(self.conn.last_insert_rowid())
    }

    /// Update text, color and modified; `id` and `created` never change
    pub fn update(&self, record: &EntryRecord, id: i64) -> StoreResult<EntryRecord> {
        let changed = self.conn.execute(
            "UPDATE entry SET text = ?1, color = ?2, modified = ?3 WHERE id = ?4;",
            params![record.text, record.color, record.modified, id],
        )?;
        if changed != 1 {
            return Err(StoreError::Failure(format!(
                "Failed to update entry '{id}'"
            )));
        }
        self.entry(id)
    }

    /// Delete an entry; its index row goes with it via trigger
    pub fn delete(&self, id: i64) -> StoreResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM entry WHERE id = ?1;", params![id])?;
        if changed != 1 {
            return Err(StoreError::Failure(format!(
                "Failed to delete entry '{id}'"
            )));
        }
        Ok(())
    }

    /// Re-insert a previously deleted entry.
    ///
    /// Text, color and both timestamps are preserved, but the row gets a
    /// new id: restore is re-creation, not resurrection.
    pub fn restore(&self, record: &EntryRecord) -> StoreResult<EntryRecord> {
        let restored = self.insert(record)?;
        debug!(old_id = record.id, new_id = restored.id, "Restored entry");
        Ok(restored)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<EntryRecord> {
    Ok(EntryRecord {
        id: row.get(0)?,
        text: row.get(1)?,
        color: row.get(2)?,
        created: row.get(3)?,
        modified: row.get(4)?,
    })
}

/// Turn free text into an FTS5 expression of quoted prefix terms
fn match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{term}\"*"))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}
