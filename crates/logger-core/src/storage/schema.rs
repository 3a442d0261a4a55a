//! SQLite schema and migrations for the entry store
//!
//! The `entry` table is the durable record. `entry_index` is an FTS5
//! table whose rowid mirrors `entry.id`; three triggers keep it in
//! lockstep with every insert, text update and delete.
//!
//! Migrations are ordered and versioned. Each one runs in its own
//! transaction and bumps `schema_info.version` on success, so a failure
//! leaves the database at the last good version.

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use super::error::{StoreError, StoreResult};

/// Current schema version for migrations
pub const SCHEMA_VERSION: u32 = 2;

/// Entry table, full-text index and the triggers maintaining it.
///
/// Uses `IF NOT EXISTS` throughout so database files written before
/// versioning existed are adopted in place.
const V1_ENTRY_AND_INDEX: &str = r#"
    CREATE TABLE IF NOT EXISTS entry (
        id integer PRIMARY KEY AUTOINCREMENT NOT NULL,
        text text NOT NULL,
        color integer NOT NULL,
        created integer NOT NULL,
        modified integer NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_entry_created ON entry(created);

    CREATE VIRTUAL TABLE IF NOT EXISTS entry_index USING fts5(text, tokenize=porter);

    CREATE TRIGGER IF NOT EXISTS after_entry_insert AFTER INSERT ON entry BEGIN
        INSERT INTO entry_index (rowid, text) VALUES (new.id, new.text);
    END;

    CREATE TRIGGER IF NOT EXISTS after_entry_update AFTER UPDATE OF text ON entry BEGIN
        UPDATE entry_index SET text = new.text WHERE rowid = old.id;
    END;

    CREATE TRIGGER IF NOT EXISTS after_entry_delete AFTER DELETE ON entry BEGIN
        DELETE FROM entry_index WHERE rowid = old.id;
    END;
"#;

/// Index rows written by builds that had no delete trigger or no index at all.
const V2_BACKFILL_INDEX: &str = r#"
    DELETE FROM entry_index WHERE rowid NOT IN (SELECT id FROM entry);
    INSERT INTO entry_index (rowid, text)
        SELECT id, text FROM entry WHERE id NOT IN (SELECT rowid FROM entry_index);
"#;

const MIGRATIONS: &[(u32, &str)] = &[(1, V1_ENTRY_AND_INDEX), (2, V2_BACKFILL_INDEX)];

/// Bring the database up to `SCHEMA_VERSION`, returning the resulting version.
///
/// Idempotent: running it against an up-to-date database is a no-op.
pub fn migrate(conn: &mut Connection) -> StoreResult<u32> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_info (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )?;

    let current = schema_version(conn)?.unwrap_or(0);

    for &(version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .map_err(|source| StoreError::Migration { version, source })?;
        tx.execute(
            "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?1)",
            [version.to_string()],
        )?;
        tx.commit()?;
        debug!(version, "Applied schema migration");
    }

    Ok(schema_version(conn)?.unwrap_or(current))
}

/// Get the current schema version from the database
pub fn schema_version(conn: &Connection) -> StoreResult<Option<u32>> {
    if !table_exists(conn, "schema_info")? {
        return Ok(None);
    }

    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_info WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(value.and_then(|v| v.parse().ok()))
}

/// Check if the schema needs initialization or migration
pub fn needs_migration(conn: &Connection) -> bool {
    match schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}

fn table_exists(conn: &Connection, name: &str) -> StoreResult<bool> {
    let mut stmt = conn.prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1")?;
    Ok(stmt.exists([name])?)
}
