//! Storage layer
//!
//! Durable entries in SQLite with an FTS5 index kept in sync by triggers.
//!
//! ## Architecture
//!
//! - **`entry` table**: Source of truth for every entry
//! - **`entry_index`**: Full-text index whose rowid mirrors `entry.id`
//!
//! Callers never write the index directly; schema triggers maintain it.

pub mod error;
pub mod schema;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use schema::{migrate, needs_migration, schema_version, SCHEMA_VERSION};
pub use store::{EntriesResponse, EntryStore};
