//! Logger Core Library
//!
//! Local data, state and sync engine for Logger, a timeline of short
//! notes and photos.
//!
//! # Architecture
//!
//! - **SQLite**: Source of truth for entries, with an FTS5 index kept in
//!   sync by triggers
//! - **State**: Immutable snapshots published to weakly held subscribers
//! - **Images**: Deduplicated loads behind a byte-bounded LRU cache
//! - **Cloud document**: Optional synced container gating database access
//!
//! # Quick Start
//!
//! ```text
//! let kit = Kit::open(Config::load()?)?;
//!
//! // Add an entry
//! let entry = kit.entry_create("buy milk", None)?;
//!
//! // Observe state
//! let state = kit.subscribe(&view, |view, state| view.render(state));
//!
//! // Soft delete and undo
//! kit.entry_delete(entry.id)?;
//! kit.undo_entry_delete()?;
//! ```
//!
//! # Modules
//!
//! - `kit`: Facade coordinating everything below (main entry point)
//! - `storage`: Entry database, schema migrations and store errors
//! - `state`: State snapshots, the state manager and subscriptions
//! - `images`: Image loading, caching and diagnostics
//! - `sync`: Cloud document lifecycle and providers
//! - `messages`: User-facing messages
//! - `config`: Application configuration

pub mod config;
pub mod dispatch;
pub mod images;
pub mod kit;
pub mod messages;
pub mod models;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use dispatch::SerialQueue;
pub use images::{ImageError, ImageLoader, ImageResult, ImageSize, ImageTarget};
pub use kit::{Kit, KitError, KitResult};
pub use messages::{Level, Message, Messages};
pub use models::{Entry, EntryRecord};
pub use snapshot::Snapshot;
pub use state::{State, StateManager, Subscription};
pub use storage::{EntryStore, StoreError, StoreResult};
pub use sync::{DocumentEvent, DocumentLifecycle, DocumentProvider, Stage};
