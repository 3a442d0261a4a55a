//! Cloud document sync
//!
//! The database file can live inside a synced container. A
//! `DocumentProvider` reports the document's progress as events, and
//! `DocumentLifecycle` folds them into a `Stage`.
//!
//! ## Readiness
//!
//! 1. The provider reports `Opening`, then `Opened`
//! 2. The Kit runs schema setup on the opened file and reports `SchemaReady`
//! 3. Only with both signals in does the stage become `Ready`

pub mod lifecycle;
pub mod provider;

pub use lifecycle::{DocumentEvent, DocumentLifecycle, Readiness, Stage, Transition};
pub use provider::{DocumentError, DocumentEvents, DocumentProvider, LocalContainerProvider};
