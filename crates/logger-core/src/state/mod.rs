//! In-memory state projection
//!
//! `State` is what subscribers observe. It is never edited in place by
//! collaborators: the `StateManager` clones the committed snapshot, applies
//! a mutation and publishes the result.
//!
//! The mutation helpers here are plain functions over `&mut State` so they
//! compose inside commit closures and overlays alike.

pub mod manager;
pub mod subscription;
pub mod timeline;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::Entry;
use crate::sync::lifecycle::Stage;

pub use manager::{Mutation, OverlayToken, StateManager};
pub use subscription::{Delivery, Subscription};
pub use timeline::{Day, Timeline};

/// The last evaluated search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Search {
    /// `None` or empty means no active filter
    pub query: Option<String>,
    /// Matching ids in relevance order
    pub results: Vec<i64>,
}

impl Search {
    pub fn is_active(&self) -> bool {
        self.query.as_deref().is_some_and(|q| !q.trim().is_empty())
    }
}

/// Soft-deleted entries, most recent last
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Undo {
    pub deleted: Vec<Entry>,
}

/// Snapshot observed by subscribers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    pub entries: HashMap<i64, Entry>,
    pub timeline: Timeline,
    pub search: Search,
    pub undo: Undo,
    pub cloud_enabled: bool,
    pub stage: Stage,
}

impl State {
    /// Entries sorted by creation time, newest first
    pub fn entries_newest_first(&self) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by(|a, b| b.created.cmp(&a.created).then(b.id.cmp(&a.id)));
        entries
    }

    /// Entries matching the active search in result order, or all entries
    /// newest first when no search is active
    pub fn visible_entries(&self) -> Vec<&Entry> {
        if !self.search.is_active() {
            return self.entries_newest_first();
        }
        self.search
            .results
            .iter()
            .filter_map(|id| self.entries.get(id))
            .collect()
    }

    // ==================== Mutations ====================

    /// Replace all entries and regroup the timeline
    pub fn hydrate(&mut self, entries: Vec<Entry>) {
        self.entries = entries.into_iter().map(|e| (e.id, e)).collect();
        self.search.results.retain(|id| self.entries.contains_key(id));
        self.refresh_timeline();
    }

    pub fn insert_entry(&mut self, entry: Entry) {
        self.entries.insert(entry.id, entry);
        self.refresh_timeline();
    }

    /// Replace an existing entry; unknown ids are ignored so a late update
    /// cannot resurrect a deleted entry
    pub fn update_entry(&mut self, entry: Entry) -> bool {
        match self.entries.get_mut(&entry.id) {
            Some(existing) => {
                *existing = entry;
                true
            }
            None => false,
        }
    }

    /// Drop an entry from the map, the timeline and any search results
    pub fn remove_entry(&mut self, id: i64) -> Option<Entry> {
        let removed = self.entries.remove(&id);
        if removed.is_some() {
            self.search.results.retain(|r| *r != id);
            self.refresh_timeline();
        }
        removed
    }

    pub fn set_search(&mut self, query: Option<String>, results: Vec<i64>) {
        self.search = Search { query, results };
    }

    /// Push a deleted entry, returning any that fell off the bottom of a
    /// stack bounded by `capacity`
    pub fn push_undo(&mut self, entry: Entry, capacity: usize) -> Vec<Entry> {
        self.undo.deleted.push(entry);
        let overflow = self.undo.deleted.len().saturating_sub(capacity.max(1));
        self.undo.deleted.drain(..overflow).collect()
    }

    pub fn pop_undo(&mut self) -> Option<Entry> {
        self.undo.deleted.pop()
    }

    pub fn refresh_timeline(&mut self) {
        self.timeline = Timeline::build(&self.entries);
    }
}
