//! Suspend/resume snapshot
//!
//! Saves the parts of `State` that are not derivable from the database:
//! the undo stack and the active search query. Restored on next open so
//! an undo survives a relaunch.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::{State, Undo};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub undo: Undo,
    pub query: Option<String>,
}

impl Snapshot {
    pub fn capture(state: &State) -> Self {
        Self {
            undo: state.undo.clone(),
            query: state.search.query.clone(),
        }
    }

    /// Apply onto a freshly created state
    pub fn restore_into(self, state: &mut State) {
        state.undo = self.undo;
        state.search.query = self.query;
    }

    /// Save snapshot to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, json).context("Failed to save snapshot")?;
        debug!(path = %path.display(), deleted = self.undo.deleted.len(), "Saved snapshot");
        Ok(())
    }

    /// Load a snapshot, `None` when none was saved
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(path).context("Failed to read snapshot")?;
        let snapshot = serde_json::from_str(&json).context("Failed to parse snapshot")?;
        Ok(Some(snapshot))
    }

    /// Load and remove a snapshot so it is applied at most once
    pub fn take(path: &Path) -> Result<Option<Self>> {
        let snapshot = Self::load(path);
        if path.exists() {
            fs::remove_file(path).context("Failed to remove snapshot")?;
        }
        snapshot
    }

    /// Staged photos the undo stack still points at
    pub fn staged_photos(&self) -> Vec<PathBuf> {
        self.undo
            .deleted
            .iter()
            .filter_map(|e| e.image.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{image_token, Entry, EntryRecord};
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache").join("snapshot.json");

        let mut state = State::default();
        let mut record = EntryRecord::new(image_token("5.png"));
        record.id = 4;
        state.push_undo(Entry::from_record(&record, Path::new("/cache/Photos")), 10);
        state.set_search(Some("milk".to_string()), vec![1]);

        Snapshot::capture(&state).save(&path).unwrap();

        let loaded = Snapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded.query.as_deref(), Some("milk"));
        assert_eq!(loaded.staged_photos(), vec![PathBuf::from("/cache/Photos/5.png")]);

        let mut fresh = State::default();
        loaded.restore_into(&mut fresh);
        assert_eq!(fresh.undo.deleted.len(), 1);
        assert_eq!(fresh.undo.deleted[0].id, 4);
        // Results are recomputed, never restored
        assert!(fresh.search.results.is_empty());
    }

    #[test]
    fn test_missing_snapshot_loads_none() {
        let temp_dir = TempDir::new().unwrap();
        assert!(Snapshot::load(&temp_dir.path().join("none.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_take_consumes_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("snapshot.json");
        Snapshot::default().save(&path).unwrap();

        assert!(Snapshot::take(&path).unwrap().is_some());
        assert!(!path.exists());
        assert!(Snapshot::take(&path).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("snapshot.json");
        fs::write(&path, "{not json").unwrap();
        assert!(Snapshot::load(&path).is_err());
    }
}
