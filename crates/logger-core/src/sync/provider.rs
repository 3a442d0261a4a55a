//! Document providers
//!
//! A provider wraps the database file in a syncable document and reports
//! its progress as `DocumentEvent`s on a channel. Events may arrive
//! during `open` or later from the provider's own threads.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::lifecycle::DocumentEvent;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Failed to prepare document directory '{path}': {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Document event channel closed")]
    ChannelClosed,
}

pub type DocumentEvents = mpsc::UnboundedSender<DocumentEvent>;

pub trait DocumentProvider: Send + Sync {
    /// Begin opening the document backing `path`
    fn open(&self, path: &Path, events: &DocumentEvents) -> Result<(), DocumentError>;

    /// Close the document backing `path`
    fn close(&self, path: &Path, events: &DocumentEvents) -> Result<(), DocumentError>;
}

/// Provider for a locally mounted sync container (for example a synced
/// folder). The container must already exist; a missing container is
/// reported as `Unavailable`.
#[derive(Debug, Clone)]
pub struct LocalContainerProvider {
    container: PathBuf,
}

impl LocalContainerProvider {
    pub fn new(container: impl Into<PathBuf>) -> Self {
        Self {
            container: container.into(),
        }
    }

    pub fn container(&self) -> &Path {
        &self.container
    }
}

fn send(events: &DocumentEvents, event: DocumentEvent) -> Result<(), DocumentError> {
    events.send(event).map_err(|_| DocumentError::ChannelClosed)
}

impl DocumentProvider for LocalContainerProvider {
    fn open(&self, path: &Path, events: &DocumentEvents) -> Result<(), DocumentError> {
        send(events, DocumentEvent::Opening)?;

        if !self.container.is_dir() {
            info!(container = %self.container.display(), "Sync container unavailable");
            return send(events, DocumentEvent::Unavailable);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| DocumentError::Prepare {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        debug!(path = %path.display(), "Opened container document");
        send(events, DocumentEvent::Opened)
    }

    fn close(&self, path: &Path, events: &DocumentEvents) -> Result<(), DocumentError> {
        debug!(path = %path.display(), "Closed container document");
        send(events, DocumentEvent::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn drain(rx: &mut mpsc::UnboundedReceiver<DocumentEvent>) -> Vec<DocumentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_open_existing_container() {
        let temp_dir = TempDir::new().unwrap();
        let provider = LocalContainerProvider::new(temp_dir.path());
        let path = temp_dir.path().join("Documents").join("data.logger");
        let (tx, mut rx) = mpsc::unbounded_channel();

        provider.open(&path, &tx).unwrap();

        assert_eq!(drain(&mut rx), vec![DocumentEvent::Opening, DocumentEvent::Opened]);
        assert!(temp_dir.path().join("Documents").is_dir());
    }

    #[test]
    fn test_missing_container_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let provider = LocalContainerProvider::new(temp_dir.path().join("missing"));
        let path = temp_dir.path().join("missing").join("Documents").join("data.logger");
        let (tx, mut rx) = mpsc::unbounded_channel();

        provider.open(&path, &tx).unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![DocumentEvent::Opening, DocumentEvent::Unavailable]
        );
    }

    #[test]
    fn test_close_and_closed_channel() {
        let temp_dir = TempDir::new().unwrap();
        let provider = LocalContainerProvider::new(temp_dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();

        provider.close(temp_dir.path(), &tx).unwrap();
        assert_eq!(drain(&mut rx), vec![DocumentEvent::Closed]);

        drop(rx);
        let err = provider.open(temp_dir.path(), &tx).unwrap_err();
        assert!(matches!(err, DocumentError::ChannelClosed));
    }
}
