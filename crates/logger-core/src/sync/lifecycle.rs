//! Cloud document lifecycle
//!
//! Tracks the stage of the synced document wrapping the database file.
//! The store only counts as ready once the document has reported a
//! successful open AND the schema setup on the opened file has finished.
//! The two arrive independently, so they are folded into `Readiness`
//! rather than checked as loose flags.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Externally visible lifecycle stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// No document is open
    #[default]
    None,
    /// Opening, or recovering from a save error or conflict
    Loading,
    /// Document open and schema ready; the store may be used
    Ready,
}

/// Combination of the two conditions gating readiness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Readiness {
    #[default]
    Pending,
    DocumentOnly,
    SchemaOnly,
    Ready,
}

impl Readiness {
    fn from_flags(document_open: bool, schema_ready: bool) -> Self {
        match (document_open, schema_ready) {
            (false, false) => Readiness::Pending,
            (true, false) => Readiness::DocumentOnly,
            (false, true) => Readiness::SchemaOnly,
            (true, true) => Readiness::Ready,
        }
    }

    pub fn document_open(self) -> bool {
        matches!(self, Readiness::DocumentOnly | Readiness::Ready)
    }

    pub fn schema_ready(self) -> bool {
        matches!(self, Readiness::SchemaOnly | Readiness::Ready)
    }
}

/// Signals reported by the document layer and the schema setup step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    /// An open was started
    Opening,
    /// The document finished opening
    Opened,
    /// Schema setup on the opened database completed
    SchemaReady,
    /// The document failed to save
    SavingError(String),
    /// Another device wrote a conflicting version
    InConflict,
    /// The document was closed
    Closed,
    /// The cloud account or container is not available
    Unavailable,
}

/// Stage before and after applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Stage,
    pub to: Stage,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// The store just became usable
    pub fn became_ready(&self) -> bool {
        self.from != Stage::Ready && self.to == Stage::Ready
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentLifecycle {
    readiness: Readiness,
    /// An open is in progress or completed and not since closed
    active: bool,
    cloud_enabled: bool,
    in_conflict: bool,
    last_error: Option<String>,
}

impl Default for DocumentLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentLifecycle {
    pub fn new() -> Self {
        Self {
            readiness: Readiness::Pending,
            active: false,
            cloud_enabled: true,
            in_conflict: false,
            last_error: None,
        }
    }

    pub fn stage(&self) -> Stage {
        if !self.cloud_enabled || !self.active {
            Stage::None
        } else if self.readiness == Readiness::Ready {
            Stage::Ready
        } else {
            Stage::Loading
        }
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn is_ready(&self) -> bool {
        self.stage() == Stage::Ready
    }

    pub fn cloud_enabled(&self) -> bool {
        self.cloud_enabled
    }

    pub fn in_conflict(&self) -> bool {
        self.in_conflict
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Apply a signal and report the resulting stage change
    pub fn apply(&mut self, event: &DocumentEvent) -> Transition {
        let from = self.stage();

        match event {
            DocumentEvent::Opening => {
                self.active = true;
                self.readiness = Readiness::Pending;
                self.in_conflict = false;
                self.last_error = None;
            }
            DocumentEvent::Opened => {
                self.active = true;
                self.set_flags(true, self.readiness.schema_ready());
            }
            DocumentEvent::SchemaReady => {
                self.set_flags(self.readiness.document_open(), true);
            }
            DocumentEvent::SavingError(message) => {
                warn!(error = %message, "Document failed to save");
                self.last_error = Some(message.clone());
                self.set_flags(false, self.readiness.schema_ready());
            }
            DocumentEvent::InConflict => {
                warn!("Document is in conflict");
                self.in_conflict = true;
                self.set_flags(false, self.readiness.schema_ready());
            }
            DocumentEvent::Closed => {
                self.active = false;
                self.readiness = Readiness::Pending;
            }
            DocumentEvent::Unavailable => {
                self.cloud_enabled = false;
                self.active = false;
                self.readiness = Readiness::Pending;
            }
        }

        let transition = Transition {
            from,
            to: self.stage(),
        };
        if transition.changed() {
            info!(from = ?transition.from, to = ?transition.to, "Document stage changed");
        } else {
            debug!(?event, stage = ?transition.to, "Document event");
        }
        transition
    }

    /// Re-enable cloud use after it was disabled; the caller then opens
    /// the document again
    pub fn reenable(&mut self) {
        self.cloud_enabled = true;
        self.active = false;
        self.readiness = Readiness::Pending;
    }

    fn set_flags(&mut self, document_open: bool, schema_ready: bool) {
        self.readiness = Readiness::from_flags(document_open, schema_ready);
    }
}
