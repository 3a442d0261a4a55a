//! Data models for Logger
//!
//! `EntryRecord` is the row as stored; `Entry` is the projection held in
//! `State`, with dates decoded and the photo reference resolved.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Opening of the token that embeds a photo in entry text
const IMAGE_TOKEN_PREFIX: &str = "![image](";

/// Photo extensions accepted inside an image token
pub const IMAGE_EXTENSIONS: &[&str] = &["jpeg", "jpg", "png"];

/// A persisted entry row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    /// Assigned by the store on insert; ignored when inserting
    pub id: i64,
    pub text: String,
    pub color: i64,
    /// Unix epoch seconds
    pub created: i64,
    /// Unix epoch seconds
    pub modified: i64,
}

impl EntryRecord {
    /// A new, not yet persisted record stamped with the current time
    pub fn new(text: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: 0,
            text: text.into(),
            color: 0,
            created: now,
            modified: now,
        }
    }

    pub fn with_color(mut self, color: i64) -> Self {
        self.color = color;
        self
    }

    /// Replace the text and bump `modified`
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.modified = Utc::now().timestamp();
    }

    /// Replace the color and bump `modified`
    pub fn set_color(&mut self, color: i64) {
        self.color = color;
        self.modified = Utc::now().timestamp();
    }
}

/// An entry as seen by state subscribers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub text: String,
    pub color: i64,
    /// Resolved location of the embedded photo, if the text is an image token
    pub image: Option<PathBuf>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Entry {
    /// Project a stored record, resolving any photo against `photos_dir`
    pub fn from_record(record: &EntryRecord, photos_dir: &Path) -> Self {
        Self {
            id: record.id,
            text: record.text.clone(),
            color: record.color,
            image: image_filename(&record.text).map(|name| photos_dir.join(name)),
            created: parse_epoch(record.created),
            modified: parse_epoch(record.modified),
        }
    }

    /// The record to re-insert when restoring this entry
    pub fn to_record(&self) -> EntryRecord {
        EntryRecord {
            id: self.id,
            text: self.text.clone(),
            color: self.color,
            created: self.created.timestamp(),
            modified: self.modified.timestamp(),
        }
    }
}

/// Build the text of an entry that embeds the given photo file
pub fn image_token(filename: &str) -> String {
    format!("{IMAGE_TOKEN_PREFIX}{filename})")
}

/// Extract the photo file name when the whole text is an image token.
///
/// The name must be a plain file name (digits, then a known extension);
/// anything else is treated as ordinary text.
pub fn image_filename(text: &str) -> Option<&str> {
    let name = text.strip_prefix(IMAGE_TOKEN_PREFIX)?.strip_suffix(')')?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if !IMAGE_EXTENSIONS.contains(&ext) {
        return None;
    }
    Some(name)
}

/// Decode epoch seconds, falling back to now for out-of-range values
pub fn parse_epoch(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .unwrap_or_else(Utc::now)
}
