//! Image load diagnostics
//!
//! Every load event is recorded and folded into `ImageInfo` on demand.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use reqwest::Url;

use super::ImageSize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageEventKind {
    Requested,
    Cancelled,
    Downloaded { bytes: usize },
    Resized,
    Completed { from_cache: bool },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEvent {
    pub source: Url,
    pub size: Option<ImageSize>,
    pub time: DateTime<Utc>,
    pub kind: ImageEventKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounts {
    pub requested: usize,
    pub cancelled: usize,
    pub downloaded: usize,
    pub resized: usize,
    pub cache_hits: usize,
    pub completed: usize,
    pub failed: usize,
}

impl LoadCounts {
    fn record(&mut self, kind: &ImageEventKind) {
        match kind {
            ImageEventKind::Requested => self.requested += 1,
            ImageEventKind::Cancelled => self.cancelled += 1,
            ImageEventKind::Downloaded { .. } => self.downloaded += 1,
            ImageEventKind::Resized => self.resized += 1,
            ImageEventKind::Completed { from_cache } => {
                self.completed += 1;
                if *from_cache {
                    self.cache_hits += 1;
                }
            }
            ImageEventKind::Failed { .. } => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageInfo {
    pub per_image: HashMap<Url, LoadCounts>,
    pub cumulative: LoadCounts,
    pub bytes_downloaded: usize,
    /// Cache hits per request; 0 when nothing was requested
    pub cache_hit_rate: f64,
}

#[derive(Debug, Default)]
pub struct Diagnostic {
    events: Mutex<Vec<ImageEvent>>,
}

impl Diagnostic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source: &Url, size: Option<ImageSize>, kind: ImageEventKind) {
        let event = ImageEvent {
            source: source.clone(),
            size,
            time: Utc::now(),
            kind,
        };
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    pub fn events(&self) -> Vec<ImageEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn image_info(&self) -> ImageInfo {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());

        let mut info = ImageInfo::default();
        for event in events.iter() {
            info.per_image
                .entry(event.source.clone())
                .or_default()
                .record(&event.kind);
            info.cumulative.record(&event.kind);
            if let ImageEventKind::Downloaded { bytes } = event.kind {
                info.bytes_downloaded += bytes;
            }
        }

        if info.cumulative.requested > 0 {
            info.cache_hit_rate =
                info.cumulative.cache_hits as f64 / info.cumulative.requested as f64;
        }
        info
    }
}
