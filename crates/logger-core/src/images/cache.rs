//! Byte-bounded in-memory image cache
//!
//! Least-recently-used eviction, costed by decoded pixel bytes rather
//! than entry count.

use std::sync::Arc;

use image::DynamicImage;
use lru::LruCache;
use reqwest::Url;
use tracing::debug;

use super::ImageSize;

/// Full-size images are keyed with `size: None`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub url: Url,
    pub size: Option<ImageSize>,
}

impl CacheKey {
    pub fn new(url: &Url, size: Option<ImageSize>) -> Self {
        Self {
            url: url.clone(),
            size,
        }
    }

    pub fn full_size(url: &Url) -> Self {
        Self::new(url, None)
    }
}

pub struct ImageCache {
    entries: LruCache<CacheKey, Arc<DynamicImage>>,
    capacity_bytes: usize,
    used_bytes: usize,
}

fn cost(image: &DynamicImage) -> usize {
    image.as_bytes().len()
}

impl ImageCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity_bytes,
            used_bytes: 0,
        }
    }

    /// Look up an image, marking it most recently used
    pub fn get(&mut self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains(key)
    }

    /// Store an image, evicting least recently used entries to fit.
    ///
    /// Images larger than the whole budget are not cached.
    pub fn insert(&mut self, key: CacheKey, image: Arc<DynamicImage>) {
        let size = cost(&image);
        if size > self.capacity_bytes {
            debug!(url = %key.url, bytes = size, "Image exceeds cache budget, not caching");
            return;
        }

        if let Some(old) = self.entries.put(key, image) {
            self.used_bytes -= cost(&old);
        }
        self.used_bytes += size;

        while self.used_bytes > self.capacity_bytes {
            match self.entries.pop_lru() {
                Some((evicted, image)) => {
                    self.used_bytes -= cost(&image);
                    debug!(url = %evicted.url, size = ?evicted.size, "Evicted cached image");
                }
                None => break,
            }
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.used_bytes = 0;
    }
}
