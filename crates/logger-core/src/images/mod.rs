//! Image loading and caching
//!
//! - At most one fetch is outstanding per (url, size); later requests
//!   join the in-flight load
//! - Targets are held weakly, and loading into a target detaches it from
//!   any other load first, cancelling loads left with no consumers
//! - Full-size images are always cached; sized requests are resized from
//!   the cached full-size image when present
//! - Results are delivered on the main queue
//!
//! No retry logic: a failed load is reported and the next request for
//! the same key fetches again.

pub mod cache;
pub mod diagnostic;
pub mod fetch;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use image::DynamicImage;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dispatch::SerialQueue;

pub use cache::{CacheKey, ImageCache};
pub use diagnostic::{Diagnostic, ImageEvent, ImageEventKind, ImageInfo, LoadCounts};
pub use fetch::{Fetcher, HttpFetcher};

/// Requested bounding box; images are scaled to fit inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Error, Debug, Clone)]
pub enum ImageError {
    #[error("Image not found")]
    ImageNotFound,

    #[error("Image data is malformed")]
    ImageMalformed,

    #[error("Network failure: {0}")]
    NetworkFailure(Arc<dyn std::error::Error + Send + Sync>),

    #[error("Bad request: {0}")]
    RequestBad(String),

    #[error("Unknown image error")]
    Unknown,
}

impl ImageError {
    pub fn network(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        ImageError::NetworkFailure(Arc::new(error))
    }
}

pub type ImageResult = Result<Arc<DynamicImage>, ImageError>;

/// Something that displays a loaded image, such as a reusable view
pub trait ImageTarget: Send + Sync {
    fn image_loaded(&self, result: ImageResult);
}

type Callback = Box<dyn FnOnce(ImageResult) + Send>;

/// One outstanding fetch or resize and everyone waiting on it
struct Load {
    id: u64,
    targets: Vec<Weak<dyn ImageTarget>>,
    callbacks: Vec<Callback>,
    task: Option<JoinHandle<()>>,
}

impl Load {
    fn new(id: u64) -> Self {
        Self {
            id,
            targets: Vec::new(),
            callbacks: Vec::new(),
            task: None,
        }
    }

    fn has_target(&self, identity: *const ()) -> bool {
        self.targets.iter().any(|t| t.as_ptr() as *const () == identity)
    }

    fn detach(&mut self, identity: *const ()) {
        self.targets.retain(|t| t.as_ptr() as *const () != identity);
    }

    fn has_consumers(&self) -> bool {
        !self.callbacks.is_empty() || self.targets.iter().any(|t| t.strong_count() > 0)
    }
}

fn identity(target: &Arc<dyn ImageTarget>) -> *const () {
    Arc::as_ptr(target) as *const ()
}

struct Registry {
    loads: HashMap<CacheKey, Load>,
    cache: ImageCache,
    next_id: u64,
}

impl Registry {
    /// The load for `key`, created if none is in flight
    fn load_for(&mut self, key: &CacheKey) -> &mut Load {
        let next_id = &mut self.next_id;
        self.loads.entry(key.clone()).or_insert_with(|| {
            *next_id += 1;
            Load::new(*next_id)
        })
    }
}

struct Shared {
    registry: Mutex<Registry>,
    fetcher: Arc<dyn Fetcher>,
    runtime: Handle,
    main: SerialQueue,
    diagnostic: Diagnostic,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch, decode, cache full size, then resize and cache if sized
    async fn fetch(&self, key: &CacheKey) -> ImageResult {
        let bytes = self.fetcher.fetch(&key.url).await?;
        self.diagnostic.insert(
            &key.url,
            key.size,
            ImageEventKind::Downloaded { bytes: bytes.len() },
        );

        let full = Arc::new(fetch::decode_blocking(bytes).await?);
        self.lock()
            .cache
            .insert(CacheKey::full_size(&key.url), Arc::clone(&full));

        match key.size {
            Some(size) => self.resize(key, full, size).await,
            None => Ok(full),
        }
    }

    async fn resize(&self, key: &CacheKey, full: Arc<DynamicImage>, size: ImageSize) -> ImageResult {
        let resized = Arc::new(fetch::resize_blocking(full, size).await?);
        self.lock().cache.insert(key.clone(), Arc::clone(&resized));
        self.diagnostic.insert(&key.url, key.size, ImageEventKind::Resized);
        Ok(resized)
    }

    /// Retire load `id` and deliver its result, unless it was cancelled
    fn finish(&self, key: &CacheKey, id: u64, result: ImageResult, from_cache: bool) {
        let load = {
            let mut registry = self.lock();
            match registry.loads.get(key) {
                Some(load) if load.id == id => registry.loads.remove(key),
                _ => None,
            }
        };
        let Some(load) = load else {
            debug!(url = %key.url, "Image load finished after cancellation");
            return;
        };

        match &result {
            Ok(_) => self
                .diagnostic
                .insert(&key.url, key.size, ImageEventKind::Completed { from_cache }),
            Err(e) => {
                warn!(url = %key.url, error = %e, "Image load failed");
                self.diagnostic.insert(
                    &key.url,
                    key.size,
                    ImageEventKind::Failed {
                        error: e.to_string(),
                    },
                );
            }
        }
        self.deliver(load, result);
    }

    fn deliver(&self, load: Load, result: ImageResult) {
        let Load {
            targets, callbacks, ..
        } = load;
        self.main.ensure(move || {
            for target in targets.iter().filter_map(Weak::upgrade) {
                target.image_loaded(result.clone());
            }
            for callback in callbacks {
                callback(result.clone());
            }
        });
    }
}

/// Deduplicating image loader with an in-memory cache
#[derive(Clone)]
pub struct ImageLoader {
    shared: Arc<Shared>,
}

impl ImageLoader {
    /// Build a loader that fetches with `fetcher`, runs work on `runtime`
    /// and delivers results on `main`
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        cache_bytes: usize,
        runtime: Handle,
        main: SerialQueue,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    loads: HashMap::new(),
                    cache: ImageCache::new(cache_bytes),
                    next_id: 0,
                }),
                fetcher,
                runtime,
                main,
                diagnostic: Diagnostic::new(),
            }),
        }
    }

    /// Load an image and hand the result to `then`.
    ///
    /// A missing URL fails with `ImageNotFound`, which lets views clear
    /// themselves through the same path.
    pub fn load(
        &self,
        url: Option<&Url>,
        size: Option<ImageSize>,
        then: impl FnOnce(ImageResult) + Send + 'static,
    ) {
        let Some(url) = url else {
            self.shared
                .main
                .ensure(move || then(Err(ImageError::ImageNotFound)));
            return;
        };

        let key = CacheKey::new(url, size);
        let mut registry = self.shared.lock();
        registry.load_for(&key).callbacks.push(Box::new(then));
        self.shared
            .diagnostic
            .insert(url, size, ImageEventKind::Requested);
        self.run(registry, key);
    }

    /// Load an image into `target`, detaching it from any other load
    pub fn load_into(
        &self,
        url: Option<&Url>,
        size: Option<ImageSize>,
        target: &Arc<dyn ImageTarget>,
    ) {
        let key = url.map(|url| CacheKey::new(url, size));
        let mut registry = self.shared.lock();
        self.detach_locked(&mut registry, target, key.as_ref());

        let Some(key) = key else {
            drop(registry);
            let target = Arc::clone(target);
            self.shared
                .main
                .ensure(move || target.image_loaded(Err(ImageError::ImageNotFound)));
            return;
        };

        let load = registry.load_for(&key);
        if !load.has_target(identity(target)) {
            load.targets.push(Arc::downgrade(target));
        }
        self.shared
            .diagnostic
            .insert(&key.url, size, ImageEventKind::Requested);
        self.run(registry, key);
    }

    /// Warm the cache without a consumer
    pub fn preload(&self, url: Option<&Url>, size: Option<ImageSize>) {
        self.load(url, size, |_| {});
    }

    /// Detach `target` from whatever it is waiting on
    pub fn detach(&self, target: &Arc<dyn ImageTarget>) {
        let mut registry = self.shared.lock();
        self.detach_locked(&mut registry, target, None);
    }

    pub fn image_info(&self) -> ImageInfo {
        self.shared.diagnostic.image_info()
    }

    /// Loads still waiting on a fetch or resize
    pub fn active_loads(&self) -> usize {
        self.shared.lock().loads.len()
    }

    pub fn is_cached(&self, url: &Url, size: Option<ImageSize>) -> bool {
        self.shared.lock().cache.contains(&CacheKey::new(url, size))
    }

    pub fn cached_bytes(&self) -> usize {
        self.shared.lock().cache.used_bytes()
    }

    pub fn clear_cache(&self) {
        self.shared.lock().cache.clear();
    }

    fn detach_locked(
        &self,
        registry: &mut Registry,
        target: &Arc<dyn ImageTarget>,
        keep: Option<&CacheKey>,
    ) {
        let identity = identity(target);
        let mut abandoned = Vec::new();
        for (key, load) in registry.loads.iter_mut() {
            if Some(key) == keep || !load.has_target(identity) {
                continue;
            }
            load.detach(identity);
            if !load.has_consumers() {
                abandoned.push(key.clone());
            }
        }

        for key in abandoned {
            if let Some(load) = registry.loads.remove(&key) {
                if let Some(task) = load.task {
                    task.abort();
                }
                debug!(url = %key.url, size = ?key.size, "Cancelled image load");
                self.shared
                    .diagnostic
                    .insert(&key.url, key.size, ImageEventKind::Cancelled);
            }
        }
    }

    /// Start the work for `key` unless it is already under way
    fn run(&self, mut registry: MutexGuard<'_, Registry>, key: CacheKey) {
        let (id, started) = match registry.loads.get(&key) {
            Some(load) => (load.id, load.task.is_some()),
            None => return,
        };
        if started {
            return;
        }

        if let Some(image) = registry.cache.get(&key) {
            let load = registry.loads.remove(&key);
            drop(registry);
            if let Some(load) = load {
                self.shared.diagnostic.insert(
                    &key.url,
                    key.size,
                    ImageEventKind::Completed { from_cache: true },
                );
                self.shared.deliver(load, Ok(image));
            }
            return;
        }

        let cached_full = match key.size {
            Some(size) => registry
                .cache
                .get(&CacheKey::full_size(&key.url))
                .map(|full| (full, size)),
            None => None,
        };

        let shared = Arc::clone(&self.shared);
        let task_key = key.clone();
        let task = self.shared.runtime.spawn(async move {
            let (result, from_cache) = match cached_full {
                Some((full, size)) => (shared.resize(&task_key, full, size).await, true),
                None => (shared.fetch(&task_key).await, false),
            };
            shared.finish(&task_key, id, result, from_cache);
        });

        if let Some(load) = registry.loads.get_mut(&key) {
            load.task = Some(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::fetch::tests::png_bytes;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;
    use tokio::runtime::Runtime;
    use tokio::sync::Semaphore;

    const WAIT: Duration = Duration::from_secs(10);

    struct TestFetcher {
        calls: AtomicUsize,
        gate: Semaphore,
        bytes: Vec<u8>,
    }

    impl TestFetcher {
        fn open(bytes: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(1_000),
                bytes,
            })
        }

        fn gated(bytes: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                bytes,
            })
        }

        fn release(&self) {
            self.gate.add_permits(1_000);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for TestFetcher {
        async fn fetch(&self, _url: &Url) -> Result<Vec<u8>, ImageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.map_err(|_| ImageError::Unknown)?;
            Ok(self.bytes.clone())
        }
    }

    struct Harness {
        runtime: Runtime,
        main: SerialQueue,
        loader: ImageLoader,
    }

    fn harness(fetcher: Arc<TestFetcher>, cache_bytes: usize) -> Harness {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let main = SerialQueue::new("images-test-main").unwrap();
        let loader = ImageLoader::new(fetcher, cache_bytes, runtime.handle().clone(), main.clone());
        Harness {
            runtime,
            main,
            loader,
        }
    }

    fn url(name: &str) -> Url {
        Url::parse(&format!("https://img.test/{name}.png")).unwrap()
    }

    /// Load with a callback that forwards the result
    fn load(loader: &ImageLoader, url: &Url, size: Option<ImageSize>, tx: &mpsc::Sender<ImageResult>) {
        let tx = tx.clone();
        loader.load(Some(url), size, move |result| {
            let _ = tx.send(result);
        });
    }

    struct RecordingTarget {
        tx: Mutex<mpsc::Sender<ImageResult>>,
    }

    impl ImageTarget for RecordingTarget {
        fn image_loaded(&self, result: ImageResult) {
            let _ = self.tx.lock().unwrap().send(result);
        }
    }

    #[test]
    fn test_concurrent_requests_share_one_fetch() {
        let fetcher = TestFetcher::gated(png_bytes(16, 16));
        let h = harness(Arc::clone(&fetcher), 1 << 20);
        let (tx, rx) = mpsc::channel();
        let a = url("a");

        for _ in 0..5 {
            load(&h.loader, &a, Some(ImageSize::new(8, 8)), &tx);
        }
        let target: Arc<dyn ImageTarget> = Arc::new(RecordingTarget {
            tx: Mutex::new(tx.clone()),
        });
        h.loader.load_into(Some(&a), Some(ImageSize::new(8, 8)), &target);
        assert_eq!(h.loader.active_loads(), 1);

        fetcher.release();
        let results: Vec<_> = (0..6).map(|_| rx.recv_timeout(WAIT).unwrap().unwrap()).collect();

        assert_eq!(fetcher.calls(), 1);
        assert!(results.iter().all(|image| Arc::ptr_eq(image, &results[0])));
        assert_eq!((results[0].width(), results[0].height()), (8, 8));
        assert_eq!(h.loader.active_loads(), 0);
        assert_eq!(h.loader.image_info().cumulative.requested, 6);
        drop(h.runtime);
    }

    #[test]
    fn test_sized_request_resizes_cached_full_image() {
        let fetcher = TestFetcher::open(png_bytes(40, 20));
        let h = harness(Arc::clone(&fetcher), 1 << 20);
        let (tx, rx) = mpsc::channel();
        let a = url("a");

        load(&h.loader, &a, None, &tx);
        let full = rx.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!((full.width(), full.height()), (40, 20));

        load(&h.loader, &a, Some(ImageSize::new(10, 10)), &tx);
        let sized = rx.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!((sized.width(), sized.height()), (10, 5));

        assert_eq!(fetcher.calls(), 1);
        assert!(h.loader.is_cached(&a, Some(ImageSize::new(10, 10))));

        // Exact hits complete straight from the cache
        load(&h.loader, &a, Some(ImageSize::new(10, 10)), &tx);
        let again = rx.recv_timeout(WAIT).unwrap().unwrap();
        assert!(Arc::ptr_eq(&sized, &again));

        let info = h.loader.image_info();
        assert_eq!(info.cumulative.downloaded, 1);
        assert_eq!(info.cumulative.resized, 1);
        assert_eq!(info.cumulative.cache_hits, 2);
        drop(h.runtime);
    }

    #[test]
    fn test_retargeting_cancels_abandoned_load() {
        let fetcher = TestFetcher::gated(png_bytes(4, 4));
        let h = harness(Arc::clone(&fetcher), 1 << 20);
        let (tx, rx) = mpsc::channel();
        let target: Arc<dyn ImageTarget> = Arc::new(RecordingTarget { tx: Mutex::new(tx) });

        h.loader.load_into(Some(&url("first")), None, &target);
        h.loader.load_into(Some(&url("second")), None, &target);

        let info = h.loader.image_info();
        assert_eq!(info.cumulative.cancelled, 1);
        assert_eq!(info.per_image[&url("first")].cancelled, 1);
        assert_eq!(h.loader.active_loads(), 1);

        fetcher.release();
        assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert!(!h.loader.is_cached(&url("first"), None));
        drop(h.runtime);
    }

    #[test]
    fn test_shared_load_survives_one_target_leaving() {
        let fetcher = TestFetcher::gated(png_bytes(4, 4));
        let h = harness(Arc::clone(&fetcher), 1 << 20);
        let (tx, rx) = mpsc::channel();
        let a = url("a");

        load(&h.loader, &a, None, &tx);
        let (other_tx, _other_rx) = mpsc::channel();
        let target: Arc<dyn ImageTarget> = Arc::new(RecordingTarget {
            tx: Mutex::new(other_tx),
        });
        h.loader.load_into(Some(&a), None, &target);
        h.loader.detach(&target);

        assert_eq!(h.loader.image_info().cumulative.cancelled, 0);
        fetcher.release();
        assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
        drop(h.runtime);
    }

    #[test]
    fn test_missing_url_fails_on_main_queue() {
        let fetcher = TestFetcher::open(Vec::new());
        let h = harness(fetcher, 1 << 20);
        let (tx, rx) = mpsc::channel();

        let main = h.main.clone();
        h.loader.load(None, None, move |result| {
            let _ = tx.send((main.is_current(), result));
        });

        let (on_main, result) = rx.recv_timeout(WAIT).unwrap();
        assert!(on_main);
        assert!(matches!(result, Err(ImageError::ImageNotFound)));
    }

    #[test]
    fn test_results_delivered_on_main_queue() {
        let fetcher = TestFetcher::open(png_bytes(2, 2));
        let h = harness(fetcher, 1 << 20);
        let (tx, rx) = mpsc::channel();

        let main = h.main.clone();
        h.loader.load(Some(&url("a")), None, move |result| {
            let _ = tx.send((main.is_current(), result.is_ok()));
        });

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (true, true));
        drop(h.runtime);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let fetcher = TestFetcher::open(b"garbage".to_vec());
        let h = harness(Arc::clone(&fetcher), 1 << 20);
        let (tx, rx) = mpsc::channel();
        let a = url("a");

        load(&h.loader, &a, None, &tx);
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Err(ImageError::ImageMalformed)));

        load(&h.loader, &a, None, &tx);
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Err(ImageError::ImageMalformed)));

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(h.loader.image_info().cumulative.failed, 2);
        drop(h.runtime);
    }

    #[test]
    fn test_cache_evicts_under_pressure() {
        // Each decoded 8x8 RGBA image costs 256 bytes
        let fetcher = TestFetcher::open(png_bytes(8, 8));
        let h = harness(Arc::clone(&fetcher), 300);
        let (tx, rx) = mpsc::channel();

        load(&h.loader, &url("a"), None, &tx);
        rx.recv_timeout(WAIT).unwrap().unwrap();
        load(&h.loader, &url("b"), None, &tx);
        rx.recv_timeout(WAIT).unwrap().unwrap();

        assert!(!h.loader.is_cached(&url("a"), None));
        assert!(h.loader.is_cached(&url("b"), None));
        assert!(h.loader.cached_bytes() <= 300);

        // Evicted images are fetched again
        load(&h.loader, &url("a"), None, &tx);
        rx.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(fetcher.calls(), 3);
        drop(h.runtime);
    }
}
