//! Kit facade
//!
//! The one object collaborators talk to. It owns the entry store, the
//! state manager and the image loader.
//!
//! ## Flow of a mutation
//!
//! 1. Store I/O runs synchronously on the calling thread
//! 2. The state mutation is enqueued on the serial `commits` queue
//! 3. The resulting snapshot is republished on the `main` queue, where
//!    subscribers and the watch channel see it
//!
//! ## Usage
//!
//! ```ignore
//! let kit = Kit::open(Config::load()?)?;
//! let entry = kit.entry_create("buy milk", None)?;
//! kit.entry_search(Some("milk"))?;
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Url;
use thiserror::Error;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::SerialQueue;
use crate::images::{HttpFetcher, ImageError, ImageLoader, ImageResult, ImageSize};
use crate::messages::{Level, Message, Messages};
use crate::models::{image_token, Entry, EntryRecord, IMAGE_EXTENSIONS};
use crate::snapshot::Snapshot;
use crate::state::{OverlayToken, State, StateManager, Subscription};
use crate::storage::{EntryStore, StoreError, StoreResult};
use crate::sync::{
    DocumentError, DocumentEvent, DocumentLifecycle, DocumentProvider, LocalContainerProvider,
    Stage,
};

#[derive(Error, Debug)]
pub enum KitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Cloud storage is unavailable")]
    CloudUnavailable,

    #[error("The entry store is not ready yet")]
    NotReady,

    #[error("Nothing to undo")]
    NothingToUndo,

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("Work queue has stopped")]
    QueueStopped,

    #[error("'{0}' is already the open database")]
    SameDatabase(PathBuf),
}

impl KitError {
    /// Whether the user can fix the failure and retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            KitError::Store(e) => e.is_recoverable(),
            KitError::CloudUnavailable | KitError::NotReady => true,
            _ => false,
        }
    }

    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            KitError::Store(e) => e.recovery_suggestion(),
            KitError::CloudUnavailable => {
                Some("Check that cloud storage is signed in, then reopen the document.")
            }
            KitError::NotReady => Some("Wait for the document to finish opening and try again."),
            KitError::SameDatabase(_) => Some("Choose a database file from another location."),
            _ => None,
        }
    }
}

pub type KitResult<T> = Result<T, KitError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Move a file, falling back to copy and remove across file systems
fn move_file(from: &Path, to: &Path) -> StoreResult<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::from_io(e, parent.to_path_buf()))?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| StoreError::from_io(e, to.to_path_buf()))?;
    fs::remove_file(from).map_err(|e| StoreError::from_io(e, from.to_path_buf()))
}

/// Delete staged photos no undo entry points at
fn prune_staging(dir: &Path, keep: &[PathBuf]) -> usize {
    let Ok(files) = fs::read_dir(dir) else {
        return 0;
    };
    let keep: Vec<_> = keep.iter().filter_map(|p| p.file_name()).collect();

    let mut removed = 0;
    for path in files.filter_map(|f| f.ok()).map(|f| f.path()) {
        let kept = path.file_name().is_some_and(|name| keep.contains(&name));
        if !kept && path.is_file() && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

/// Republishes state manager broadcasts on the main queue
struct Relay {
    main: SerialQueue,
    subscribers: Arc<Mutex<Subscription<Arc<State>>>>,
    published: Arc<watch::Sender<Arc<State>>>,
}

impl Relay {
    fn forward(&self, state: &Arc<State>) {
        let state = Arc::clone(state);
        let subscribers = Arc::clone(&self.subscribers);
        let published = Arc::clone(&self.published);
        self.main.dispatch(move || {
            published.send_replace(Arc::clone(&state));
            let delivery = lock(&subscribers).delivery();
            delivery.send(&state);
        });
    }
}

struct Shared {
    config: Config,
    store: Mutex<Option<EntryStore>>,
    /// Present only when the database lives in a cloud document
    lifecycle: Mutex<Option<DocumentLifecycle>>,
    provider: Option<Arc<dyn DocumentProvider>>,
    manager: Arc<Mutex<StateManager<State>>>,
    relay: Arc<Relay>,
    commits: SerialQueue,
    main: SerialQueue,
    messages: Arc<Mutex<Messages>>,
    images: ImageLoader,
    runtime: Handle,
}

impl Shared {
    fn commit(&self, mutation: impl FnOnce(&mut State) + Send + 'static) {
        let manager = Arc::clone(&self.manager);
        self.commits.dispatch(move || lock(&manager).commit(mutation));
    }

    fn post(&self, message: Message) {
        let messages = Arc::clone(&self.messages);
        self.main.ensure(move || {
            let pending = lock(&messages).push(message);
            if let Some((delivery, unread)) = pending {
                delivery.send(&unread);
            }
        });
    }

    /// Log and post a failed operation before handing the result back
    fn report<T>(&self, operation: &str, result: KitResult<T>) -> KitResult<T> {
        if let Err(e) = &result {
            warn!(operation, error = %e, "Kit operation failed");
            let mut message = Message::error(e);
            if e.is_recoverable() {
                message.level = Level::Warning;
            }
            if let Some(suggestion) = e.recovery_suggestion() {
                message = message.with_suggestion(suggestion);
            }
            self.post(message);
        }
        result
    }

    fn with_store<R>(&self, f: impl FnOnce(&EntryStore) -> StoreResult<R>) -> KitResult<R> {
        if let Some(lifecycle) = lock(&self.lifecycle).as_ref() {
            if !lifecycle.cloud_enabled() {
                return Err(KitError::CloudUnavailable);
            }
            if !lifecycle.is_ready() {
                return Err(KitError::NotReady);
            }
        }
        let store = lock(&self.store);
        let store = store.as_ref().ok_or(KitError::NotReady)?;
        Ok(f(store)?)
    }

    /// Run store I/O and enqueue the state change it implies before the
    /// store is released, so commits follow the order of the writes
    fn with_store_commit<R, M>(
        &self,
        f: impl FnOnce(&EntryStore) -> StoreResult<(R, M)>,
    ) -> KitResult<R>
    where
        M: FnOnce(&mut State) + Send + 'static,
    {
        self.with_store(|store| {
            let (result, mutation) = f(store)?;
            self.commit(mutation);
            Ok(result)
        })
    }

    /// Reload every entry and rerun the active search
    fn activate(&self) -> KitResult<()> {
        let query = lock(&self.manager)
            .committed()
            .search
            .query
            .clone()
            .filter(|q| !q.trim().is_empty());

        let photos_dir = self.config.photos_dir();
        let count = self.with_store_commit(|store| {
            let entries: Vec<Entry> = store
                .entries()?
                .entries
                .iter()
                .map(|record| Entry::from_record(record, &photos_dir))
                .collect();
            let results = match query.as_deref() {
                Some(q) => Some(store.search(q)?),
                None => None,
            };
            let count = entries.len();

            Ok((count, move |state: &mut State| {
                state.hydrate(entries);
                // A search committed since the query was read keeps its own results
                if let Some(results) = results {
                    if state.search.query == query {
                        state.search.results = results;
                    }
                }
            }))
        })?;
        info!(entries = count, "Activated");
        Ok(())
    }

    fn handle_document_event(&self, event: DocumentEvent) {
        let (transition, cloud_enabled, schema_ready) = {
            let mut guard = lock(&self.lifecycle);
            let Some(lifecycle) = guard.as_mut() else {
                debug!(?event, "Ignoring document event for local store");
                return;
            };
            let transition = lifecycle.apply(&event);
            (
                transition,
                lifecycle.cloud_enabled(),
                lifecycle.readiness().schema_ready(),
            )
        };

        let stage = transition.to;
        self.commit(move |state| {
            state.stage = stage;
            state.cloud_enabled = cloud_enabled;
        });

        match &event {
            DocumentEvent::Opened if cloud_enabled && !schema_ready => self.prepare_schema(),
            DocumentEvent::Closed => {
                lock(&self.store).take();
            }
            DocumentEvent::Unavailable => {
                lock(&self.store).take();
                self.post(Message::warning("Cloud storage is unavailable"));
            }
            DocumentEvent::SavingError(message) => {
                self.post(Message::warning(format!("Document failed to save: {message}")));
            }
            DocumentEvent::InConflict => {
                self.post(Message::warning("Document has conflicting versions"));
            }
            _ => {}
        }

        if transition.became_ready() {
            if let Err(e) = self.activate() {
                warn!(error = %e, "Activate after document open failed");
            }
        }
    }

    /// Open the database inside the document, running migrations
    fn prepare_schema(&self) {
        let Some(path) = self.config.cloud_database_path() else {
            return;
        };
        match EntryStore::open(&path) {
            Ok(store) => {
                *lock(&self.store) = Some(store);
                self.handle_document_event(DocumentEvent::SchemaReady);
            }
            Err(e) => {
                warn!(error = %e, "Schema setup failed");
                self.post(Message::error(&e));
            }
        }
    }

    /// Ask the provider to open the document and follow its events.
    ///
    /// Events emitted during `open` are handled before returning; later
    /// ones are handled as they arrive.
    fn start_document(self: &Arc<Self>) -> KitResult<()> {
        let Some(provider) = self.provider.clone() else {
            self.handle_document_event(DocumentEvent::Unavailable);
            return Err(KitError::CloudUnavailable);
        };
        let Some(path) = self.config.cloud_database_path() else {
            self.handle_document_event(DocumentEvent::Unavailable);
            return Err(KitError::CloudUnavailable);
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let opened = provider.open(&path, &tx);
        drop(tx);
        while let Ok(event) = rx.try_recv() {
            self.handle_document_event(event);
        }

        let shared = Arc::downgrade(self);
        self.runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                match shared.upgrade() {
                    Some(shared) => shared.handle_document_event(event),
                    None => break,
                }
            }
        });

        Ok(opened?)
    }
}

/// Process-wide coordinator of store, state and images
pub struct Kit {
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
}

impl Kit {
    /// Open the kit described by `config`.
    ///
    /// With cloud sync enabled, the database is opened once the container
    /// document is ready; otherwise the local database opens immediately.
    /// The initial activate is best-effort.
    pub fn open(config: Config) -> Result<Self> {
        let provider = match (&config.cloud_enabled, &config.cloud_container) {
            (true, Some(container)) => {
                Some(Arc::new(LocalContainerProvider::new(container)) as Arc<dyn DocumentProvider>)
            }
            _ => None,
        };
        Self::build(config, provider)
    }

    /// Open with cloud sync through a custom document provider
    pub fn open_with_provider(mut config: Config, provider: Arc<dyn DocumentProvider>) -> Result<Self> {
        config.cloud_enabled = true;
        Self::build(config, Some(provider))
    }

    fn build(config: Config, provider: Option<Arc<dyn DocumentProvider>>) -> Result<Self> {
        config.ensure_dirs().context("Failed to prepare directories")?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("logger-worker")
            .build()
            .context("Failed to start async runtime")?;
        let commits = SerialQueue::new("logger-commits")?;
        let main = SerialQueue::new("logger-main")?;

        let fetcher = HttpFetcher::new(Duration::from_secs(config.image_fetch_timeout_secs))
            .context("Failed to build image fetcher")?;
        let images = ImageLoader::new(
            Arc::new(fetcher),
            config.image_cache_bytes,
            runtime.handle().clone(),
            main.clone(),
        );

        let mut initial = State {
            cloud_enabled: config.cloud_enabled,
            ..State::default()
        };
        let staged = match Snapshot::take(&config.snapshot_path()) {
            Ok(Some(snapshot)) => {
                let staged = snapshot.staged_photos();
                snapshot.restore_into(&mut initial);
                staged
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable snapshot");
                Vec::new()
            }
        };
        let pruned = prune_staging(&config.photos_cache_dir(), &staged);
        if pruned > 0 {
            info!(pruned, "Removed orphaned staged photos");
        }

        let (published, _) = watch::channel(Arc::new(initial.clone()));
        let relay = Arc::new(Relay {
            main: main.clone(),
            subscribers: Arc::new(Mutex::new(Subscription::new())),
            published: Arc::new(published),
        });
        let mut manager = StateManager::new(initial);
        manager.subscribe(&relay, Relay::forward);

        let cloud_enabled = config.cloud_enabled;
        let store = if cloud_enabled {
            None
        } else {
            Some(EntryStore::open(&config.database_path()).context("Failed to open entry database")?)
        };

        let shared = Arc::new(Shared {
            config,
            store: Mutex::new(store),
            lifecycle: Mutex::new(cloud_enabled.then(DocumentLifecycle::new)),
            provider,
            manager: Arc::new(Mutex::new(manager)),
            relay,
            commits,
            main,
            messages: Arc::new(Mutex::new(Messages::new())),
            images,
            runtime: runtime.handle().clone(),
        });

        let kit = Self {
            shared,
            runtime: Some(runtime),
        };

        if cloud_enabled {
            if let Err(e) = kit.shared.start_document() {
                warn!(error = %e, "Cloud document did not open");
            }
        } else if let Err(e) = kit.shared.activate() {
            warn!(error = %e, "Initial activate failed");
        }

        Ok(kit)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn images(&self) -> &ImageLoader {
        &self.shared.images
    }

    /// Load an image through the shared loader; failures other than a
    /// missing image are also posted as messages
    pub fn load_image(
        &self,
        url: Option<&Url>,
        size: Option<ImageSize>,
        then: impl FnOnce(ImageResult) + Send + 'static,
    ) {
        let messages = Arc::clone(&self.shared.messages);
        self.shared.images.load(url, size, move |result| {
            if let Err(e) = &result {
                if !matches!(e, ImageError::ImageNotFound) {
                    lock(&messages).insert(Message::error(e));
                }
            }
            then(result);
        });
    }

    // ==================== State ====================

    /// Latest composed state, including overlays
    pub fn state(&self) -> Arc<State> {
        lock(&self.shared.manager).state()
    }

    /// Current document stage; always `None` for a local store
    pub fn stage(&self) -> Stage {
        lock(&self.shared.lifecycle)
            .as_ref()
            .map(|l| l.stage())
            .unwrap_or_default()
    }

    /// Receiver that always holds the latest snapshot published on main
    pub fn watch(&self) -> watch::Receiver<Arc<State>> {
        self.shared.relay.published.subscribe()
    }

    /// Subscribe `target` to state changes.
    ///
    /// Returns the latest published snapshot. `action` also receives it
    /// right away on the main queue, then every later snapshot. An action
    /// may unsubscribe its own target.
    pub fn subscribe<T, F>(&self, target: &Arc<T>, action: F) -> Arc<State>
    where
        T: Send + Sync + 'static,
        F: Fn(&T, &Arc<State>) + Send + Sync + 'static,
    {
        let current = self.shared.relay.published.borrow().clone();
        let subscribers = Arc::clone(&self.shared.relay.subscribers);
        let published = Arc::clone(&self.shared.relay.published);
        let target = Arc::clone(target);

        self.shared.main.ensure(move || {
            let action = Arc::new(action);
            let forward = Arc::clone(&action);
            let added = lock(&subscribers)
                .subscribe(&target, move |t: &T, state: &Arc<State>| (*forward)(t, state));
            if added {
                let latest = published.borrow().clone();
                (*action)(target.as_ref(), &latest);
            }
        });
        current
    }

    pub fn unsubscribe<T>(&self, target: &Arc<T>) -> bool {
        lock(&self.shared.relay.subscribers).unsubscribe(target)
    }

    /// Subscribe to user-facing messages; pending ones are delivered first
    pub fn subscribe_messages<T, F>(&self, target: &Arc<T>, action: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&T, &Vec<Message>) + Send + Sync + 'static,
    {
        let messages = Arc::clone(&self.shared.messages);
        let target = Arc::clone(target);
        self.shared.main.ensure(move || {
            lock(&messages).subscribe(&target, action);
        });
    }

    pub fn unsubscribe_messages<T>(&self, target: &Arc<T>) -> bool {
        lock(&self.shared.messages).unsubscribe(target)
    }

    pub fn post_message(&self, message: Message) {
        self.shared.post(message);
    }

    /// Layer a speculative mutation over the committed state
    pub fn overlay(
        &self,
        mutation: impl Fn(&mut State) + Send + Sync + 'static,
    ) -> KitResult<OverlayToken> {
        let manager = Arc::clone(&self.shared.manager);
        self.shared
            .commits
            .sync(move || lock(&manager).overlay(mutation))
            .ok_or(KitError::QueueStopped)
    }

    pub fn remove_overlay(&self, token: OverlayToken) -> KitResult<bool> {
        let manager = Arc::clone(&self.shared.manager);
        self.shared
            .commits
            .sync(move || lock(&manager).remove(token))
            .ok_or(KitError::QueueStopped)
    }

    /// Block until queued commits and their main-queue broadcasts have run
    pub fn settle(&self) {
        self.shared.commits.sync(|| ());
        self.shared.main.sync(|| ());
    }

    // ==================== Lifecycle ====================

    /// Reload all entries from the store
    pub fn activate(&self) -> KitResult<()> {
        self.shared.report("activate", self.shared.activate())
    }

    /// Save what a relaunch cannot rebuild from the database.
    ///
    /// The snapshot is consumed by the next open, so only the state at the
    /// last suspend survives a relaunch.
    pub fn suspend(&self) -> Result<()> {
        let snapshot = Snapshot::capture(lock(&self.shared.manager).committed());
        snapshot.save(&self.shared.config.snapshot_path())
    }

    /// Feed a signal from the document layer
    pub fn handle_document_event(&self, event: DocumentEvent) {
        self.shared.handle_document_event(event);
    }

    /// Retry opening the cloud document after it became unavailable
    pub fn reopen_document(&self) -> KitResult<()> {
        match lock(&self.shared.lifecycle).as_mut() {
            Some(lifecycle) => lifecycle.reenable(),
            None => return Err(KitError::CloudUnavailable),
        }
        self.shared.start_document()
    }

    pub fn close_document(&self) -> KitResult<()> {
        let (Some(provider), Some(path)) = (
            self.shared.provider.clone(),
            self.shared.config.cloud_database_path(),
        ) else {
            return Err(KitError::CloudUnavailable);
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let closed = provider.close(&path, &tx);
        drop(tx);
        while let Ok(event) = rx.try_recv() {
            self.shared.handle_document_event(event);
        }
        Ok(closed?)
    }

    /// Overwrite the database with the file at `source`, then reload.
    ///
    /// The file is copied verbatim; a foreign schema only surfaces as
    /// later query failures.
    pub fn replace_database(&self, source: &Path) -> KitResult<()> {
        let result = self.swap_database(source);
        self.shared.report("replace database", result)
    }

    fn swap_database(&self, source: &Path) -> KitResult<()> {
        let target = match lock(&self.shared.lifecycle).as_ref() {
            Some(lifecycle) if !lifecycle.cloud_enabled() => return Err(KitError::CloudUnavailable),
            Some(lifecycle) if !lifecycle.is_ready() => return Err(KitError::NotReady),
            Some(_) => self
                .shared
                .config
                .cloud_database_path()
                .ok_or(KitError::CloudUnavailable)?,
            None => self.shared.config.database_path(),
        };

        // Copying a file onto itself truncates it
        let source_path = fs::canonicalize(source)
            .map_err(|e| StoreError::from_io(e, source.to_path_buf()))?;
        if fs::canonicalize(&target).is_ok_and(|t| t == source_path) {
            return Err(KitError::SameDatabase(source.to_path_buf()));
        }

        {
            let mut store = lock(&self.shared.store);
            // Close the connection before touching the file
            store.take();
            let copied = fs::copy(source, &target)
                .map_err(|e| StoreError::from_io(e, source.to_path_buf()));
            *store = Some(EntryStore::open(&target)?);
            copied?;
        }

        info!(source = %source.display(), "Replaced database");
        self.shared.activate()
    }

    // ==================== Entries ====================

    pub fn entry_create(&self, text: &str, color: Option<i64>) -> KitResult<Entry> {
        let result = self.create_entry(text, color);
        self.shared.report("create entry", result)
    }

    fn create_entry(&self, text: &str, color: Option<i64>) -> KitResult<Entry> {
        let record = EntryRecord::new(text).with_color(color.unwrap_or(0));
        let photos_dir = self.shared.config.photos_dir();
        let entry = self.shared.with_store_commit(|store| {
            let entry = Entry::from_record(&store.insert(&record)?, &photos_dir);
            let committed = entry.clone();
            Ok((entry, move |state: &mut State| state.insert_entry(committed)))
        })?;
        info!(id = entry.id, "Created entry");
        Ok(entry)
    }

    /// Store `bytes` as a photo and create an entry showing it
    pub fn entry_create_image(&self, bytes: &[u8], extension: &str) -> KitResult<Entry> {
        let result = self.create_image_entry(bytes, extension);
        self.shared.report("create image entry", result)
    }

    fn create_image_entry(&self, bytes: &[u8], extension: &str) -> KitResult<Entry> {
        let extension = extension.trim_start_matches('.').to_ascii_lowercase();
        if !IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            return Err(ImageError::RequestBad(format!("Unsupported image type '{extension}'")).into());
        }

        let photos_dir = self.shared.config.photos_dir();
        fs::create_dir_all(&photos_dir).map_err(|e| StoreError::from_io(e, photos_dir.clone()))?;

        let mut stamp = Utc::now().timestamp_millis();
        let (filename, path) = loop {
            let filename = format!("{stamp}.{extension}");
            let path = photos_dir.join(&filename);
            if !path.exists() {
                break (filename, path);
            }
            stamp += 1;
        };
        fs::write(&path, bytes).map_err(|e| StoreError::from_io(e, path.clone()))?;

        match self.create_entry(&image_token(&filename), None) {
            Ok(entry) => Ok(entry),
            Err(e) => {
                let _ = fs::remove_file(&path);
                Err(e)
            }
        }
    }

    pub fn entry_set_text(&self, id: i64, text: &str) -> KitResult<Entry> {
        let result = self.modify_entry(id, |record| record.set_text(text));
        self.shared.report("set entry text", result)
    }

    pub fn entry_set_color(&self, id: i64, color: i64) -> KitResult<Entry> {
        let result = self.modify_entry(id, |record| record.set_color(color));
        self.shared.report("set entry color", result)
    }

    fn modify_entry(&self, id: i64, change: impl FnOnce(&mut EntryRecord)) -> KitResult<Entry> {
        let photos_dir = self.shared.config.photos_dir();
        let entry = self.shared.with_store_commit(|store| {
            let mut record = store.entry(id)?;
            change(&mut record);
            let entry = Entry::from_record(&store.update(&record, id)?, &photos_dir);
            let committed = entry.clone();
            Ok((entry, move |state: &mut State| {
                state.update_entry(committed);
            }))
        })?;
        debug!(id, "Updated entry");
        Ok(entry)
    }

    /// Soft-delete an entry: its photo is staged and the entry pushed on
    /// the undo stack, then the row is removed
    pub fn entry_delete(&self, id: i64) -> KitResult<()> {
        let result = self.delete_entry(id);
        self.shared.report("delete entry", result)
    }

    fn delete_entry(&self, id: i64) -> KitResult<()> {
        let config = &self.shared.config;
        let record = self.shared.with_store(|store| store.entry(id))?;
        let mut staged = Entry::from_record(&record, &config.photos_dir());

        let original_photo = staged.image.clone();
        if let Some(photo) = original_photo.as_ref().filter(|p| p.exists()) {
            if let Some(name) = photo.file_name() {
                let staging = config.photos_cache_dir().join(name);
                move_file(photo, &staging)?;
                staged.image = Some(staging);
            }
        }

        let staged_photo = staged.image.clone();
        let capacity = config.undo_capacity;
        let staging_dir = config.photos_cache_dir();
        let manager = Arc::clone(&self.shared.manager);

        let deleted = self.shared.with_store(|store| {
            store.delete(id)?;
            self.shared.commits.dispatch(move || {
                let mut dropped = Vec::new();
                lock(&manager).commit(|state| {
                    state.remove_entry(id);
                    dropped = state.push_undo(staged, capacity);
                });
                for photo in dropped.into_iter().filter_map(|e| e.image) {
                    if photo.starts_with(&staging_dir) {
                        let _ = fs::remove_file(&photo);
                    }
                }
            });
            Ok(())
        });

        if let Err(e) = deleted {
            if let (Some(original), Some(staging)) = (&original_photo, &staged_photo) {
                if original != staging {
                    let _ = move_file(staging, original);
                }
            }
            return Err(e);
        }
        info!(id, "Deleted entry");
        Ok(())
    }

    /// Restore the most recently deleted entry. It comes back with a new id.
    pub fn undo_entry_delete(&self) -> KitResult<Entry> {
        let result = self.undo_delete();
        self.shared.report("undo delete", result)
    }

    fn undo_delete(&self) -> KitResult<Entry> {
        let manager = Arc::clone(&self.shared.manager);
        let popped = self
            .shared
            .commits
            .sync(move || {
                let mut popped = None;
                let _ = lock(&manager).try_commit(|state| match state.pop_undo() {
                    Some(entry) => {
                        popped = Some(entry);
                        Ok(())
                    }
                    None => Err(()),
                });
                popped
            })
            .ok_or(KitError::QueueStopped)?;
        let entry = popped.ok_or(KitError::NothingToUndo)?;

        match self.restore_entry(&entry) {
            Ok(restored) => Ok(restored),
            Err(e) => {
                let capacity = self.shared.config.undo_capacity;
                self.shared.commit(move |state| {
                    state.push_undo(entry, capacity);
                });
                Err(e)
            }
        }
    }

    /// Re-insert a deleted entry and move its photo back
    pub fn entry_restore(&self, entry: &Entry) -> KitResult<Entry> {
        let result = self.restore_entry(entry);
        self.shared.report("restore entry", result)
    }

    fn restore_entry(&self, entry: &Entry) -> KitResult<Entry> {
        let photos_dir = self.shared.config.photos_dir();

        let mut moved: Option<(PathBuf, PathBuf)> = None;
        if let Some(staged) = entry.image.as_ref().filter(|p| p.exists()) {
            if let Some(name) = staged.file_name() {
                let home = photos_dir.join(name);
                if *staged != home {
                    move_file(staged, &home)?;
                    moved = Some((home, staged.clone()));
                }
            }
        }

        let restored = self.shared.with_store_commit(|store| {
            let restored = Entry::from_record(&store.restore(&entry.to_record())?, &photos_dir);
            let committed = restored.clone();
            Ok((restored, move |state: &mut State| state.insert_entry(committed)))
        });
        let restored = match restored {
            Ok(restored) => restored,
            Err(e) => {
                if let Some((home, staged)) = moved {
                    let _ = move_file(&home, &staged);
                }
                return Err(e);
            }
        };
        info!(old_id = entry.id, new_id = restored.id, "Restored entry");
        Ok(restored)
    }

    /// Run a search and publish its results; a missing or blank query
    /// clears the filter
    pub fn entry_search(&self, query: Option<&str>) -> KitResult<Vec<i64>> {
        let result = self.search(query);
        self.shared.report("search", result)
    }

    fn search(&self, query: Option<&str>) -> KitResult<Vec<i64>> {
        let query = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string);
        let Some(q) = query else {
            self.shared.commit(|state| state.set_search(None, Vec::new()));
            return Ok(Vec::new());
        };
        self.shared.with_store_commit(|store| {
            let results = store.search(&q)?;
            let committed = results.clone();
            Ok((results, move |state: &mut State| {
                state.set_search(Some(q), committed)
            }))
        })
    }
}

impl Drop for Kit {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
