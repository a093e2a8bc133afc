//! Sync orchestrator.
//!
//! Wires watcher events to the upload pipeline, runs full scans and two-way
//! reconciliation, owns the global state machine and exposes the lifecycle
//! and folder-management operations to the hosting process.
//!
//! The folder table, cumulative statistics and the global state live behind
//! one reader/writer lock. Runtime settings are read through a versioned
//! snapshot, and folder changes leave through the persistence port before
//! the table is touched.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{
    AgentConfig, ConfigPersistence, FolderConfig, PersistIntent, SettingsHandle, SettingsSnapshot,
};
use crate::error::{Result, SyncError};
use crate::fs::backend::StorageBackend;
use crate::fs::types::{meta_keys, object_key, ObjectMetadata, RemoteFileInfo};
use crate::sync::exclude::{relative_key, walk_pruned, PathMatcher};
use crate::sync::registry::{FolderDefinition, FolderRegistry, FolderState, FolderStats, FolderStatus};
use crate::sync::uploader::{PipelineConfig, UploadPipeline, UploadResult, UploadTask};
use crate::sync::watcher::{ChangeEvent, ChangeKind, ChangeWatcher};

/// Suffix of the staging file a download is written to before it is renamed into place.
pub const PART_SUFFIX: &str = ".cloudsync-part";

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(50);

/// Global state of the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Scanning,
    Syncing,
    Paused,
    Error,
}

/// A state transition, as delivered to status handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum StatusChange {
    Global { state: SyncState },
    Folder { folder_id: String, status: FolderStatus },
}

/// Callback for status transitions. Invoked outside internal locks, in
/// registration order.
pub type StatusHandler = Arc<dyn Fn(&StatusChange) + Send + Sync>;

/// Point-in-time status for the hosting process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub state: SyncState,
    pub uptime_secs: u64,
    pub files_uploaded: u64,
    pub bytes_uploaded: u64,
    pub files_downloaded: u64,
    pub bytes_downloaded: u64,
    pub errors: u64,
    pub enabled_folders: usize,
    pub folders_count: usize,
    pub queued_uploads: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub settings_version: u64,
    pub version: &'static str,
}

/// Summary of one full sync or `sync_now` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub folders: usize,
    pub failed_folders: usize,
    /// Upload tasks accepted by the pipeline.
    pub queued: usize,
    pub downloaded: usize,
    pub errors: u64,
}

/// What one folder worker did.
#[derive(Debug, Default)]
struct FolderOutcome {
    queued: usize,
    downloaded: usize,
    errors: u64,
}

struct Table {
    registry: FolderRegistry,
    totals: FolderStats,
    state: SyncState,
    last_sync_at: Option<DateTime<Utc>>,
}

struct Inner {
    settings: SettingsHandle,
    table: RwLock<Table>,
    watcher: Arc<dyn ChangeWatcher>,
    pipeline: UploadPipeline,
    backend: Arc<dyn StorageBackend>,
    persistence: Arc<dyn ConfigPersistence>,
    cancel: CancellationToken,
    background: TaskTracker,
    results_task: Mutex<Option<JoinHandle<()>>>,
    sync_lock: tokio::sync::Mutex<()>,
    running: AtomicBool,
    stopped: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    /// Files written by reconciliation, with the mtime they were given.
    downloaded: Mutex<HashMap<PathBuf, SystemTime>>,
    status_handlers: RwLock<Vec<StatusHandler>>,
}

/// The sync engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_part_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(PART_SUFFIX))
        .unwrap_or(false)
}

fn part_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dest.with_file_name(format!("{}{}", name, PART_SUFFIX))
}

/// Give a folder coming from a caller a generated id if it has none.
fn normalize_folder(mut config: FolderConfig) -> FolderConfig {
    if config.id.trim().is_empty() {
        config.id = uuid::Uuid::new_v4().to_string();
    }
    config
}

/// Local key for a remote object: the key without its namespace prefix.
fn strip_namespace<'a>(key: &'a str, namespace: &str) -> Option<&'a str> {
    let namespace = namespace.trim_matches('/');
    let rel = if namespace.is_empty() {
        key
    } else {
        key.strip_prefix(namespace)?.strip_prefix('/')?
    };
    let rel = rel.trim_start_matches('/');
    (!rel.is_empty()).then_some(rel)
}

/// Path under `root` for a folder-relative key. `None` when a segment is
/// empty, `.`, `..` or anything else that is not a plain name.
fn local_target(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for part in relative.split('/') {
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => path.push(name),
            _ => return None,
        }
    }
    path.starts_with(root).then_some(path)
}

/// Every visible file under `root`, skipping excluded subtrees.
fn scan_local(root: &Path, matcher: &PathMatcher) -> (Vec<(PathBuf, String)>, u64) {
    let mut files = Vec::new();
    let mut errors = 0;

    for entry in walk_pruned(root, root, matcher, false) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                let path = entry.path();
                if is_part_file(&path) {
                    continue;
                }
                let key = match path.strip_prefix(root) {
                    Ok(rel) => relative_key(rel),
                    Err(_) => continue,
                };
                files.push((path, key));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Failed to read directory during scan");
                errors += 1;
            }
        }
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    (files, errors)
}

/// Register a folder from configuration, logging what was skipped or disabled.
fn admit_configured(
    registry: &mut FolderRegistry,
    definition: FolderDefinition,
) -> Option<FolderDefinition> {
    let wanted = definition.enabled;
    let id = definition.id.clone();
    match registry.admit(definition) {
        Ok(admitted) => {
            if wanted && !admitted.enabled {
                warn!(
                    folder = %id,
                    path = %admitted.local_path.display(),
                    "Folder root is unusable, registering it disabled"
                );
            }
            Some(admitted)
        }
        Err(e) => {
            warn!(folder = %id, error = %e, "Skipping configured folder");
            None
        }
    }
}

impl SyncOrchestrator {
    /// Build an orchestrator for `config` with the pipeline sized from `config.sync`.
    pub fn new(
        config: &AgentConfig,
        backend: Arc<dyn StorageBackend>,
        watcher: Arc<dyn ChangeWatcher>,
        persistence: Arc<dyn ConfigPersistence>,
    ) -> Self {
        let pipeline = PipelineConfig::from(&config.sync);
        Self::with_pipeline_config(config, backend, watcher, persistence, pipeline)
    }

    pub fn with_pipeline_config(
        config: &AgentConfig,
        backend: Arc<dyn StorageBackend>,
        watcher: Arc<dyn ChangeWatcher>,
        persistence: Arc<dyn ConfigPersistence>,
        pipeline: PipelineConfig,
    ) -> Self {
        let mut registry = FolderRegistry::new();
        for folder in &config.folders {
            let definition = FolderDefinition::from(&normalize_folder(folder.clone()));
            admit_configured(&mut registry, definition);
        }

        let inner = Inner {
            settings: SettingsHandle::new(config.sync.clone()),
            table: RwLock::new(Table {
                registry,
                totals: FolderStats::default(),
                state: SyncState::Idle,
                last_sync_at: None,
            }),
            watcher,
            pipeline: UploadPipeline::new(backend.clone(), pipeline),
            backend,
            persistence,
            cancel: CancellationToken::new(),
            background: TaskTracker::new(),
            results_task: Mutex::new(None),
            sync_lock: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            started_at: Mutex::new(None),
            downloaded: Mutex::new(HashMap::new()),
            status_handlers: RwLock::new(Vec::new()),
        };
        let inner = Arc::new(inner);

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner.watcher.add_handler(Arc::new(move |event: &ChangeEvent| {
            if let Some(inner) = weak.upgrade() {
                SyncOrchestrator { inner }.handle_change_event(event);
            }
        }));

        Self { inner }
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.inner.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.inner.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ========== Lifecycle ==========

    /// Watch enabled folders, start the pipeline and timers, and kick off the
    /// initial full sync when auto-sync is on.
    pub fn start(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::NotRunning("sync orchestrator"));
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(results) = self.inner.pipeline.take_results() {
            let this = self.clone();
            let handle = tokio::spawn(async move { this.consume_results(results).await });
            *lock(&self.inner.results_task) = Some(handle);
        }

        let enabled: Vec<FolderDefinition> = self.read().registry.enabled().cloned().collect();
        for folder in &enabled {
            self.watch_folder(folder);
        }

        let started = self
            .inner
            .watcher
            .start()
            .and_then(|()| self.inner.pipeline.start());
        if let Err(e) = started {
            self.inner.running.store(false, Ordering::SeqCst);
            error!(error = %e, "Sync orchestrator failed to start");
            return Err(e);
        }
        *lock(&self.inner.started_at) = Some(Instant::now());

        let this = self.clone();
        self.inner.background.spawn(async move { this.periodic_loop().await });

        let snapshot = self.inner.settings.load();
        if snapshot.sync.auto_sync {
            let this = self.clone();
            self.inner.background.spawn(async move {
                match this.full_sync().await {
                    Ok(report) => debug!(?report, "Initial full sync finished"),
                    Err(e) => warn!(error = %e, "Initial full sync failed"),
                }
            });
        }

        info!(
            folders = enabled.len(),
            interval_minutes = snapshot.sync.sync_interval_minutes,
            auto_sync = snapshot.sync.auto_sync,
            "Sync orchestrator started"
        );
        Ok(())
    }

    /// Cancel background work, close the pipeline and wait for in-flight uploads.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping sync orchestrator");

        self.inner.cancel.cancel();
        self.inner.watcher.stop().await;

        self.inner.background.close();
        self.inner.background.wait().await;

        self.inner.pipeline.stop().await;

        let results = lock(&self.inner.results_task).take();
        if let Some(handle) = results {
            if let Err(e) = handle.await {
                warn!(error = %e, "Result consumer panicked");
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        info!("Sync orchestrator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn periodic_loop(self) {
        loop {
            let interval = self.inner.settings.load().sync.sync_interval();
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.full_sync().await {
                Ok(report) => debug!(?report, "Periodic full sync finished"),
                Err(SyncError::SyncInProgress) => debug!("Skipping periodic sync, one is already running"),
                Err(e) => error!(error = %e, "Periodic full sync failed"),
            }
        }
        debug!("Periodic sync loop exited");
    }

    async fn consume_results(self, mut results: mpsc::UnboundedReceiver<UploadResult>) {
        while let Some(result) = results.recv().await {
            self.record_result(&result);
        }
        debug!("Upload result stream closed");
    }

    fn record_result(&self, result: &UploadResult) {
        let mut table = self.write();
        let table = &mut *table;
        if result.success {
            table.totals.files_uploaded += 1;
            table.totals.bytes_uploaded += result.size;
        } else {
            table.totals.errors += 1;
        }

        if let Some(state) = table.registry.state_mut(&result.task.folder_id) {
            if result.success {
                state.stats.files_uploaded += 1;
                state.stats.bytes_uploaded += result.size;
            } else {
                state.stats.errors += 1;
                state.last_error = result.error.clone();
            }
        }
    }

    fn count_error(&self, folder_id: &str, reason: Option<String>) {
        let mut table = self.write();
        table.totals.errors += 1;
        if let Some(state) = table.registry.state_mut(folder_id) {
            state.stats.errors += 1;
            if reason.is_some() {
                state.last_error = reason;
            }
        }
    }

    // ========== State machine ==========

    /// Current global state.
    pub fn state(&self) -> SyncState {
        self.read().state
    }

    /// Register a callback for global and per-folder status transitions.
    pub fn add_status_handler(&self, handler: StatusHandler) {
        self.inner
            .status_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn notify(&self, change: StatusChange) {
        let handlers = self
            .inner
            .status_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in &handlers {
            handler(&change);
        }
    }

    /// Apply `update` to the global state and report the result if it changed.
    fn set_state(
        &self,
        update: impl FnOnce(SyncState) -> Option<SyncState>,
    ) -> Option<SyncState> {
        let changed = {
            let mut table = self.write();
            match update(table.state) {
                Some(next) if next != table.state => {
                    table.state = next;
                    Some(next)
                }
                _ => None,
            }
        };
        if let Some(state) = changed {
            self.notify(StatusChange::Global { state });
        }
        changed
    }

    fn set_folder_status(&self, id: &str, status: FolderStatus) {
        let changed = match self.write().registry.state_mut(id) {
            Some(state) if state.status != status => {
                state.status = status;
                true
            }
            _ => false,
        };
        if changed {
            self.notify(StatusChange::Folder {
                folder_id: id.to_string(),
                status,
            });
        }
    }

    /// Move to `next` unless paused.
    fn transition(&self, next: SyncState) {
        self.set_state(|current| (current != SyncState::Paused).then_some(next));
    }

    fn transition_if(&self, from: SyncState, to: SyncState) {
        self.set_state(|current| (current == from).then_some(to));
    }

    /// Advertise `Paused`. Background activity keeps running.
    pub fn pause_sync(&self) {
        if self.set_state(|_| Some(SyncState::Paused)).is_some() {
            info!("Sync paused");
        }
    }

    /// Leave `Paused` (or `Error`) without triggering a sync.
    pub fn resume_sync(&self) {
        let syncing = self.inner.sync_lock.try_lock().is_err();
        let resumed = self.set_state(|current| {
            matches!(current, SyncState::Paused | SyncState::Error).then_some(if syncing {
                SyncState::Syncing
            } else {
                SyncState::Idle
            })
        });
        if let Some(state) = resumed {
            info!(?state, "Sync resumed");
        }
    }

    /// Status snapshot for the hosting process.
    pub fn health(&self) -> HealthSnapshot {
        let started_at = *lock(&self.inner.started_at);
        let uptime_secs = started_at.map(|t| t.elapsed().as_secs()).unwrap_or(0);
        let settings_version = self.inner.settings.load().version;
        let queued_uploads = self.inner.pipeline.queued();

        let table = self.read();
        HealthSnapshot {
            state: table.state,
            uptime_secs,
            files_uploaded: table.totals.files_uploaded,
            bytes_uploaded: table.totals.bytes_uploaded,
            files_downloaded: table.totals.files_downloaded,
            bytes_downloaded: table.totals.bytes_downloaded,
            errors: table.totals.errors,
            enabled_folders: table.registry.enabled().count(),
            folders_count: table.registry.len(),
            queued_uploads,
            last_sync_at: table.last_sync_at,
            settings_version,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Settings currently in effect.
    pub fn settings(&self) -> Arc<SettingsSnapshot> {
        self.inner.settings.load()
    }

    // ========== Folder introspection ==========

    pub fn folders(&self) -> Vec<FolderDefinition> {
        self.read().registry.definitions().cloned().collect()
    }

    pub fn folder(&self, id: &str) -> Option<FolderDefinition> {
        self.read().registry.get(id).cloned()
    }

    pub fn folder_state(&self, id: &str) -> Option<FolderState> {
        self.read().registry.state(id).cloned()
    }

    pub fn folder_states(&self) -> Vec<FolderState> {
        self.read().registry.states()
    }

    /// Directories currently registered with the watcher.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.inner.watcher.watched_paths()
    }

    // ========== Folder management ==========

    /// Register a new folder, persist it, and start watching it if enabled.
    pub fn add_folder(&self, config: FolderConfig) -> Result<FolderDefinition> {
        let definition = FolderDefinition::from(&normalize_folder(config));
        {
            let mut table = self.write();
            table.registry.check(&definition, None)?;
            self.inner
                .persistence
                .persist(PersistIntent::UpsertFolder(definition.to_config()))?;
            table.registry.insert_unchecked(definition.clone());
        }

        if definition.enabled {
            self.watch_folder(&definition);
        }
        info!(folder = %definition.id, path = %definition.local_path.display(), "Folder added");
        Ok(definition)
    }

    /// Forget a folder and drop its watch.
    pub fn remove_folder(&self, id: &str) -> Result<FolderDefinition> {
        let removed = {
            let mut table = self.write();
            if !table.registry.contains(id) {
                return Err(SyncError::FolderNotFound(id.to_string()));
            }
            self.inner
                .persistence
                .persist(PersistIntent::RemoveFolder(id.to_string()))?;
            table.registry.remove(id)?
        };

        self.unwatch_path(&removed.local_path);
        info!(folder = %removed.id, "Folder removed");
        Ok(removed)
    }

    pub fn enable_folder(&self, id: &str) -> Result<()> {
        let definition = {
            let mut table = self.write();
            let mut definition = table
                .registry
                .get(id)
                .cloned()
                .ok_or_else(|| SyncError::FolderNotFound(id.to_string()))?;
            if definition.enabled {
                return Ok(());
            }
            definition.enabled = true;
            table.registry.check(&definition, Some(id))?;
            self.inner
                .persistence
                .persist(PersistIntent::UpsertFolder(definition.to_config()))?;
            table.registry.replace(definition.clone())?;
            definition
        };

        self.watch_folder(&definition);
        info!(folder = %id, "Folder enabled");
        Ok(())
    }

    pub fn disable_folder(&self, id: &str) -> Result<()> {
        let definition = {
            let mut table = self.write();
            let mut definition = table
                .registry
                .get(id)
                .cloned()
                .ok_or_else(|| SyncError::FolderNotFound(id.to_string()))?;
            if !definition.enabled {
                return Ok(());
            }
            definition.enabled = false;
            self.inner
                .persistence
                .persist(PersistIntent::UpsertFolder(definition.to_config()))?;
            table.registry.replace(definition.clone())?;
            definition
        };

        self.unwatch_path(&definition.local_path);
        info!(folder = %id, "Folder disabled");
        Ok(())
    }

    /// Replace a folder's settings; the id selects the folder.
    pub fn update_folder(&self, config: FolderConfig) -> Result<FolderDefinition> {
        let definition = FolderDefinition::from(&config);
        let previous = {
            let mut table = self.write();
            if !table.registry.contains(&definition.id) {
                return Err(SyncError::FolderNotFound(definition.id.clone()));
            }
            table.registry.check(&definition, Some(&definition.id))?;
            self.inner
                .persistence
                .persist(PersistIntent::UpsertFolder(definition.to_config()))?;
            table.registry.replace(definition.clone())?
        };

        if previous.enabled {
            self.unwatch_path(&previous.local_path);
        }
        if definition.enabled {
            self.watch_folder(&definition);
        }
        info!(folder = %definition.id, "Folder updated");
        Ok(self.folder(&definition.id).unwrap_or(definition))
    }

    /// Swap in new settings and reconcile the folder table with `config`.
    ///
    /// Reloaded folders come from the configuration itself, so nothing is
    /// persisted. Worker count and throttle apply from the next start.
    pub fn reload(&self, config: &AgentConfig) -> Result<()> {
        let snapshot = self.inner.settings.swap(config.sync.clone());

        let wanted: Vec<FolderDefinition> = config
            .folders
            .iter()
            .map(|f| FolderDefinition::from(&normalize_folder(f.clone())))
            .collect();

        let mut unwatch = Vec::new();
        let mut watch = Vec::new();
        {
            let mut table = self.write();
            let existing: Vec<FolderDefinition> = table.registry.definitions().cloned().collect();

            for old in &existing {
                if !wanted.iter().any(|w| w.id == old.id) {
                    if table.registry.remove(&old.id).is_ok() && old.enabled {
                        unwatch.push(old.local_path.clone());
                    }
                }
            }

            for new in &wanted {
                match table.registry.get(&new.id).cloned() {
                    Some(old) if old.same_settings(new) => {}
                    Some(old) => match table.registry.replace(new.clone()) {
                        Ok(_) => {
                            if old.enabled {
                                unwatch.push(old.local_path.clone());
                            }
                            if new.enabled {
                                watch.push(new.clone());
                            }
                        }
                        Err(e) => warn!(folder = %new.id, error = %e, "Keeping previous folder settings"),
                    },
                    None => {
                        if let Some(admitted) = admit_configured(&mut table.registry, new.clone()) {
                            if admitted.enabled {
                                watch.push(admitted);
                            }
                        }
                    }
                }
            }
        }

        for path in &unwatch {
            self.unwatch_path(path);
        }
        for folder in &watch {
            self.watch_folder(folder);
        }

        info!(
            settings_version = snapshot.version,
            folders = wanted.len(),
            "Configuration reloaded"
        );
        Ok(())
    }

    fn watch_folder(&self, folder: &FolderDefinition) {
        if let Err(e) =
            self.inner
                .watcher
                .watch_path(&folder.local_path, true, &folder.exclude_patterns)
        {
            warn!(folder = %folder.id, error = %e, "Failed to watch folder");
        }
    }

    /// Drop the watch on `path`, then re-watch enabled folders that shared directories with it.
    fn unwatch_path(&self, path: &Path) {
        if let Err(e) = self.inner.watcher.remove_path(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove watch");
        }

        let overlapping: Vec<FolderDefinition> = self
            .read()
            .registry
            .enabled()
            .filter(|f| f.local_path.starts_with(path) || path.starts_with(&f.local_path))
            .cloned()
            .collect();
        for folder in &overlapping {
            self.watch_folder(folder);
        }
    }

    // ========== Event handling ==========

    fn upload_task(folder: &FolderDefinition, path: PathBuf, relative: &str) -> UploadTask {
        let mut metadata = ObjectMetadata::new();
        metadata.insert(meta_keys::FOLDER_ID.to_string(), folder.id.clone());
        metadata.insert(
            meta_keys::SOURCE_FOLDER.to_string(),
            folder.local_path.to_string_lossy().to_string(),
        );
        metadata.insert(
            meta_keys::UPLOAD_TIME.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );

        UploadTask::new(
            path,
            object_key(&folder.remote_namespace, relative),
            folder.id.clone(),
        )
        .with_metadata(metadata)
    }

    /// True if `path` still carries the mtime reconciliation gave it.
    fn is_own_download(&self, path: &Path) -> bool {
        let mut downloaded = lock(&self.inner.downloaded);
        let Some(expected) = downloaded.get(path).copied() else {
            return false;
        };
        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) if mtime == expected => true,
            _ => {
                downloaded.remove(path);
                false
            }
        }
    }

    /// Route a watcher event: uploads for creates and modifications, log-only otherwise.
    pub fn handle_change_event(&self, event: &ChangeEvent) {
        if is_part_file(&event.path) {
            return;
        }

        match event.kind {
            ChangeKind::Create | ChangeKind::Modify => {
                if !event.path.is_file() {
                    return;
                }
                if self.is_own_download(&event.path) {
                    debug!(path = %event.path.display(), "Ignoring event for downloaded file");
                    return;
                }

                let task = {
                    let table = self.read();
                    let Some((folder, matcher)) = table.registry.owner_of(&event.path) else {
                        debug!(path = %event.path.display(), "Event outside any enabled folder");
                        return;
                    };
                    let relative = match event.path.strip_prefix(&folder.local_path) {
                        Ok(rel) => relative_key(rel),
                        Err(_) => return,
                    };
                    if matcher.is_excluded(&relative) {
                        debug!(path = %event.path.display(), "Excluded path, ignoring event");
                        return;
                    }
                    Self::upload_task(folder, event.path.clone(), &relative)
                };

                let folder_id = task.folder_id.clone();
                match self.inner.pipeline.queue_upload(task) {
                    Ok(()) => debug!(path = %event.path.display(), kind = ?event.kind, "Queued upload"),
                    Err(e @ SyncError::QueueFull { .. }) => {
                        warn!(path = %event.path.display(), error = %e, "Dropping change event");
                        self.count_error(&folder_id, Some(e.to_string()));
                    }
                    Err(e) => debug!(path = %event.path.display(), error = %e, "Upload not queued"),
                }
            }
            ChangeKind::Delete | ChangeKind::Rename => {
                info!(
                    path = %event.path.display(),
                    kind = ?event.kind,
                    "Local removal observed; remote copy is kept"
                );
            }
        }
    }

    // ========== Full sync ==========

    /// Scan every enabled folder and, for two-way folders, reconcile with the remote.
    pub async fn full_sync(&self) -> Result<SyncReport> {
        let folders = self.enabled_folders();
        self.run_sync(folders).await
    }

    /// Scan one folder, or all enabled folders when `folder_id` is `None`.
    pub async fn sync_now(&self, folder_id: Option<&str>) -> Result<SyncReport> {
        let Some(id) = folder_id else {
            return self.full_sync().await;
        };

        let folder = {
            let table = self.read();
            let definition = table
                .registry
                .get(id)
                .cloned()
                .ok_or_else(|| SyncError::FolderNotFound(id.to_string()))?;
            if !definition.enabled {
                return Err(SyncError::Validation(format!("folder {} is disabled", id)));
            }
            let matcher = table.registry.matcher(id).cloned().unwrap_or_default();
            (definition, matcher)
        };
        self.run_sync(vec![folder]).await
    }

    fn enabled_folders(&self) -> Vec<(FolderDefinition, PathMatcher)> {
        let table = self.read();
        table
            .registry
            .enabled()
            .map(|def| {
                let matcher = table.registry.matcher(&def.id).cloned().unwrap_or_default();
                (def.clone(), matcher)
            })
            .collect()
    }

    async fn run_sync(&self, folders: Vec<(FolderDefinition, PathMatcher)>) -> Result<SyncReport> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::NotRunning("sync orchestrator"));
        }
        let _guard = self
            .inner
            .sync_lock
            .try_lock()
            .map_err(|_| SyncError::SyncInProgress)?;

        self.transition(SyncState::Scanning);
        info!(folders = folders.len(), "Full sync started");

        let mut workers = JoinSet::new();
        for (folder, matcher) in folders {
            self.set_folder_status(&folder.id, FolderStatus::Syncing);
            let this = self.clone();
            workers.spawn(async move {
                let outcome = this.sync_folder(&folder, &matcher).await;
                (folder.id, outcome)
            });
        }

        let mut report = SyncReport::default();
        while let Some(joined) = workers.join_next().await {
            report.folders += 1;
            let (id, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Folder sync worker panicked");
                    report.failed_folders += 1;
                    report.errors += 1;
                    continue;
                }
            };

            let now = Utc::now();
            match outcome {
                Ok(outcome) => {
                    report.queued += outcome.queued;
                    report.downloaded += outcome.downloaded;
                    report.errors += outcome.errors;
                    self.write().registry.mark_synced(&id, now, None);
                    self.notify_folder_idle(&id);
                }
                Err(e) => {
                    error!(folder = %id, error = %e, "Folder sync failed");
                    report.failed_folders += 1;
                    report.errors += 1;
                    self.count_error(&id, None);
                    self.write().registry.mark_synced(&id, now, Some(e.to_string()));
                    self.notify_folder_idle(&id);
                }
            }
        }

        self.write().last_sync_at = Some(Utc::now());
        let failed = report.folders > 0 && report.failed_folders == report.folders;
        self.set_state(|current| {
            (current != SyncState::Paused).then_some(if failed {
                SyncState::Error
            } else {
                SyncState::Idle
            })
        });

        info!(
            folders = report.folders,
            failed = report.failed_folders,
            queued = report.queued,
            downloaded = report.downloaded,
            errors = report.errors,
            "Full sync finished"
        );
        Ok(report)
    }

    /// Report a folder back to idle after `mark_synced`.
    fn notify_folder_idle(&self, id: &str) {
        self.notify(StatusChange::Folder {
            folder_id: id.to_string(),
            status: FolderStatus::Idle,
        });
    }

    async fn sync_folder(
        &self,
        folder: &FolderDefinition,
        matcher: &PathMatcher,
    ) -> Result<FolderOutcome> {
        if !folder.local_path.is_dir() {
            return Err(SyncError::Validation(format!(
                "local path is not a directory: {}",
                folder.local_path.display()
            )));
        }

        let mut outcome = FolderOutcome::default();
        // Remote wins for these keys in this pass; uploading them would
        // overwrite the newer object with the stale local copy.
        let remote_owned = if folder.two_way_sync {
            self.reconcile(folder, matcher, &mut outcome).await?
        } else {
            HashSet::new()
        };

        let root = folder.local_path.clone();
        let scan_matcher = matcher.clone();
        let (files, walk_errors) =
            tokio::task::spawn_blocking(move || scan_local(&root, &scan_matcher))
                .await
                .map_err(|e| SyncError::Storage(anyhow::anyhow!("scan task failed: {}", e)))?;

        outcome.errors += walk_errors;
        for _ in 0..walk_errors {
            self.count_error(&folder.id, None);
        }

        debug!(folder = %folder.id, files = files.len(), "Local scan complete");
        self.transition_if(SyncState::Scanning, SyncState::Syncing);

        for (path, relative) in files {
            if remote_owned.contains(&relative) {
                continue;
            }
            let task = Self::upload_task(folder, path, &relative);
            match self.enqueue_scanned(task).await {
                Ok(()) => outcome.queued += 1,
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    warn!(folder = %folder.id, path = %relative, error = %e, "Failed to queue upload");
                    outcome.errors += 1;
                    self.count_error(&folder.id, Some(e.to_string()));
                }
            }
        }
        Ok(outcome)
    }

    /// Enqueue a scanned file, waiting for room while the pipeline is draining.
    async fn enqueue_scanned(&self, task: UploadTask) -> Result<()> {
        loop {
            match self.inner.pipeline.queue_upload(task.clone()) {
                Err(SyncError::QueueFull { .. }) if self.inner.pipeline.is_started() => {
                    tokio::select! {
                        _ = self.inner.cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(QUEUE_FULL_BACKOFF) => {}
                    }
                }
                other => return other,
            }
        }
    }

    // ========== Two-way reconciliation ==========

    /// Pull remote objects that are newer than their local copy.
    ///
    /// Returns the relative keys the remote side owns for this pass: those
    /// downloaded and those whose download failed.
    async fn reconcile(
        &self,
        folder: &FolderDefinition,
        matcher: &PathMatcher,
        outcome: &mut FolderOutcome,
    ) -> Result<HashSet<String>> {
        let remote = self
            .inner
            .backend
            .list_files(&folder.remote_namespace)
            .await
            .map_err(|e| SyncError::RemoteList {
                prefix: folder.remote_namespace.clone(),
                reason: format!("{:#}", e),
            })?;
        debug!(folder = %folder.id, objects = remote.len(), "Remote listing complete");

        let mut remote_owned = HashSet::new();
        for object in &remote {
            if self.inner.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let Some(relative) = strip_namespace(&object.key, &folder.remote_namespace) else {
                continue;
            };
            if matcher.is_excluded(relative) || relative.ends_with(PART_SUFFIX) {
                continue;
            }
            let Some(local) = local_target(&folder.local_path, relative) else {
                warn!(folder = %folder.id, key = %object.key, "Remote key escapes the folder, skipping");
                continue;
            };

            match self.reconcile_one(object, &local).await {
                Ok(Some(bytes)) => {
                    remote_owned.insert(relative.to_string());
                    outcome.downloaded += 1;
                    let mut table = self.write();
                    table.totals.files_downloaded += 1;
                    table.totals.bytes_downloaded += bytes;
                    if let Some(state) = table.registry.state_mut(&folder.id) {
                        state.stats.files_downloaded += 1;
                        state.stats.bytes_downloaded += bytes;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    remote_owned.insert(relative.to_string());
                    warn!(folder = %folder.id, key = %object.key, error = %e, "Download failed");
                    outcome.errors += 1;
                    self.count_error(&folder.id, Some(e.to_string()));
                }
            }
        }
        Ok(remote_owned)
    }

    /// Bring `local` up to date with `object`. Returns the bytes downloaded, if any.
    async fn reconcile_one(&self, object: &RemoteFileInfo, local: &Path) -> Result<Option<u64>> {
        match tokio::fs::metadata(local).await {
            Ok(meta) if meta.is_dir() => {
                debug!(path = %local.display(), "Remote object shadows a local directory");
                return Ok(None);
            }
            Ok(meta) => {
                let local_time = DateTime::<Utc>::from(meta.modified()?);
                if local_time >= object.last_modified {
                    return Ok(None);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let bytes = self
            .download(object, local, SystemTime::from(object.last_modified))
            .await?;
        Ok(Some(bytes))
    }

    async fn download(&self, object: &RemoteFileInfo, dest: &Path, mtime: SystemTime) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = part_path(dest);

        let size = match self.fetch_staged(object, &staging, mtime).await {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e);
            }
        };

        lock(&self.inner.downloaded).insert(dest.to_path_buf(), mtime);
        if let Err(e) = tokio::fs::rename(&staging, dest).await {
            lock(&self.inner.downloaded).remove(dest);
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(SyncError::Download {
                key: object.key.clone(),
                reason: e.to_string(),
            });
        }

        info!(
            key = %object.key,
            path = %dest.display(),
            size = %object.format_size(),
            "Downloaded remote change"
        );
        Ok(size)
    }

    /// Write `object` to `staging` and stamp it with `mtime`.
    async fn fetch_staged(
        &self,
        object: &RemoteFileInfo,
        staging: &Path,
        mtime: SystemTime,
    ) -> Result<u64> {
        let mut file = tokio::fs::File::create(staging).await?;
        self.inner
            .backend
            .download_file(&object.key, &mut file, None)
            .await
            .map_err(|e| SyncError::Download {
                key: object.key.clone(),
                reason: format!("{:#}", e),
            })?;

        file.flush().await?;
        let file = file.into_std().await;
        let size = file.metadata()?.len();
        file.set_modified(mtime)?;
        Ok(size)
    }
}
