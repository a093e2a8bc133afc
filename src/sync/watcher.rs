//! File system watcher for real-time sync.
//!
//! Every directory is registered with the OS non-recursively, so the
//! watcher keeps its own registration set: a recursive `watch_path` walks
//! the tree once (pruning excluded directories), directories created later
//! are registered as their Create event is dispatched, and deletes or
//! renames drop the affected subtree from the set.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::sync::exclude::{walk_pruned, PathMatcher};

/// Type of file system change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
    Rename,
}

/// A change observed under a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Absolute path of the affected entry.
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            timestamp: Utc::now(),
        }
    }
}

/// Callback invoked for every dispatched event.
pub type EventHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Observes directory trees and dispatches change events to handlers.
///
/// Handlers run on a single dispatch loop in registration order.
#[async_trait]
pub trait ChangeWatcher: Send + Sync {
    /// Register `path`, and with `recursive` every non-excluded subdirectory.
    fn watch_path(&self, path: &Path, recursive: bool, exclude_patterns: &[String]) -> Result<()>;

    /// Unregister `path` and every registered descendant.
    fn remove_path(&self, path: &Path) -> Result<()>;

    fn add_handler(&self, handler: EventHandler);

    /// Spawn the dispatch loop on the current tokio runtime.
    fn start(&self) -> Result<()>;

    /// Close the notification source and wait for the dispatch loop to exit.
    async fn stop(&self);

    /// Directories currently registered with the OS, sorted.
    fn watched_paths(&self) -> Vec<PathBuf>;
}

/// A path passed to `watch_path`, with the options it was registered with.
#[derive(Debug, Clone)]
struct WatchRoot {
    path: PathBuf,
    recursive: bool,
    matcher: PathMatcher,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the public handle and the dispatch loop.
struct Shared {
    os: Mutex<Option<RecommendedWatcher>>,
    registered: Mutex<BTreeSet<PathBuf>>,
    roots: Mutex<Vec<WatchRoot>>,
    handlers: RwLock<Vec<EventHandler>>,
}

impl Shared {
    fn register_dir(&self, dir: &Path) -> Result<()> {
        let mut os = lock(&self.os);
        let watcher = os.as_mut().ok_or(SyncError::NotRunning("file watcher"))?;
        let mut registered = lock(&self.registered);
        if registered.contains(dir) {
            return Ok(());
        }

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| SyncError::WatchRegistration {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?;
        registered.insert(dir.to_path_buf());
        Ok(())
    }

    /// Register `start` and every non-excluded directory below it.
    ///
    /// Failures below `start` are logged and skipped.
    fn register_tree(&self, root: &WatchRoot, start: &Path) -> Result<usize> {
        self.register_dir(start)?;
        let mut count = 1;

        for entry in walk_pruned(&root.path, start, &root.matcher, true) {
            match entry {
                Ok(entry) if entry.depth() > 0 && entry.file_type().is_dir() => {
                    let dir = entry.path();
                    match self.register_dir(&dir) {
                        Ok(()) => count += 1,
                        Err(e) => warn!(path = %dir.display(), error = %e, "Skipping directory watch"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(root = %start.display(), error = %e, "Failed to walk directory"),
            }
        }

        Ok(count)
    }

    /// Drop `path` and its registered descendants.
    fn deregister(&self, path: &Path) -> usize {
        let mut os = lock(&self.os);
        let mut registered = lock(&self.registered);

        let stale: Vec<PathBuf> = registered
            .iter()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();

        for dir in &stale {
            registered.remove(dir);
            if let Some(watcher) = os.as_mut() {
                // The OS may already have dropped the watch with the directory.
                if let Err(e) = watcher.unwatch(dir) {
                    debug!(path = %dir.display(), error = %e, "Unwatch failed");
                }
            }
        }

        stale.len()
    }

    /// The recursive root that owns `path`, if any (longest prefix wins).
    fn owning_root(&self, path: &Path) -> Option<WatchRoot> {
        lock(&self.roots)
            .iter()
            .filter(|root| path.starts_with(&root.path))
            .max_by_key(|root| root.path.components().count())
            .cloned()
    }

    /// Register a directory that appeared after its root was watched.
    fn register_new_dir(&self, dir: &Path) {
        let Some(root) = self.owning_root(dir) else {
            return;
        };
        if !root.recursive || root.matcher.is_excluded_under(&root.path, dir) {
            return;
        }

        match self.register_tree(&root, dir) {
            Ok(count) => debug!(path = %dir.display(), count, "Watching new directory"),
            Err(e) => warn!(path = %dir.display(), error = %e, "Failed to watch new directory"),
        }
    }

    /// Map a notify event onto change events, updating registrations on the way.
    fn translate(&self, event: Event) -> Vec<ChangeEvent> {
        let mut changes = Vec::new();

        match event.kind {
            EventKind::Create(kind) => {
                for path in event.paths {
                    if kind == CreateKind::Folder || path.is_dir() {
                        self.register_new_dir(&path);
                    }
                    changes.push(ChangeEvent::new(ChangeKind::Create, path));
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => {
                    for path in event.paths {
                        self.deregister(&path);
                        changes.push(ChangeEvent::new(ChangeKind::Rename, path));
                    }
                }
                RenameMode::To => {
                    for path in event.paths {
                        if path.is_dir() {
                            self.register_new_dir(&path);
                        }
                        changes.push(ChangeEvent::new(ChangeKind::Create, path));
                    }
                }
                RenameMode::Both => {
                    // The From and To halves arrive as separate events.
                    if let [from, to] = event.paths.as_slice() {
                        self.deregister(from);
                        if to.is_dir() {
                            self.register_new_dir(to);
                        }
                    }
                }
                RenameMode::Any | RenameMode::Other => {
                    for path in event.paths {
                        if path.exists() {
                            if path.is_dir() {
                                self.register_new_dir(&path);
                            }
                            changes.push(ChangeEvent::new(ChangeKind::Create, path));
                        } else {
                            self.deregister(&path);
                            changes.push(ChangeEvent::new(ChangeKind::Rename, path));
                        }
                    }
                }
            },
            // Attribute-only changes (including mtimes set after a download) carry no new content.
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) => {
                for path in event.paths {
                    changes.push(ChangeEvent::new(ChangeKind::Modify, path));
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    self.deregister(&path);
                    changes.push(ChangeEvent::new(ChangeKind::Delete, path));
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }

        changes
    }

    fn deliver(&self, change: &ChangeEvent) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in &handlers {
            handler(change);
        }
    }
}

/// [`ChangeWatcher`] backed by the platform's native notification API.
pub struct NotifyWatcher {
    shared: Arc<Shared>,
    events: Mutex<Option<mpsc::UnboundedReceiver<notify::Result<Event>>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl NotifyWatcher {
    /// Create the OS notification source. Paths can be registered before `start`.
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .map_err(|e| SyncError::WatcherInit(e.to_string()))?;

        Ok(Self {
            shared: Arc::new(Shared {
                os: Mutex::new(Some(watcher)),
                registered: Mutex::new(BTreeSet::new()),
                roots: Mutex::new(Vec::new()),
                handlers: RwLock::new(Vec::new()),
            }),
            events: Mutex::new(Some(rx)),
            dispatch: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        lock(&self.shared.registered).contains(path)
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = events.recv() => next,
        };
        let Some(result) = next else {
            break;
        };

        match result {
            Ok(event) => {
                for change in shared.translate(event) {
                    shared.deliver(&change);
                }
            }
            Err(e) => warn!(error = %e, "File watcher reported an error"),
        }
    }
    debug!("Watcher dispatch loop exited");
}

#[async_trait]
impl ChangeWatcher for NotifyWatcher {
    fn watch_path(&self, path: &Path, recursive: bool, exclude_patterns: &[String]) -> Result<()> {
        let root = WatchRoot {
            path: path.to_path_buf(),
            recursive,
            matcher: PathMatcher::new(exclude_patterns),
        };

        if !path.is_dir() {
            return Err(SyncError::WatchRegistration {
                path: path.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        let count = if recursive {
            self.shared.register_tree(&root, path)?
        } else {
            self.shared.register_dir(path)?;
            1
        };

        {
            let mut roots = lock(&self.shared.roots);
            roots.retain(|r| r.path != root.path);
            roots.push(root);
        }

        info!(path = %path.display(), recursive, directories = count, "Watching path");
        Ok(())
    }

    fn remove_path(&self, path: &Path) -> Result<()> {
        lock(&self.shared.roots).retain(|r| !r.path.starts_with(path));
        let removed = self.shared.deregister(path);
        info!(path = %path.display(), directories = removed, "Stopped watching path");
        Ok(())
    }

    fn add_handler(&self, handler: EventHandler) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SyncError::NotRunning("tokio runtime"))?;
        let events = lock(&self.events)
            .take()
            .ok_or(SyncError::NotRunning("file watcher"))?;

        let handle = runtime.spawn(dispatch_loop(
            self.shared.clone(),
            events,
            self.cancel.clone(),
        ));
        *lock(&self.dispatch) = Some(handle);
        debug!("Watcher dispatch loop started");
        Ok(())
    }

    async fn stop(&self) {
        // Dropping the OS watcher closes the event channel.
        drop(lock(&self.shared.os).take());
        lock(&self.shared.registered).clear();
        self.cancel.cancel();

        let handle = lock(&self.dispatch).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Watcher dispatch loop panicked");
            }
        }
        info!("File watcher stopped");
    }

    fn watched_paths(&self) -> Vec<PathBuf> {
        lock(&self.shared.registered).iter().cloned().collect()
    }
}
