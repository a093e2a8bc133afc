// Shared fixtures for the sync integration tests
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use cloudsync::config::{AgentConfig, FolderConfig, MemoryConfigStore, SyncSettings};
use cloudsync::error::{Result, SyncError};
use cloudsync::fs::{
    ContentReader, ContentWriter, ObjectMetadata, ProviderKind, RemoteFileInfo, StorageBackend,
};
use cloudsync::sync::{
    hash_bytes, ChangeEvent, ChangeWatcher, EventHandler, PipelineConfig, SyncOrchestrator,
};

pub const HI_SHA256: &str = "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4";

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub metadata: ObjectMetadata,
    pub last_modified: DateTime<Utc>,
}

/// Object store kept in memory, with switches for injecting failures.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    attempts: AtomicU32,
    fail_uploads: AtomicBool,
    fail_list: AtomicBool,
    fail_downloads: AtomicBool,
    list_delay: Mutex<Option<Duration>>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed an object as if another machine had uploaded it.
    pub fn put_remote(&self, key: &str, data: &[u8], last_modified: DateTime<Utc>) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                metadata: ObjectMetadata::new(),
                last_modified,
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Downloads write half the body, then fail.
    pub fn fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    pub fn delay_list(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn upload_file(
        &self,
        key: &str,
        content: ContentReader<'_>,
        metadata: &ObjectMetadata,
    ) -> anyhow::Result<String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_uploads.load(Ordering::SeqCst) {
            anyhow::bail!("simulated outage");
        }

        let mut data = Vec::new();
        content.read_to_end(&mut data).await?;
        let version = hash_bytes(&data);
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data,
                metadata: metadata.clone(),
                last_modified: Utc::now(),
            },
        );
        Ok(version)
    }

    async fn download_file(
        &self,
        key: &str,
        output: ContentWriter<'_>,
        _version_id: Option<&str>,
    ) -> anyhow::Result<ObjectMetadata> {
        let object = self
            .object(key)
            .ok_or_else(|| anyhow::anyhow!("no such key: {}", key))?;
        if self.fail_downloads.load(Ordering::SeqCst) {
            output.write_all(&object.data[..object.data.len() / 2]).await?;
            anyhow::bail!("connection reset");
        }
        output.write_all(&object.data).await?;
        output.flush().await?;
        Ok(object.metadata)
    }

    async fn delete_file(&self, key: &str) -> anyhow::Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_files(&self, prefix: &str) -> anyhow::Result<Vec<RemoteFileInfo>> {
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_list.load(Ordering::SeqCst) {
            anyhow::bail!("listing unavailable");
        }

        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| RemoteFileInfo {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: object.last_modified,
                etag: hash_bytes(&object.data),
            })
            .collect())
    }

    async fn file_exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Local
    }
}

/// Watcher driven by the test: records registrations, emits on demand.
#[derive(Default)]
pub struct ManualWatcher {
    roots: Mutex<Vec<PathBuf>>,
    handlers: Mutex<Vec<EventHandler>>,
    started: AtomicBool,
    fail_start: AtomicBool,
}

impl ManualWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn emit(&self, event: ChangeEvent) {
        let handlers = self.handlers.lock().unwrap().clone();
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots = self.roots.lock().unwrap().clone();
        roots.sort();
        roots
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }
}

#[async_trait]
impl ChangeWatcher for ManualWatcher {
    fn watch_path(&self, path: &Path, _recursive: bool, _exclude_patterns: &[String]) -> Result<()> {
        let mut roots = self.roots.lock().unwrap();
        if !roots.iter().any(|p| p == path) {
            roots.push(path.to_path_buf());
        }
        Ok(())
    }

    fn remove_path(&self, path: &Path) -> Result<()> {
        self.roots.lock().unwrap().retain(|p| !p.starts_with(path));
        Ok(())
    }

    fn add_handler(&self, handler: EventHandler) {
        self.handlers.lock().unwrap().push(handler);
    }

    fn start(&self) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SyncError::WatcherInit("simulated inotify limit".to_string()));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn watched_paths(&self) -> Vec<PathBuf> {
        self.roots()
    }
}

/// Settings that keep timers out of the way of a test.
pub fn quiet_settings() -> SyncSettings {
    SyncSettings {
        max_concurrency: 2,
        throttle_bytes_per_second: 0,
        sync_interval_minutes: 60,
        auto_sync: false,
    }
}

pub fn fast_pipeline() -> PipelineConfig {
    PipelineConfig {
        max_concurrency: 2,
        retry_base: Duration::from_millis(10),
        ..PipelineConfig::default()
    }
}

pub fn folder(id: &str, path: &Path) -> FolderConfig {
    FolderConfig {
        id: id.to_string(),
        local_path: path.to_path_buf(),
        ..FolderConfig::default()
    }
}

pub fn agent_config(folders: Vec<FolderConfig>) -> AgentConfig {
    AgentConfig {
        sync: quiet_settings(),
        folders,
        ..AgentConfig::default()
    }
}

pub struct Harness {
    pub orchestrator: SyncOrchestrator,
    pub backend: Arc<MemoryBackend>,
    pub watcher: Arc<ManualWatcher>,
    pub store: Arc<MemoryConfigStore>,
}

impl Harness {
    pub fn new(folders: Vec<FolderConfig>) -> Self {
        let backend = MemoryBackend::new();
        Self::with_backend(folders, backend)
    }

    pub fn with_backend(folders: Vec<FolderConfig>, backend: Arc<MemoryBackend>) -> Self {
        let watcher = ManualWatcher::new();
        let store = Arc::new(MemoryConfigStore::new());
        let orchestrator = SyncOrchestrator::with_pipeline_config(
            &agent_config(folders),
            backend.clone(),
            watcher.clone(),
            store.clone(),
            fast_pipeline(),
        );
        Self {
            orchestrator,
            backend,
            watcher,
            store,
        }
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn set_mtime(path: &Path, at: DateTime<Utc>) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(std::time::SystemTime::from(at)).unwrap();
}

pub fn mtime(path: &Path) -> std::time::SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}
