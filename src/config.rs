//! Agent configuration.
//!
//! The on-disk format is TOML. Only the resulting shape matters to the sync
//! core: [`SyncSettings`] for the pipeline and timers, [`StorageConfig`] for
//! backend selection, and a list of [`FolderConfig`] entries. Runtime readers
//! see settings through an immutable [`SettingsSnapshot`] that is swapped as
//! a whole on reload, and folder mutations leave the core as
//! [`PersistIntent`] values handed to a [`ConfigPersistence`] port.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SyncError};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "CLOUDSYNC_CONFIG";

/// Global synchronization settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Number of upload workers.
    pub max_concurrency: usize,
    /// Per-stream read cap; 0 disables throttling.
    pub throttle_bytes_per_second: u64,
    /// Minutes between periodic full syncs.
    pub sync_interval_minutes: u64,
    /// Run a full sync right after start.
    pub auto_sync: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            throttle_bytes_per_second: 0,
            sync_interval_minutes: 15,
            auto_sync: true,
        }
    }
}

impl SyncSettings {
    /// Interval between periodic full syncs, never shorter than one minute.
    pub fn sync_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync_interval_minutes.max(1) * 60)
    }
}

/// S3 settings (AWS or any S3-compatible endpoint).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint URL; empty means the AWS default.
    pub endpoint: String,
    /// Empty keys fall back to the ambient AWS credential chain.
    pub access_key: String,
    pub secret_key: String,
}

/// MinIO settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinioSettings {
    /// `host:port`, without scheme.
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub use_ssl: bool,
}

impl Default for MinioSettings {
    fn default() -> Self {
        Self {
            endpoint: "localhost:9000".to_string(),
            bucket: "cloudsync".to_string(),
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            use_ssl: false,
        }
    }
}

impl MinioSettings {
    /// Endpoint URL with the scheme implied by `use_ssl`.
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}", scheme, self.endpoint)
    }
}

/// Google Cloud Storage settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsSettings {
    pub bucket: String,
    /// Service account JSON; empty uses application default credentials.
    pub credentials_file: String,
}

/// Local-disk storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    pub root_dir: PathBuf,
}

impl Default for LocalSettings {
    fn default() -> Self {
        let root_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cloudsync")
            .join("objects");
        Self { root_dir }
    }
}

/// Storage section: a provider discriminator plus per-provider settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// One of `s3`, `minio`, `gcs`, `local`.
    pub provider: String,
    pub s3: S3Settings,
    pub minio: MinioSettings,
    pub gcs: GcsSettings,
    pub local: LocalSettings,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            s3: S3Settings::default(),
            minio: MinioSettings::default(),
            gcs: GcsSettings::default(),
            local: LocalSettings::default(),
        }
    }
}

/// The provider chosen by a [`StorageConfig`], with only its own settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageSelection {
    S3(S3Settings),
    Minio(MinioSettings),
    Gcs(GcsSettings),
    Local(LocalSettings),
}

impl StorageConfig {
    /// Resolve the provider discriminator into a typed selection.
    pub fn selection(&self) -> Result<StorageSelection> {
        match self.provider.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(StorageSelection::S3(self.s3.clone())),
            "minio" => Ok(StorageSelection::Minio(self.minio.clone())),
            "gcs" => Ok(StorageSelection::Gcs(self.gcs.clone())),
            "local" => Ok(StorageSelection::Local(self.local.clone())),
            other => Err(SyncError::Config(format!(
                "unsupported storage provider: '{}'",
                other
            ))),
        }
    }
}

/// One configured sync folder as it appears in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderConfig {
    pub id: String,
    pub local_path: PathBuf,
    pub remote_namespace: String,
    pub exclude_patterns: Vec<String>,
    pub enabled: bool,
    pub two_way_sync: bool,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            local_path: PathBuf::new(),
            remote_namespace: String::new(),
            exclude_patterns: Vec::new(),
            enabled: true,
            two_way_sync: false,
        }
    }
}

/// Complete agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub log_level: String,
    pub sync: SyncSettings,
    pub storage: StorageConfig,
    pub folders: Vec<FolderConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            sync: SyncSettings::default(),
            storage: StorageConfig::default(),
            folders: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Default location: `<config dir>/cloudsync/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cloudsync")
            .join("config.toml")
    }

    /// Pick the config path: explicit argument, then `CLOUDSYNC_CONFIG`, then the default.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => Self::default_path(),
        }
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;
        config.normalize();
        debug!(path = %path.display(), folders = config.folders.len(), "Loaded configuration");
        Ok(config)
    }

    /// Parse TOML text without touching the filesystem.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Give folders without an id a generated one.
    pub fn normalize(&mut self) {
        for folder in &mut self.folders {
            if folder.id.trim().is_empty() {
                folder.id = uuid::Uuid::new_v4().to_string();
            }
        }
    }

    /// Write the configuration atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| SyncError::ConfigPersist(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigPersist(format!("{}: {}", parent.display(), e)))?;
        }

        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| SyncError::ConfigPersist(format!("{}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| SyncError::ConfigPersist(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Apply a persistence intent to the folder list.
    pub fn apply(&mut self, intent: &PersistIntent) {
        match intent {
            PersistIntent::UpsertFolder(folder) => {
                match self.folders.iter_mut().find(|f| f.id == folder.id) {
                    Some(existing) => *existing = folder.clone(),
                    None => self.folders.push(folder.clone()),
                }
            }
            PersistIntent::RemoveFolder(id) => self.folders.retain(|f| &f.id != id),
        }
    }
}

// ============================================================================
// Versioned runtime snapshot
// ============================================================================

/// Immutable view of the runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsSnapshot {
    /// Incremented on every swap.
    pub version: u64,
    pub sync: SyncSettings,
}

/// Holder that hands out the current snapshot and swaps in new ones.
#[derive(Debug)]
pub struct SettingsHandle {
    current: RwLock<Arc<SettingsSnapshot>>,
}

impl SettingsHandle {
    pub fn new(sync: SyncSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(SettingsSnapshot { version: 1, sync })),
        }
    }

    /// The snapshot in effect right now.
    pub fn load(&self) -> Arc<SettingsSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the settings, returning the new snapshot.
    pub fn swap(&self, sync: SyncSettings) -> Arc<SettingsSnapshot> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(SettingsSnapshot {
            version: guard.version + 1,
            sync,
        });
        *guard = next.clone();
        next
    }
}

// ============================================================================
// Persistence port
// ============================================================================

/// A change to the persisted folder list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistIntent {
    UpsertFolder(FolderConfig),
    RemoveFolder(String),
}

/// Narrow port through which folder changes are written back.
pub trait ConfigPersistence: Send + Sync {
    fn persist(&self, intent: PersistIntent) -> Result<()>;
}

/// Persists to a TOML file, rewriting it after every intent.
pub struct TomlConfigStore {
    path: PathBuf,
    config: Mutex<AgentConfig>,
}

impl TomlConfigStore {
    pub fn new(path: PathBuf, config: AgentConfig) -> Self {
        Self {
            path,
            config: Mutex::new(config),
        }
    }

    /// Copy of the configuration as last persisted.
    pub fn snapshot(&self) -> AgentConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConfigPersistence for TomlConfigStore {
    fn persist(&self, intent: PersistIntent) -> Result<()> {
        let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = config.clone();
        next.apply(&intent);
        next.save(&self.path)?;
        *config = next;
        debug!(path = %self.path.display(), ?intent, "Persisted configuration change");
        Ok(())
    }
}

/// Keeps intents in memory. Useful for embedding hosts and tests.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    intents: Mutex<Vec<PersistIntent>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `persist` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn intents(&self) -> Vec<PersistIntent> {
        self.intents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConfigPersistence for MemoryConfigStore {
    fn persist(&self, intent: PersistIntent) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SyncError::ConfigPersist("store is read-only".to_string()));
        }
        self.intents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(intent);
        Ok(())
    }
}
