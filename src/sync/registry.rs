//! In-memory table of sync folders.
//!
//! The registry owns folder definitions and their runtime state. It is not
//! synchronized itself: the orchestrator keeps it behind its single
//! reader/writer lock together with the global statistics.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::FolderConfig;
use crate::error::{Result, SyncError};
use crate::sync::exclude::PathMatcher;

/// A configured local-directory-to-namespace sync unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderDefinition {
    pub id: String,
    pub local_path: PathBuf,
    pub remote_namespace: String,
    pub exclude_patterns: Vec<String>,
    pub enabled: bool,
    pub two_way_sync: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl From<&FolderConfig> for FolderDefinition {
    fn from(config: &FolderConfig) -> Self {
        Self {
            id: config.id.clone(),
            local_path: config.local_path.clone(),
            remote_namespace: config.remote_namespace.clone(),
            exclude_patterns: config.exclude_patterns.clone(),
            enabled: config.enabled,
            two_way_sync: config.two_way_sync,
            last_sync_at: None,
        }
    }
}

impl FolderDefinition {
    /// The persisted form of this definition.
    pub fn to_config(&self) -> FolderConfig {
        FolderConfig {
            id: self.id.clone(),
            local_path: self.local_path.clone(),
            remote_namespace: self.remote_namespace.clone(),
            exclude_patterns: self.exclude_patterns.clone(),
            enabled: self.enabled,
            two_way_sync: self.two_way_sync,
        }
    }

    /// Same folder, ignoring runtime-only fields.
    pub fn same_settings(&self, other: &FolderDefinition) -> bool {
        self.to_config() == other.to_config()
    }
}

/// Per-folder activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderStatus {
    #[default]
    Idle,
    Syncing,
}

/// Cumulative transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FolderStats {
    pub files_uploaded: u64,
    pub bytes_uploaded: u64,
    pub files_downloaded: u64,
    pub bytes_downloaded: u64,
    pub errors: u64,
}

/// Runtime state of one folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FolderState {
    pub folder_id: String,
    pub status: FolderStatus,
    pub stats: FolderStats,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Check that `path` can serve as a folder root.
pub fn validate_local_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(SyncError::Validation("local path is empty".to_string()));
    }
    if !path.is_absolute() {
        return Err(SyncError::Validation(format!(
            "local path must be absolute: {}",
            path.display()
        )));
    }
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(SyncError::Validation(format!(
            "local path is not a directory: {}",
            path.display()
        ))),
        Err(_) => Err(SyncError::Validation(format!(
            "local path does not exist: {}",
            path.display()
        ))),
    }
}

#[derive(Debug, Clone)]
struct Entry {
    definition: FolderDefinition,
    matcher: PathMatcher,
    state: FolderState,
}

impl Entry {
    fn new(definition: FolderDefinition) -> Self {
        let state = FolderState {
            folder_id: definition.id.clone(),
            last_sync_at: definition.last_sync_at,
            ..FolderState::default()
        };
        Self {
            matcher: PathMatcher::new(&definition.exclude_patterns),
            definition,
            state,
        }
    }
}

/// Folder table keyed by id.
#[derive(Debug, Clone, Default)]
pub struct FolderRegistry {
    folders: BTreeMap<String, Entry>,
}

impl FolderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.folders.contains_key(id)
    }

    /// Validate `definition` as a new folder, or as the replacement for `replacing`.
    pub fn check(&self, definition: &FolderDefinition, replacing: Option<&str>) -> Result<()> {
        if definition.id.trim().is_empty() {
            return Err(SyncError::Validation("folder id is empty".to_string()));
        }
        if replacing.is_none() && self.contains(&definition.id) {
            return Err(SyncError::Validation(format!(
                "folder id already exists: {}",
                definition.id
            )));
        }
        if definition.enabled || replacing.is_none() {
            validate_local_path(&definition.local_path)?;
        }

        if let Some(other) = self.path_owner(&definition.local_path, &definition.id) {
            return Err(SyncError::Validation(format!(
                "local path {} is already used by folder {}",
                definition.local_path.display(),
                other.id
            )));
        }
        Ok(())
    }

    /// Another folder rooted exactly at `path`.
    fn path_owner(&self, path: &Path, id: &str) -> Option<&FolderDefinition> {
        self.folders
            .values()
            .map(|entry| &entry.definition)
            .find(|def| def.id != id && def.local_path == path)
    }

    /// Add a folder read from configuration.
    ///
    /// An empty, duplicate id or a root already used by another folder is
    /// rejected. A root that is missing or not a directory keeps the folder
    /// in the table but disabled, so it can be re-enabled once the path
    /// exists again.
    pub fn admit(&mut self, mut definition: FolderDefinition) -> Result<FolderDefinition> {
        if let Err(e) = self.check(&definition, None) {
            let conflict = definition.id.trim().is_empty()
                || self.contains(&definition.id)
                || self.path_owner(&definition.local_path, &definition.id).is_some();
            if conflict {
                return Err(e);
            }
            definition.enabled = false;
        }
        self.insert_unchecked(definition.clone());
        Ok(definition)
    }

    /// Add a folder after validating it.
    pub fn insert(&mut self, definition: FolderDefinition) -> Result<()> {
        self.check(&definition, None)?;
        self.folders
            .insert(definition.id.clone(), Entry::new(definition));
        Ok(())
    }

    /// Add a folder that has already been validated or came from configuration.
    pub fn insert_unchecked(&mut self, definition: FolderDefinition) {
        self.folders
            .insert(definition.id.clone(), Entry::new(definition));
    }

    /// Replace the definition of an existing folder, keeping its stats.
    pub fn replace(&mut self, definition: FolderDefinition) -> Result<FolderDefinition> {
        self.check(&definition, Some(&definition.id))?;
        let entry = self
            .folders
            .get_mut(&definition.id)
            .ok_or_else(|| SyncError::FolderNotFound(definition.id.clone()))?;

        let previous = entry.definition.clone();
        entry.matcher = PathMatcher::new(&definition.exclude_patterns);
        entry.definition = FolderDefinition {
            last_sync_at: previous.last_sync_at,
            ..definition
        };
        Ok(previous)
    }

    pub fn remove(&mut self, id: &str) -> Result<FolderDefinition> {
        self.folders
            .remove(id)
            .map(|entry| entry.definition)
            .ok_or_else(|| SyncError::FolderNotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<&FolderDefinition> {
        self.folders.get(id).map(|entry| &entry.definition)
    }

    pub fn matcher(&self, id: &str) -> Option<&PathMatcher> {
        self.folders.get(id).map(|entry| &entry.matcher)
    }

    /// All definitions, ordered by id.
    pub fn definitions(&self) -> impl Iterator<Item = &FolderDefinition> {
        self.folders.values().map(|entry| &entry.definition)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &FolderDefinition> {
        self.definitions().filter(|def| def.enabled)
    }

    /// The enabled folder whose root contains `path` (longest root wins).
    pub fn owner_of(&self, path: &Path) -> Option<(&FolderDefinition, &PathMatcher)> {
        self.folders
            .values()
            .filter(|entry| entry.definition.enabled && path.starts_with(&entry.definition.local_path))
            .max_by_key(|entry| entry.definition.local_path.components().count())
            .map(|entry| (&entry.definition, &entry.matcher))
    }

    pub fn state(&self, id: &str) -> Option<&FolderState> {
        self.folders.get(id).map(|entry| &entry.state)
    }

    pub fn state_mut(&mut self, id: &str) -> Option<&mut FolderState> {
        self.folders.get_mut(id).map(|entry| &mut entry.state)
    }

    pub fn states(&self) -> Vec<FolderState> {
        self.folders.values().map(|entry| entry.state.clone()).collect()
    }

    /// Record the end of a sync pass on a folder.
    pub fn mark_synced(&mut self, id: &str, at: DateTime<Utc>, error: Option<String>) {
        if let Some(entry) = self.folders.get_mut(id) {
            entry.state.status = FolderStatus::Idle;
            entry.state.last_error = error;
            entry.state.last_sync_at = Some(at);
            entry.definition.last_sync_at = Some(at);
        }
    }
}
