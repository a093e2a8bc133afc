use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::fs::backend::{ContentReader, ContentWriter, StorageBackend};
use crate::fs::types::{ObjectMetadata, ProviderKind, RemoteFileInfo};
use crate::sync::hash::hash_bytes;

/// Directory under the root that holds per-object metadata sidecars.
pub const META_DIR: &str = ".cloudsync";

/// Sidecar written next to every stored object.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Sidecar {
    version: String,
    metadata: ObjectMetadata,
}

/// Object store backed by a directory on local disk.
///
/// Keys map to paths under `root`. Metadata lives in
/// `root/.cloudsync/<key>.meta` as JSON, and the version of an object is the
/// SHA-256 of its content. Hidden entries are never listed.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.root
            .join(META_DIR)
            .join(format!("{}.meta", key.trim_start_matches('/')))
    }

    async fn read_sidecar(&self, key: &str) -> Sidecar {
        match tokio::fs::read(self.sidecar_path(key)).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => Sidecar::default(),
        }
    }
}

/// Write `data` to a hidden temp file beside `dest`, then rename it into place.
async fn write_atomic(dest: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dest.with_file_name(format!(".{}.tmp", name));

    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("Failed to write temp file: {}", tmp.display()))?;
    tokio::fs::rename(&tmp, dest)
        .await
        .with_context(|| format!("Failed to rename {} to {}", tmp.display(), dest.display()))?;
    Ok(())
}

fn remove_if_exists(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Walk `dir` and collect every visible file as `(key, size, modified)`.
fn walk_objects(root: &Path, dir: &Path) -> Result<Vec<(String, u64, DateTime<Utc>)>> {
    let mut found = Vec::new();

    let walker = jwalk::WalkDir::new(dir)
        .skip_hidden(true)
        .parallelism(jwalk::Parallelism::Serial);

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let metadata = entry.metadata()?;
        let rel = path.strip_prefix(root).unwrap_or(&path);
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        found.push((key, metadata.len(), modified));
    }

    Ok(found)
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn upload_file(
        &self,
        key: &str,
        content: ContentReader<'_>,
        metadata: &ObjectMetadata,
    ) -> Result<String> {
        let mut body = Vec::new();
        content
            .read_to_end(&mut body)
            .await
            .context("Failed to read upload body")?;

        let version = hash_bytes(&body);
        write_atomic(&self.object_path(key), &body).await?;

        let sidecar = Sidecar {
            version: version.clone(),
            metadata: metadata.clone(),
        };
        let raw = serde_json::to_vec_pretty(&sidecar).context("Failed to encode metadata")?;
        write_atomic(&self.sidecar_path(key), &raw).await?;

        debug!(key, version = %version, bytes = body.len(), "Stored local object");
        Ok(version)
    }

    async fn download_file(
        &self,
        key: &str,
        output: ContentWriter<'_>,
        version_id: Option<&str>,
    ) -> Result<ObjectMetadata> {
        let path = self.object_path(key);
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read object: {}", path.display()))?;

        let sidecar = self.read_sidecar(key).await;
        if let Some(wanted) = version_id.filter(|v| !v.is_empty()) {
            if wanted != sidecar.version {
                debug!(key, wanted, current = %sidecar.version, "Local store keeps only the latest version");
            }
        }

        output
            .write_all(&data)
            .await
            .context("Failed to write downloaded content")?;
        output.flush().await?;

        Ok(sidecar.metadata)
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        let path = self.object_path(key);
        remove_if_exists(tokio::fs::remove_file(&path).await)
            .with_context(|| format!("Failed to delete object: {}", path.display()))?;
        remove_if_exists(tokio::fs::remove_file(self.sidecar_path(key)).await)
            .context("Failed to delete object metadata")?;
        Ok(())
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<RemoteFileInfo>> {
        let dir = self.object_path(prefix.trim_end_matches('/'));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let root = self.root.clone();
        let objects = tokio::task::spawn_blocking(move || walk_objects(&root, &dir))
            .await
            .context("Listing task failed")??;

        let mut result = Vec::with_capacity(objects.len());
        for (key, size, last_modified) in objects {
            let etag = self.read_sidecar(&key).await.version;
            result.push(RemoteFileInfo {
                key,
                size,
                last_modified,
                etag,
            });
        }

        result.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(result)
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(self.object_path(key))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn display_key(&self, key: &str) -> String {
        self.object_path(key).to_string_lossy().to_string()
    }
}
