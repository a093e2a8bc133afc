use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::fs::types::{ObjectMetadata, ProviderKind, RemoteFileInfo};

/// Readable body handed to [`StorageBackend::upload_file`].
pub type ContentReader<'a> = &'a mut (dyn AsyncRead + Send + Unpin);

/// Sink handed to [`StorageBackend::download_file`].
pub type ContentWriter<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// Uniform object-storage contract used by the sync core.
///
/// The returned version id is opaque: an ETag, a generation number, or a
/// content hash depending on the provider. Callers store and pass it back,
/// never interpret it. Uploads overwrite, so retrying one is always safe.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========== Transfer ==========

    /// Store the full body of `content` under `key` and return a version id.
    async fn upload_file(
        &self,
        key: &str,
        content: ContentReader<'_>,
        metadata: &ObjectMetadata,
    ) -> Result<String>;

    /// Write the object at `key` into `output` and return its metadata.
    ///
    /// `version_id` selects a specific version where the provider supports it.
    async fn download_file(
        &self,
        key: &str,
        output: ContentWriter<'_>,
        version_id: Option<&str>,
    ) -> Result<ObjectMetadata>;

    // ========== Management ==========

    async fn delete_file(&self, key: &str) -> Result<()>;

    /// Every object whose key starts with `prefix`, recursively.
    async fn list_files(&self, prefix: &str) -> Result<Vec<RemoteFileInfo>>;

    async fn file_exists(&self, key: &str) -> Result<bool>;

    // ========== Backend Info ==========

    fn provider_kind(&self) -> ProviderKind;

    /// Display form of a key, e.g. `s3://bucket/key`.
    fn display_key(&self, key: &str) -> String {
        key.to_string()
    }
}
