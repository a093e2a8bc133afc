use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-object metadata as written on upload and returned on download.
pub type ObjectMetadata = HashMap<String, String>;

/// Metadata keys the upload pipeline always writes.
pub mod meta_keys {
    pub const CONTENT_TYPE: &str = "content_type";
    pub const HASH_SHA256: &str = "hash_sha256";
    pub const SIZE: &str = "size";
    pub const MODIFIED_TIME: &str = "modified_time";
    pub const FOLDER_ID: &str = "folder_id";
    pub const SOURCE_FOLDER: &str = "source_folder";
    pub const UPLOAD_TIME: &str = "upload_time";
}

/// Storage provider family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    S3,
    Gcs,
    Minio,
    Local,
}

impl ProviderKind {
    /// Short display name.
    pub fn short_name(&self) -> &'static str {
        match self {
            ProviderKind::S3 => "S3",
            ProviderKind::Gcs => "GCS",
            ProviderKind::Minio => "MinIO",
            ProviderKind::Local => "Local",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// An object as reported by `list_files`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
}

impl RemoteFileInfo {
    /// Human-readable size, as shown in logs.
    pub fn format_size(&self) -> String {
        let size = self.size;
        if size < 1024 {
            format!("{} B", size)
        } else if size < 1024 * 1024 {
            format!("{:.1} KB", size as f64 / 1024.0)
        } else if size < 1024 * 1024 * 1024 {
            format!("{:.1} MB", size as f64 / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB", size as f64 / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

/// Join a namespace and a relative path into an object key.
///
/// Always uses `/`, strips stray leading/trailing separators, and yields the
/// bare relative path when the namespace is empty.
pub fn object_key(namespace: &str, relative: &str) -> String {
    let namespace = namespace.trim_matches('/');
    let relative = relative.replace('\\', "/");
    let relative = relative.trim_start_matches('/');
    if namespace.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", namespace, relative)
    }
}
