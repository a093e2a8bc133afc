use anyhow::Result;
use async_trait::async_trait;
use opendal::{services::Gcs, Operator};

use crate::config::GcsSettings;
use crate::fs::backend::{ContentReader, ContentWriter, StorageBackend};
use crate::fs::object;
use crate::fs::types::{ObjectMetadata, ProviderKind, RemoteFileInfo};

/// Google Cloud Storage backend using OpenDAL
pub struct GcsFs {
    operator: Operator,
    bucket: String,
}

impl GcsFs {
    /// Create a new GCS backend
    ///
    /// Uses Application Default Credentials if no service account file is
    /// configured (GOOGLE_APPLICATION_CREDENTIALS, gcloud config, metadata
    /// server, Workload Identity).
    pub fn from_settings(settings: &GcsSettings) -> Result<Self> {
        let mut builder = Gcs::default().bucket(&settings.bucket);

        if !settings.credentials_file.is_empty() {
            builder = builder.credential_path(&settings.credentials_file);
        }

        let operator = Operator::new(builder)?.finish();

        Ok(Self {
            operator,
            bucket: settings.bucket.clone(),
        })
    }
}

#[async_trait]
impl StorageBackend for GcsFs {
    async fn upload_file(
        &self,
        key: &str,
        content: ContentReader<'_>,
        metadata: &ObjectMetadata,
    ) -> Result<String> {
        object::upload(&self.operator, key, content, metadata).await
    }

    async fn download_file(
        &self,
        key: &str,
        output: ContentWriter<'_>,
        version_id: Option<&str>,
    ) -> Result<ObjectMetadata> {
        object::download(&self.operator, key, output, version_id).await
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        object::delete(&self.operator, key).await
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<RemoteFileInfo>> {
        object::list(&self.operator, prefix).await
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        object::exists(&self.operator, key).await
    }

    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Gcs
    }

    fn display_key(&self, key: &str) -> String {
        format!("gs://{}/{}", self.bucket, object::clean_key(key))
    }
}
