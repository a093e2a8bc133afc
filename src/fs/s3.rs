use anyhow::Result;
use async_trait::async_trait;
use opendal::{services::S3, Operator};

use crate::config::{MinioSettings, S3Settings};
use crate::fs::backend::{ContentReader, ContentWriter, StorageBackend};
use crate::fs::object;
use crate::fs::types::{ObjectMetadata, ProviderKind, RemoteFileInfo};

/// S3 and S3-compatible storage backend using OpenDAL
pub struct S3Fs {
    operator: Operator,
    bucket: String,
    kind: ProviderKind,
}

impl S3Fs {
    /// Create a backend from `[storage.s3]` settings.
    ///
    /// Empty credentials fall back to the standard AWS chain (environment,
    /// shared credentials file, instance profile).
    pub fn from_settings(settings: &S3Settings) -> Result<Self> {
        let region = if settings.region.is_empty() {
            "us-east-1"
        } else {
            settings.region.as_str()
        };

        let mut builder = S3::default().bucket(&settings.bucket).region(region);

        if !settings.endpoint.is_empty() {
            builder = builder.endpoint(&settings.endpoint);
        }
        if !settings.access_key.is_empty() {
            builder = builder
                .access_key_id(&settings.access_key)
                .secret_access_key(&settings.secret_key);
        }

        let operator = Operator::new(builder)?.finish();

        Ok(Self {
            operator,
            bucket: settings.bucket.clone(),
            kind: ProviderKind::S3,
        })
    }

    /// Create a backend for MinIO from `[storage.minio]` settings.
    pub fn from_minio(settings: &MinioSettings) -> Result<Self> {
        let builder = S3::default()
            .bucket(&settings.bucket)
            .region(&settings.region)
            .endpoint(&settings.endpoint_url())
            .access_key_id(&settings.access_key)
            .secret_access_key(&settings.secret_key);

        let operator = Operator::new(builder)?.finish();

        Ok(Self {
            operator,
            bucket: settings.bucket.clone(),
            kind: ProviderKind::Minio,
        })
    }
}

#[async_trait]
impl StorageBackend for S3Fs {
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
        self.kind
    }

    fn display_key(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, object::clean_key(key))
    }
}
