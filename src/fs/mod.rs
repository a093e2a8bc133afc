//! Object storage backends.

pub mod backend;
pub mod gcs;
pub mod local;
pub(crate) mod object;
pub mod s3;
pub mod types;

use std::sync::Arc;

use tracing::info;

use crate::config::{StorageConfig, StorageSelection};
use crate::error::Result;

pub use backend::{ContentReader, ContentWriter, StorageBackend};
pub use gcs::GcsFs;
pub use local::LocalBackend;
pub use s3::S3Fs;
pub use types::*;

/// Build the backend named by `[storage].provider`.
pub fn backend_from_config(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match config.selection()? {
        StorageSelection::S3(settings) => Arc::new(S3Fs::from_settings(&settings)?),
        StorageSelection::Minio(settings) => Arc::new(S3Fs::from_minio(&settings)?),
        StorageSelection::Gcs(settings) => Arc::new(GcsFs::from_settings(&settings)?),
        StorageSelection::Local(settings) => Arc::new(LocalBackend::new(settings.root_dir)),
    };
    info!(provider = %backend.provider_kind(), "Storage backend ready");
    Ok(backend)
}
