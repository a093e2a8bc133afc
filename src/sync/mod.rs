//! Sync core
//!
//! Change detection, the upload pipeline, the folder table and the
//! orchestrator that ties them to a storage backend.

pub mod exclude;
pub mod hash;
pub mod orchestrator;
pub mod registry;
pub mod throttle;
pub mod uploader;
pub mod watcher;

pub use exclude::PathMatcher;
pub use hash::{hash_bytes, hash_reader, FileHash};
pub use orchestrator::{
    HealthSnapshot, StatusChange, StatusHandler, SyncOrchestrator, SyncReport, SyncState,
    PART_SUFFIX,
};
pub use registry::{FolderDefinition, FolderRegistry, FolderState, FolderStats, FolderStatus};
pub use throttle::{BandwidthLimit, ThrottledReader};
pub use uploader::{PipelineConfig, UploadPipeline, UploadResult, UploadTask, QUEUE_CAPACITY};
pub use watcher::{ChangeEvent, ChangeKind, ChangeWatcher, EventHandler, NotifyWatcher};
