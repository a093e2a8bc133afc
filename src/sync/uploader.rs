//! Concurrent upload pipeline.
//!
//! A bounded queue feeds a fixed pool of workers. Each worker hashes the
//! file, rewinds, streams it through a [`ThrottledReader`] into the storage
//! backend and publishes one terminal [`UploadResult`] per task. Failed
//! attempts are retried with exponential backoff until the attempt ceiling
//! is reached.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::AsyncSeekExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::SyncSettings;
use crate::error::{Result, SyncError};
use crate::fs::backend::StorageBackend;
use crate::fs::types::{meta_keys, ObjectMetadata};
use crate::sync::hash::hash_reader;
use crate::sync::throttle::{BandwidthLimit, ThrottledReader};

/// Fixed capacity of the task queue.
pub const QUEUE_CAPACITY: usize = 1000;

/// Attempts per task, the first one included.
pub const MAX_ATTEMPTS: u32 = 3;

/// Upload pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of workers.
    pub max_concurrency: usize,
    /// Per-stream read cap.
    pub throttle: BandwidthLimit,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub retry_base: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            throttle: BandwidthLimit::unlimited(),
            queue_capacity: QUEUE_CAPACITY,
            max_attempts: MAX_ATTEMPTS,
            retry_base: Duration::from_secs(1),
        }
    }
}

impl From<&SyncSettings> for PipelineConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency.max(1),
            throttle: BandwidthLimit::new(settings.throttle_bytes_per_second),
            ..Self::default()
        }
    }
}

impl PipelineConfig {
    /// Backoff before re-running a task that has already been retried `retry_count` times.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        self.retry_base * 2u32.saturating_pow(retry_count)
    }
}

/// A file waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub file_path: PathBuf,
    /// Object key, always `/`-separated.
    pub storage_key: String,
    pub folder_id: String,
    pub priority: i32,
    /// Extra metadata; overrides the standard fields on conflict.
    pub metadata: ObjectMetadata,
    pub retry_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl UploadTask {
    pub fn new(file_path: PathBuf, storage_key: String, folder_id: String) -> Self {
        Self {
            file_path,
            storage_key,
            folder_id,
            priority: 1,
            metadata: ObjectMetadata::new(),
            retry_count: 0,
            last_attempt: None,
        }
    }

    pub fn with_metadata(mut self, metadata: ObjectMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Terminal outcome of a task.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub task: UploadTask,
    pub success: bool,
    pub error: Option<String>,
    /// Backend-opaque version id; empty on failure.
    pub version_id: String,
    pub content_hash: String,
    pub size: u64,
}

impl UploadResult {
    fn failed(task: UploadTask, reason: String) -> Self {
        Self {
            task,
            success: false,
            error: Some(reason),
            version_id: String::new(),
            content_hash: String::new(),
            size: 0,
        }
    }
}

/// Content type guessed from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "zip" => "application/zip",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => "application/octet-stream",
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a successful attempt produced.
struct Uploaded {
    version_id: String,
    content_hash: String,
    size: u64,
}

/// Everything a worker or retry timer needs.
#[derive(Clone)]
struct Worker {
    backend: Arc<dyn StorageBackend>,
    config: PipelineConfig,
    queue: mpsc::WeakSender<UploadTask>,
    results: mpsc::UnboundedSender<UploadResult>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Worker {
    async fn run(self, id: usize, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<UploadTask>>>) {
        debug!(worker = id, "Upload worker started");
        loop {
            let next = {
                let mut rx = receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    task = rx.recv() => task,
                }
            };
            let Some(task) = next else {
                break;
            };
            self.process(task).await;
        }
        debug!(worker = id, "Upload worker exited");
    }

    async fn process(&self, mut task: UploadTask) {
        task.last_attempt = Some(Utc::now());

        match self.attempt(&task).await {
            Ok(done) => {
                info!(
                    key = %task.storage_key,
                    priority = task.priority,
                    version = %done.version_id,
                    bytes = done.size,
                    "Uploaded file"
                );
                self.publish(UploadResult {
                    task,
                    success: true,
                    error: None,
                    version_id: done.version_id,
                    content_hash: done.content_hash,
                    size: done.size,
                });
            }
            Err(e) => self.retry_or_fail(task, e.to_string()),
        }
    }

    async fn attempt(&self, task: &UploadTask) -> Result<Uploaded> {
        let mut file = tokio::fs::File::open(&task.file_path).await?;
        let hash = hash_reader(&mut file).await?;
        file.seek(SeekFrom::Start(0)).await?;

        let modified = file
            .metadata()
            .await?
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let mut metadata = ObjectMetadata::new();
        metadata.insert(
            meta_keys::CONTENT_TYPE.to_string(),
            content_type_for(&task.file_path).to_string(),
        );
        metadata.insert(meta_keys::HASH_SHA256.to_string(), hash.value.clone());
        metadata.insert(meta_keys::SIZE.to_string(), hash.size.to_string());
        metadata.insert(
            meta_keys::MODIFIED_TIME.to_string(),
            modified.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        metadata.extend(task.metadata.clone());

        let mut reader = ThrottledReader::new(file, self.config.throttle);
        let version_id = self
            .backend
            .upload_file(&task.storage_key, &mut reader, &metadata)
            .await
            .map_err(|e| SyncError::Upload {
                key: task.storage_key.clone(),
                reason: format!("{:#}", e),
            })?;

        Ok(Uploaded {
            version_id,
            content_hash: hash.value,
            size: hash.size,
        })
    }

    fn retry_or_fail(&self, mut task: UploadTask, reason: String) {
        let attempts = task.retry_count + 1;
        if attempts >= self.config.max_attempts {
            error!(key = %task.storage_key, attempts, error = %reason, "Upload failed permanently");
            self.publish(UploadResult::failed(task, reason));
            return;
        }
        if self.cancel.is_cancelled() {
            self.publish(UploadResult::failed(task, format!("pipeline stopped: {}", reason)));
            return;
        }

        let delay = self.config.backoff(task.retry_count);
        task.retry_count += 1;
        warn!(
            key = %task.storage_key,
            retry = task.retry_count,
            backoff_ms = delay.as_millis() as u64,
            error = %reason,
            "Upload failed, retry scheduled"
        );

        let worker = self.clone();
        self.tracker.spawn(async move {
            worker.requeue_after(task, delay, reason).await;
        });
    }

    async fn requeue_after(&self, task: UploadTask, delay: Duration, reason: String) {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.publish(UploadResult::failed(task, format!("pipeline stopped before retry: {}", reason)));
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(queue) = self.queue.upgrade() else {
            self.publish(UploadResult::failed(task, format!("pipeline stopped before retry: {}", reason)));
            return;
        };

        // Wait for a free slot without giving up the task.
        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.publish(UploadResult::failed(task, format!("pipeline stopped before retry: {}", reason)));
            }
            permit = queue.reserve() => match permit {
                Ok(permit) => {
                    debug!(key = %task.storage_key, retry = task.retry_count, "Retry re-queued");
                    permit.send(task);
                }
                Err(_) => {
                    self.publish(UploadResult::failed(task, format!("queue closed before retry: {}", reason)));
                }
            },
        }
    }

    fn publish(&self, result: UploadResult) {
        // A dropped consumer is not an error for the pipeline.
        let _ = self.results.send(result);
    }
}

/// Bounded queue + fixed worker pool in front of a [`StorageBackend`].
pub struct UploadPipeline {
    config: PipelineConfig,
    backend: Arc<dyn StorageBackend>,
    sender: Mutex<Option<mpsc::Sender<UploadTask>>>,
    weak_sender: mpsc::WeakSender<UploadTask>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<UploadTask>>>,
    results_tx: Mutex<Option<mpsc::UnboundedSender<UploadResult>>>,
    results_rx: Mutex<Option<mpsc::UnboundedReceiver<UploadResult>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl UploadPipeline {
    pub fn new(backend: Arc<dyn StorageBackend>, config: PipelineConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        Self {
            weak_sender: sender.downgrade(),
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            results_tx: Mutex::new(Some(results_tx)),
            results_rx: Mutex::new(Some(results_rx)),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            config,
            backend,
        }
    }

    /// Enqueue without waiting. Fails with `QueueFull` when at capacity.
    pub fn queue_upload(&self, task: UploadTask) -> Result<()> {
        let guard = lock(&self.sender);
        let sender = guard
            .as_ref()
            .ok_or(SyncError::NotRunning("upload pipeline"))?;

        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SyncError::QueueFull {
                capacity: self.config.queue_capacity,
            }),
            Err(TrySendError::Closed(_)) => Err(SyncError::NotRunning("upload pipeline")),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        lock(&self.sender)
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0)
    }

    /// Hand out the result stream. Only the first caller gets it.
    pub fn take_results(&self) -> Option<mpsc::UnboundedReceiver<UploadResult>> {
        lock(&self.results_rx).take()
    }

    /// Spawn the worker pool. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        let results = lock(&self.results_tx)
            .clone()
            .ok_or(SyncError::NotRunning("upload pipeline"))?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let worker = Worker {
            backend: self.backend.clone(),
            config: self.config.clone(),
            queue: self.weak_sender.clone(),
            results,
            cancel: self.cancel.clone(),
            tracker: self.tracker.clone(),
        };

        for id in 0..self.config.max_concurrency.max(1) {
            self.tracker
                .spawn(worker.clone().run(id, self.receiver.clone()));
        }

        info!(
            workers = self.config.max_concurrency.max(1),
            throttle = %self.config.throttle.display(),
            "Upload pipeline started"
        );
        Ok(())
    }

    /// Stop accepting tasks, let running uploads finish, then close the result stream.
    ///
    /// Tasks still queued or waiting on a retry get a terminal failure result.
    pub async fn stop(&self) {
        let sender = lock(&self.sender).take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let results = lock(&self.results_tx).take();
        if let Some(results) = results {
            let mut receiver = self.receiver.lock().await;
            let mut abandoned = 0usize;
            while let Ok(task) = receiver.try_recv() {
                abandoned += 1;
                let _ = results.send(UploadResult::failed(
                    task,
                    "upload pipeline stopped".to_string(),
                ));
            }
            if abandoned > 0 {
                warn!(tasks = abandoned, "Queued uploads abandoned at shutdown");
            }
        }

        info!("Upload pipeline stopped");
    }
}
