// Two-way reconciliation: downloads, mtimes, feedback suppression

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{TimeZone, Utc};

use cloudsync::config::MemoryConfigStore;
use cloudsync::fs::LocalBackend;
use cloudsync::sync::{ChangeEvent, ChangeKind, SyncOrchestrator, SyncState};

use crate::common::{
    agent_config, fast_pipeline, folder, mtime, set_mtime, wait_for, Harness, ManualWatcher,
};

#[tokio::test]
async fn test_remote_changes_are_downloaded_with_remote_mtime() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let remote_time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    // Older than remote: replaced.
    std::fs::write(root.join("stale.txt"), b"old").unwrap();
    set_mtime(&root.join("stale.txt"), Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    // Newer than remote: kept.
    std::fs::write(root.join("fresh.txt"), b"local edit").unwrap();

    let mut docs = folder("docs", root);
    docs.remote_namespace = "docs".to_string();
    docs.two_way_sync = true;
    docs.exclude_patterns = vec!["*.tmp".to_string()];
    let harness = Harness::new(vec![docs]);

    harness.backend.put_remote("docs/new/deep.txt", b"from remote", remote_time);
    harness.backend.put_remote("docs/stale.txt", b"new", remote_time);
    harness.backend.put_remote("docs/fresh.txt", b"remote edit", remote_time);
    harness.backend.put_remote("docs/skip.tmp", b"scratch", remote_time);
    harness.backend.put_remote("other/elsewhere.txt", b"x", remote_time);

    let report = harness.orchestrator.full_sync().await.unwrap();
    assert_eq!(report.downloaded, 2);
    assert_eq!(report.errors, 0);

    let created = root.join("new/deep.txt");
    assert_eq!(std::fs::read(&created).unwrap(), b"from remote");
    assert_eq!(mtime(&created), SystemTime::from(remote_time));

    assert_eq!(std::fs::read(root.join("stale.txt")).unwrap(), b"new");
    assert_eq!(mtime(&root.join("stale.txt")), SystemTime::from(remote_time));

    assert_eq!(std::fs::read(root.join("fresh.txt")).unwrap(), b"local edit");
    assert!(!root.join("skip.tmp").exists());
    assert!(!root.join("elsewhere.txt").exists());
    assert!(!root.join("new/deep.txt.cloudsync-part").exists());

    let health = harness.orchestrator.health();
    assert_eq!(health.files_downloaded, 2);
    assert_eq!(health.bytes_downloaded, ("from remote".len() + "new".len()) as u64);
    let state = harness.orchestrator.folder_state("docs").unwrap();
    assert_eq!(state.stats.files_downloaded, 2);
}

#[tokio::test]
async fn test_older_identical_copy_is_refreshed_from_remote() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("same.txt");
    std::fs::write(&file, b"hi").unwrap();
    set_mtime(&file, Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
    let remote_time = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

    let mut docs = folder("docs", dir.path());
    docs.two_way_sync = true;
    let harness = Harness::new(vec![docs]);
    harness.backend.put_remote("same.txt", b"hi", remote_time);

    let report = harness.orchestrator.full_sync().await.unwrap();
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.queued, 0);
    assert_eq!(std::fs::read(&file).unwrap(), b"hi");
    assert_eq!(mtime(&file), SystemTime::from(remote_time));
}

#[tokio::test]
async fn test_running_pipeline_never_overwrites_newer_remote() {
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join("stale.txt");
    std::fs::write(&stale, b"old").unwrap();
    set_mtime(&stale, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    std::fs::write(dir.path().join("local.txt"), b"only here").unwrap();

    let mut docs = folder("docs", dir.path());
    docs.two_way_sync = true;
    let harness = Harness::new(vec![docs]);
    let remote_time = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    harness.backend.put_remote("stale.txt", b"new", remote_time);

    harness.orchestrator.start().unwrap();
    let report = harness.orchestrator.full_sync().await.unwrap();
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.queued, 1);

    let backend = harness.backend.clone();
    assert!(wait_for(Duration::from_secs(5), || backend.object("local.txt").is_some()).await);
    harness.orchestrator.stop().await;

    assert_eq!(std::fs::read(&stale).unwrap(), b"new");
    assert_eq!(harness.backend.object("stale.txt").unwrap().data, b"new");
    assert_eq!(harness.orchestrator.health().files_uploaded, 1);
}

#[tokio::test]
async fn test_remote_keys_cannot_escape_the_folder() {
    let parent = tempfile::tempdir().unwrap();
    let root = parent.path().join("folder");
    std::fs::create_dir(&root).unwrap();

    let mut docs = folder("docs", &root);
    docs.remote_namespace = "docs".to_string();
    docs.two_way_sync = true;
    let harness = Harness::new(vec![docs]);
    let remote_time = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    harness.backend.put_remote("docs/../escaped.txt", b"x", remote_time);
    harness.backend.put_remote("docs/sub/../../up.txt", b"x", remote_time);
    harness.backend.put_remote("docs/inside.txt", b"ok", remote_time);

    let report = harness.orchestrator.full_sync().await.unwrap();

    assert_eq!(report.downloaded, 1);
    assert_eq!(report.errors, 0);
    assert!(root.join("inside.txt").exists());
    assert!(!parent.path().join("escaped.txt").exists());
    assert!(!parent.path().join("up.txt").exists());
}

#[tokio::test]
async fn test_failed_download_leaves_no_staging_file_or_upload() {
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join("stale.txt");
    std::fs::write(&stale, b"old").unwrap();
    set_mtime(&stale, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

    let mut docs = folder("docs", dir.path());
    docs.two_way_sync = true;
    let harness = Harness::new(vec![docs]);
    let remote_time = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    harness.backend.put_remote("stale.txt", b"newer content", remote_time);
    harness.backend.put_remote("fresh.txt", b"remote only", remote_time);
    harness.backend.fail_downloads(true);

    let report = harness.orchestrator.full_sync().await.unwrap();

    assert_eq!(report.downloaded, 0);
    assert_eq!(report.errors, 2);
    assert_eq!(report.queued, 0);
    assert_eq!(std::fs::read(&stale).unwrap(), b"old");
    assert!(!dir.path().join("stale.txt.cloudsync-part").exists());
    assert!(!dir.path().join("fresh.txt.cloudsync-part").exists());
    assert!(!dir.path().join("fresh.txt").exists());
    let state = harness.orchestrator.folder_state("docs").unwrap();
    assert_eq!(state.stats.errors, 2);
}

#[tokio::test]
async fn test_downloaded_file_events_do_not_reupload() {
    let dir = tempfile::tempdir().unwrap();
    let mut docs = folder("docs", dir.path());
    docs.two_way_sync = true;
    let harness = Harness::new(vec![docs]);
    let remote_time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    harness.backend.put_remote("pulled.txt", b"remote", remote_time);

    harness.orchestrator.full_sync().await.unwrap();
    let pulled = dir.path().join("pulled.txt");
    assert!(pulled.exists());
    let queued = harness.orchestrator.health().queued_uploads;

    harness
        .orchestrator
        .handle_change_event(&ChangeEvent::new(ChangeKind::Create, pulled.clone()));
    assert_eq!(harness.orchestrator.health().queued_uploads, queued);

    // A real local edit afterwards is uploaded again.
    std::fs::write(&pulled, b"edited locally").unwrap();
    set_mtime(&pulled, Utc::now());
    harness
        .orchestrator
        .handle_change_event(&ChangeEvent::new(ChangeKind::Modify, pulled));
    assert_eq!(harness.orchestrator.health().queued_uploads, queued + 1);
}

#[tokio::test]
async fn test_listing_failure_of_every_folder_enters_error_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut docs = folder("docs", dir.path());
    docs.two_way_sync = true;
    let harness = Harness::new(vec![docs]);
    harness.backend.fail_list(true);

    let report = harness.orchestrator.full_sync().await.unwrap();
    assert_eq!(report.failed_folders, 1);
    assert_eq!(harness.orchestrator.state(), SyncState::Error);
    let state = harness.orchestrator.folder_state("docs").unwrap();
    assert!(state.last_error.unwrap().contains("listing unavailable"));

    harness.backend.fail_list(false);
    harness.orchestrator.full_sync().await.unwrap();
    assert_eq!(harness.orchestrator.state(), SyncState::Idle);
}

#[tokio::test]
async fn test_one_failing_folder_does_not_abort_siblings() {
    let good = tempfile::tempdir().unwrap();
    let bad = tempfile::tempdir().unwrap();
    std::fs::write(good.path().join("a.txt"), b"a").unwrap();

    let mut two_way = folder("bad", bad.path());
    two_way.two_way_sync = true;
    let harness = Harness::new(vec![folder("good", good.path()), two_way]);
    harness.backend.fail_list(true);

    let report = harness.orchestrator.full_sync().await.unwrap();
    assert_eq!(report.folders, 2);
    assert_eq!(report.failed_folders, 1);
    assert_eq!(report.queued, 1);
    assert_eq!(harness.orchestrator.state(), SyncState::Idle);
}

#[tokio::test]
async fn test_round_trip_through_local_backend() {
    let bucket = tempfile::tempdir().unwrap();
    let laptop = tempfile::tempdir().unwrap();
    let desktop = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(laptop.path().join("notes")).unwrap();
    std::fs::write(laptop.path().join("notes/todo.md"), b"- ship it").unwrap();

    let backend = Arc::new(LocalBackend::new(bucket.path().to_path_buf()));
    let orchestrator = |config| {
        SyncOrchestrator::with_pipeline_config(
            &agent_config(vec![config]),
            backend.clone(),
            ManualWatcher::new(),
            Arc::new(MemoryConfigStore::new()),
            fast_pipeline(),
        )
    };

    let mut source = folder("laptop", laptop.path());
    source.remote_namespace = "shared".to_string();
    let uploader = orchestrator(source);
    uploader.start().unwrap();
    uploader.full_sync().await.unwrap();
    assert!(wait_for(Duration::from_secs(5), || uploader.health().files_uploaded == 1).await);
    uploader.stop().await;

    let mut mirror = folder("desktop", desktop.path());
    mirror.remote_namespace = "shared".to_string();
    mirror.two_way_sync = true;
    let downloader = orchestrator(mirror);
    let report = downloader.full_sync().await.unwrap();

    assert_eq!(report.downloaded, 1);
    assert_eq!(
        std::fs::read(desktop.path().join("notes/todo.md")).unwrap(),
        b"- ship it"
    );
}
