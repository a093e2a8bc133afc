// Folder management: validation, persistence ordering, watches

use std::path::PathBuf;

use cloudsync::config::PersistIntent;
use cloudsync::error::SyncError;
use cloudsync::sync::{ChangeEvent, ChangeKind};

use crate::common::{agent_config, folder, Harness};

#[tokio::test]
async fn test_add_folder_persists_and_watches() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(Vec::new());
    harness.orchestrator.start().unwrap();

    let added = harness
        .orchestrator
        .add_folder(folder("docs", dir.path()))
        .unwrap();
    assert_eq!(added.id, "docs");
    assert_eq!(harness.orchestrator.folders().len(), 1);
    assert_eq!(harness.watcher.roots(), vec![dir.path().to_path_buf()]);
    assert_eq!(
        harness.store.intents(),
        vec![PersistIntent::UpsertFolder(added.to_config())]
    );

    harness.orchestrator.stop().await;
}

#[test]
fn test_add_folder_generates_missing_id() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(Vec::new());

    let added = harness.orchestrator.add_folder(folder("", dir.path())).unwrap();
    assert!(!added.id.is_empty());
    assert!(added.remote_namespace.is_empty());
    assert!(harness.orchestrator.folder(&added.id).is_some());
}

#[test]
fn test_add_folder_rejects_invalid_paths() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("plain.txt");
    std::fs::write(&file, b"x").unwrap();
    let harness = Harness::new(Vec::new());

    let cases = vec![
        folder("relative", &PathBuf::from("relative/dir")),
        folder("missing", &dir.path().join("missing")),
        folder("file", &file),
        folder("empty", &PathBuf::new()),
    ];
    for case in cases {
        let err = harness.orchestrator.add_folder(case.clone()).unwrap_err();
        assert!(err.is_validation(), "{:?} gave {}", case.local_path, err);
    }

    assert!(harness.orchestrator.folders().is_empty());
    assert!(harness.store.intents().is_empty());
    assert!(harness.watcher.roots().is_empty());
}

#[test]
fn test_duplicate_path_and_id_leave_registry_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let harness = Harness::new(vec![folder("docs", dir.path())]);
    let before = harness.orchestrator.folders();

    let err = harness
        .orchestrator
        .add_folder(folder("again", dir.path()))
        .unwrap_err();
    assert!(err.is_validation());

    let err = harness
        .orchestrator
        .add_folder(folder("docs", other.path()))
        .unwrap_err();
    assert!(err.is_validation());

    assert_eq!(harness.orchestrator.folders(), before);
    assert!(harness.store.intents().is_empty());
}

#[tokio::test]
async fn test_configured_folders_are_validated() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
    let missing = dir.path().join("unplugged");

    let harness = Harness::new(vec![
        folder("docs", dir.path()),
        folder("docs-again", dir.path()),
        folder("docs", &missing),
        folder("drive", &missing),
    ]);

    let ids: Vec<String> = harness
        .orchestrator
        .folders()
        .into_iter()
        .map(|f| f.id)
        .collect();
    assert_eq!(ids, vec!["docs".to_string(), "drive".to_string()]);
    assert!(!harness.orchestrator.folder("drive").unwrap().enabled);
    assert_eq!(harness.orchestrator.health().enabled_folders, 1);

    let report = harness.orchestrator.full_sync().await.unwrap();
    assert_eq!(report.folders, 1);
    assert_eq!(report.queued, 1);

    harness.orchestrator.start().unwrap();
    assert_eq!(harness.watcher.roots(), vec![dir.path().to_path_buf()]);
    harness.orchestrator.stop().await;
    assert!(harness.store.intents().is_empty());
}

#[test]
fn test_persist_failure_leaves_registry_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let extra = tempfile::tempdir().unwrap();
    let harness = Harness::new(vec![folder("docs", dir.path())]);
    harness.store.fail_writes(true);

    let err = harness
        .orchestrator
        .add_folder(folder("extra", extra.path()))
        .unwrap_err();
    assert!(matches!(err, SyncError::ConfigPersist(_)));
    assert!(harness.orchestrator.folder("extra").is_none());

    let err = harness.orchestrator.remove_folder("docs").unwrap_err();
    assert!(matches!(err, SyncError::ConfigPersist(_)));
    assert!(harness.orchestrator.folder("docs").is_some());

    let err = harness.orchestrator.disable_folder("docs").unwrap_err();
    assert!(matches!(err, SyncError::ConfigPersist(_)));
    assert!(harness.orchestrator.folder("docs").unwrap().enabled);
}

#[test]
fn test_unknown_folder_operations() {
    let harness = Harness::new(Vec::new());

    assert!(matches!(
        harness.orchestrator.remove_folder("ghost"),
        Err(SyncError::FolderNotFound(_))
    ));
    assert!(matches!(
        harness.orchestrator.enable_folder("ghost"),
        Err(SyncError::FolderNotFound(_))
    ));
    assert!(matches!(
        harness.orchestrator.disable_folder("ghost"),
        Err(SyncError::FolderNotFound(_))
    ));
    assert!(harness.orchestrator.folder_state("ghost").is_none());
}

#[tokio::test]
async fn test_disabled_folder_is_not_watched_or_uploaded() {
    let active = tempfile::tempdir().unwrap();
    let idle = tempfile::tempdir().unwrap();
    std::fs::write(active.path().join("a.txt"), b"a").unwrap();
    std::fs::write(idle.path().join("b.txt"), b"b").unwrap();

    let mut off = folder("off", idle.path());
    off.enabled = false;
    let harness = Harness::new(vec![folder("on", active.path()), off]);

    // Scan before starting so the queued tasks can be counted.
    let report = harness.orchestrator.full_sync().await.unwrap();
    assert_eq!(report.folders, 1);
    assert_eq!(report.queued, 1);

    // Events under a disabled folder are dropped.
    harness.orchestrator.handle_change_event(&ChangeEvent::new(
        ChangeKind::Modify,
        idle.path().join("b.txt"),
    ));
    assert_eq!(harness.orchestrator.health().queued_uploads, 1);

    let err = harness.orchestrator.sync_now(Some("off")).await.unwrap_err();
    assert!(err.is_validation());

    harness.orchestrator.start().unwrap();
    assert_eq!(harness.watcher.roots(), vec![active.path().to_path_buf()]);
    harness.orchestrator.stop().await;
}

#[tokio::test]
async fn test_enable_disable_toggle_watches() {
    let dir = tempfile::tempdir().unwrap();
    let mut docs = folder("docs", dir.path());
    docs.enabled = false;
    let harness = Harness::new(vec![docs]);
    harness.orchestrator.start().unwrap();
    assert!(harness.watcher.roots().is_empty());

    harness.orchestrator.enable_folder("docs").unwrap();
    assert_eq!(harness.watcher.roots(), vec![dir.path().to_path_buf()]);
    assert!(harness.orchestrator.folder("docs").unwrap().enabled);

    harness.orchestrator.disable_folder("docs").unwrap();
    assert!(harness.watcher.roots().is_empty());
    assert_eq!(harness.store.intents().len(), 2);

    harness.orchestrator.stop().await;
}

#[tokio::test]
async fn test_remove_folder_rewatches_nested_folder() {
    let outer = tempfile::tempdir().unwrap();
    let inner = outer.path().join("inner");
    std::fs::create_dir_all(&inner).unwrap();

    let harness = Harness::new(vec![folder("outer", outer.path()), folder("inner", &inner)]);
    harness.orchestrator.start().unwrap();

    harness.orchestrator.remove_folder("outer").unwrap();
    assert_eq!(harness.watcher.roots(), vec![inner.clone()]);
    assert_eq!(
        harness.store.intents(),
        vec![PersistIntent::RemoveFolder("outer".to_string())]
    );

    harness.orchestrator.stop().await;
}

#[tokio::test]
async fn test_update_folder_moves_watch_and_keeps_history() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let harness = Harness::new(vec![folder("docs", first.path())]);
    harness.orchestrator.start().unwrap();
    harness.orchestrator.full_sync().await.unwrap();
    let synced_at = harness.orchestrator.folder("docs").unwrap().last_sync_at;
    assert!(synced_at.is_some());

    let mut moved = folder("docs", second.path());
    moved.exclude_patterns = vec!["*.log".to_string()];
    let updated = harness.orchestrator.update_folder(moved).unwrap();

    assert_eq!(updated.local_path, second.path());
    assert_eq!(updated.exclude_patterns, vec!["*.log".to_string()]);
    assert_eq!(updated.last_sync_at, synced_at);
    assert_eq!(harness.watcher.roots(), vec![second.path().to_path_buf()]);

    harness.orchestrator.stop().await;
}

#[test]
fn test_reload_diffs_folders_without_persisting() {
    let keep = tempfile::tempdir().unwrap();
    let gone = tempfile::tempdir().unwrap();
    let new = tempfile::tempdir().unwrap();
    let harness = Harness::new(vec![folder("keep", keep.path()), folder("gone", gone.path())]);
    assert_eq!(harness.orchestrator.settings().version, 1);

    let mut next = agent_config(vec![folder("keep", keep.path()), folder("new", new.path())]);
    next.sync.max_concurrency = 8;
    harness.orchestrator.reload(&next).unwrap();

    let ids: Vec<String> = harness
        .orchestrator
        .folders()
        .into_iter()
        .map(|f| f.id)
        .collect();
    assert_eq!(ids, vec!["keep".to_string(), "new".to_string()]);
    assert_eq!(harness.watcher.roots(), vec![new.path().to_path_buf()]);

    let settings = harness.orchestrator.settings();
    assert_eq!(settings.version, 2);
    assert_eq!(settings.sync.max_concurrency, 8);
    assert!(harness.store.intents().is_empty());
}
