use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mirage_daemon::{Daemon, DaemonConfig};
use mirage_index::PinState;
use mirage_sync::{LockOutcome, MemoryRemote, RemoteStore, SchedulerState, SyncConfig};
use tempfile::TempDir;

fn config(dir: &TempDir, watch_local: bool) -> DaemonConfig {
    DaemonConfig {
        sync_root: dir.path().join("root"),
        state_path: dir.path().join("state").join("items.sqlite"),
        watch_debounce: Duration::from_millis(50),
        watch_local,
        watch_remote: true,
        sync: SyncConfig {
            sync_interval: Duration::from_secs(3600),
            remote_poll_interval: Duration::from_millis(50),
            ..SyncConfig::default()
        },
    }
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_start_sync_shutdown() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let shared: Arc<dyn RemoteStore> = remote.clone();
    let daemon = Daemon::new(config(&dir, false), shared);

    std::fs::create_dir_all(dir.path().join("root")).unwrap();
    std::fs::write(dir.path().join("root/hello.txt"), b"hello remote").unwrap();

    daemon.start().await.unwrap();
    assert!(daemon.is_running().await);
    assert!(daemon.start().await.is_err());

    // The first cycle runs right away
    wait_for(|| remote.find("hello.txt").is_some()).await;

    let root = remote.root_id().clone();
    remote.put_file(&root, "from-cloud.txt", b"downloaded").unwrap();
    daemon.sync_now().await.unwrap();
    let local = dir.path().join("root/from-cloud.txt");
    assert!(local.exists());

    daemon
        .set_pin_state(Path::new("from-cloud.txt"), PinState::Pinned)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&local).unwrap(), b"downloaded");

    daemon.shutdown().await.unwrap();
    assert!(!daemon.is_running().await);
    assert_eq!(daemon.scheduler_state().await, SchedulerState::Disabled);
    assert!(daemon.sync_now().await.is_err());
}

#[tokio::test]
async fn test_remote_changes_arrive_between_cycles() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let shared: Arc<dyn RemoteStore> = remote.clone();
    let daemon = Daemon::new(config(&dir, false), shared);
    daemon.start().await.unwrap();
    daemon.sync_now().await.unwrap();

    // Give the poller a moment to take its starting cursor
    tokio::time::sleep(Duration::from_millis(200)).await;
    let root = remote.root_id().clone();
    remote.put_file(&root, "pushed-by-peer.md", b"# hi").unwrap();

    let path = dir.path().join("root/pushed-by-peer.md");
    wait_for(|| path.exists()).await;

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manual_lock_through_daemon() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let shared: Arc<dyn RemoteStore> = remote.clone();
    let daemon = Daemon::new(config(&dir, false), shared);

    std::fs::create_dir_all(dir.path().join("root")).unwrap();
    std::fs::write(dir.path().join("root/contract.docx"), b"terms").unwrap();
    daemon.start().await.unwrap();
    daemon.sync_now().await.unwrap();

    let path = Path::new("contract.docx");
    let outcome = daemon.lock(path).await.unwrap();
    assert!(matches!(outcome, LockOutcome::Acquired(_)));
    let id = remote.find("contract.docx").unwrap().id;
    assert!(remote.metadata(&id).unwrap().lock.is_some());

    daemon.unlock(path).await.unwrap();
    assert!(remote.metadata(&id).unwrap().lock.is_none());

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_local_watcher_pushes_new_file() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let shared: Arc<dyn RemoteStore> = remote.clone();
    let daemon = Daemon::new(config(&dir, true), shared);
    daemon.start().await.unwrap();
    daemon.sync_now().await.unwrap();

    std::fs::write(dir.path().join("root/live.txt"), b"written while running").unwrap();
    wait_for(|| remote.find("live.txt").is_some()).await;

    daemon.shutdown().await.unwrap();
}
