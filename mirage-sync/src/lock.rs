//! Lock manager
//!
//! Per item: `Unlocked -> Locking -> Locked(mode) -> Unlocking -> Unlocked`.
//! Every transition happens while holding the item's lock token, so at most
//! one caller talks to the remote lock API for a given item at a time.

use chrono::Utc;
use mirage_index::{
    path_key, ItemGuard, ItemLocks, ItemStore, LockMode, LockRecord, RemoteId, COLUMN_LOCK_OWNER,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::{Result, SyncError};
use crate::remote::{RemoteError, RemoteLock, RemoteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locking,
    Locked(LockMode),
    Unlocking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// A new remote lock was taken
    Acquired(LockRecord),
    /// An unexpired lock was already recorded
    Reused(LockRecord),
    /// Another operation holds the item's token; try later
    Busy,
    /// The remote reports a lock owned by someone else
    HeldElsewhere(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    Released,
    AlreadyUnlocked,
    Busy,
}

/// Held per-item lock token
#[derive(Debug)]
pub struct LockToken {
    guard: ItemGuard,
}

impl LockToken {
    pub fn path(&self) -> &Path {
        self.guard.path()
    }
}

/// Lock taken (or found) around a content push
#[derive(Debug, Clone, Default)]
pub struct AutoLock {
    pub record: Option<LockRecord>,
    /// Whether this push took the lock and must release it
    pub acquired: bool,
}

pub struct LockManager {
    store: ItemStore,
    remote: Arc<dyn RemoteStore>,
    tokens: ItemLocks,
    states: Mutex<HashMap<String, LockState>>,
    acquire_timeout: Duration,
    owner: String,
    auto_lock: bool,
}

impl LockManager {
    pub fn new(
        store: ItemStore,
        remote: Arc<dyn RemoteStore>,
        acquire_timeout: Duration,
        owner: impl Into<String>,
        auto_lock: bool,
    ) -> Self {
        Self {
            store,
            remote,
            tokens: ItemLocks::new(),
            states: Mutex::new(HashMap::new()),
            acquire_timeout,
            owner: owner.into(),
            auto_lock,
        }
    }

    fn set_state(&self, path: &Path, state: LockState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if state == LockState::Unlocked {
            states.remove(&path_key(path));
        } else {
            states.insert(path_key(path), state);
        }
    }

    /// Current lock state, falling back to the persisted record
    pub async fn state(&self, path: &Path) -> Result<LockState> {
        let cached = {
            let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            states.get(&path_key(path)).copied()
        };
        if let Some(state) = cached {
            return Ok(state);
        }

        let record = self.store.get_side_data(path).await?.lock;
        Ok(match record {
            Some(record) if record.mode != LockMode::None && !record.is_expired(Utc::now()) => {
                LockState::Locked(record.mode)
            }
            _ => LockState::Unlocked,
        })
    }

    /// Wait (bounded) for the item's token; `None` means busy
    pub async fn token(&self, path: &Path) -> Result<Option<LockToken>> {
        match self.tokens.acquire(path, self.acquire_timeout).await {
            Ok(guard) => Ok(Some(LockToken { guard })),
            Err(mirage_index::IndexError::ItemBusy(_)) => {
                debug!("Lock token for {:?} busy, deferring", path);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remote_id(&self, path: &Path) -> Result<RemoteId> {
        self.store
            .get_item(path)
            .await?
            .and_then(|row| row.remote_id)
            .ok_or_else(|| SyncError::NotFound(path.to_path_buf()))
    }

    pub async fn lock(&self, path: &Path, mode: LockMode) -> Result<LockOutcome> {
        match self.token(path).await? {
            Some(token) => self.lock_with(&token, mode).await,
            None => Ok(LockOutcome::Busy),
        }
    }

    pub async fn unlock(&self, path: &Path) -> Result<UnlockOutcome> {
        match self.token(path).await? {
            Some(token) => self.unlock_with(&token).await,
            None => Ok(UnlockOutcome::Busy),
        }
    }

    /// Lock while already holding the token
    pub async fn lock_with(&self, token: &LockToken, mode: LockMode) -> Result<LockOutcome> {
        let path = token.path();

        if let Some(existing) = self.store.get_side_data(path).await?.lock {
            if !existing.is_expired(Utc::now()) {
                if existing.mode == LockMode::None {
                    debug!("{:?} is locked by {}", path, existing.owner);
                    return Ok(LockOutcome::HeldElsewhere(existing.owner));
                }
                self.set_state(path, LockState::Locked(existing.mode));
                return Ok(LockOutcome::Reused(existing));
            }
            debug!("Recorded lock on {:?} expired, requesting a new one", path);
        }

        let id = self.remote_id(path).await?;
        self.set_state(path, LockState::Locking);

        match self.remote.lock(&id, true, &self.owner).await {
            Ok(remote_lock) => {
                let record = to_record(remote_lock, mode);
                if let Err(e) = self.persist(path, Some(&record)).await {
                    self.release_unrecorded(path, &id, &record.token).await;
                    self.set_state(path, LockState::Unlocked);
                    return Err(e);
                }
                self.set_state(path, LockState::Locked(mode));
                info!("Locked {:?} ({:?})", path, mode);
                Ok(LockOutcome::Acquired(record))
            }
            Err(RemoteError::Locked(owner)) => {
                self.set_state(path, LockState::Unlocked);
                debug!("{:?} is locked by {}", path, owner);
                Ok(LockOutcome::HeldElsewhere(owner))
            }
            Err(e) => {
                self.persist(path, None).await?;
                self.set_state(path, LockState::Unlocked);
                Err(SyncError::from_remote(e, path))
            }
        }
    }

    /// Unlock while already holding the token
    pub async fn unlock_with(&self, token: &LockToken) -> Result<UnlockOutcome> {
        let path = token.path();

        let Some(record) = self.store.get_side_data(path).await?.lock else {
            self.set_state(path, LockState::Unlocked);
            return Ok(UnlockOutcome::AlreadyUnlocked);
        };
        if record.mode == LockMode::None {
            // Someone else's lock; only they can release it
            self.set_state(path, LockState::Unlocked);
            return Ok(UnlockOutcome::AlreadyUnlocked);
        }
        let id = self.remote_id(path).await?;
        self.set_state(path, LockState::Unlocking);

        match self.remote.unlock(&id, &record.token).await {
            Ok(()) | Err(RemoteError::NotLocked(_)) | Err(RemoteError::NotFound(_)) => {}
            Err(e) => {
                self.set_state(path, LockState::Locked(record.mode));
                return Err(SyncError::from_remote(e, path));
            }
        }

        self.persist(path, None).await?;
        self.set_state(path, LockState::Unlocked);
        info!("Unlocked {:?}", path);
        Ok(UnlockOutcome::Released)
    }

    /// Take an `Auto` lock for a content push when none is recorded
    pub async fn begin_auto(&self, token: &LockToken) -> Result<AutoLock> {
        let path = token.path();
        let existing = self
            .store
            .get_side_data(path)
            .await?
            .lock
            .filter(|record| !record.is_expired(Utc::now()));

        if existing.is_some() || !self.auto_lock {
            return Ok(AutoLock {
                record: existing,
                acquired: false,
            });
        }

        match self.lock_with(token, LockMode::Auto).await {
            Ok(LockOutcome::Acquired(record)) => Ok(AutoLock {
                record: Some(record),
                acquired: true,
            }),
            Ok(LockOutcome::Reused(record)) => Ok(AutoLock {
                record: Some(record),
                acquired: false,
            }),
            Ok(LockOutcome::Busy) | Ok(LockOutcome::HeldElsewhere(_)) => Ok(AutoLock::default()),
            Err(e) => {
                // The push itself reports a real lock conflict
                debug!("Auto-lock for {:?} failed: {}", path, e);
                Ok(AutoLock::default())
            }
        }
    }

    /// Release a lock taken by [`begin_auto`](Self::begin_auto); manual locks stay
    pub async fn end_auto(&self, token: &LockToken, auto: &AutoLock) -> Result<()> {
        let Some(record) = &auto.record else {
            return Ok(());
        };
        if !auto.acquired || record.mode != LockMode::Auto {
            return Ok(());
        }
        if let Err(e) = self.unlock_with(token).await {
            warn!("Failed to release auto-lock on {:?}: {}", token.path(), e);
            return Err(e);
        }
        Ok(())
    }

    /// Give back a remote lock whose token could not be stored
    async fn release_unrecorded(&self, path: &Path, id: &RemoteId, token: &str) {
        if let Err(e) = self.remote.unlock(id, token).await {
            warn!(
                "Failed to release remote lock on {:?} after a store error: {}",
                path, e
            );
        }
    }

    async fn persist(&self, path: &Path, record: Option<&LockRecord>) -> Result<()> {
        self.store.set_lock(path, record).await?;
        self.store
            .set_column(path, COLUMN_LOCK_OWNER, record.map(|r| r.owner.as_str()))
            .await?;
        Ok(())
    }
}

fn to_record(lock: RemoteLock, mode: LockMode) -> LockRecord {
    LockRecord {
        token: lock.token,
        owner: lock.owner,
        exclusive: lock.exclusive,
        expires_at: lock.expires_at,
        mode,
    }
}

/// Record of a lock reported by the remote, attributed to someone else
pub fn foreign_record(lock: &RemoteLock) -> LockRecord {
    to_record(lock.clone(), LockMode::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRemote, RemoteOp};
    use mirage_index::ItemRow;
    use std::path::PathBuf;
    use tracing_test::traced_test;

    async fn setup(delay: Option<Duration>) -> (Arc<MemoryRemote>, ItemStore, LockManager) {
        let mut remote = MemoryRemote::new();
        if let Some(delay) = delay {
            remote = remote.with_delay(delay);
        }
        let remote = Arc::new(remote);
        let meta = remote
            .put_file(&remote.root_id().clone(), "doc.docx", b"x")
            .unwrap();

        let store = ItemStore::open_in_memory().unwrap();
        let mut row = ItemRow::untracked("doc.docx", false);
        row.remote_id = Some(meta.id.clone());
        row.in_sync = true;
        row.original_path = Some(PathBuf::from("doc.docx"));
        store.upsert_item(&row).await.unwrap();
        store
            .set_etag(Path::new("doc.docx"), Some("v1"), None)
            .await
            .unwrap();

        let manager = LockManager::new(
            store.clone(),
            remote.clone(),
            Duration::from_millis(50),
            "alice",
            true,
        );
        (remote, store, manager)
    }

    #[tokio::test]
    async fn test_lock_unlock_cycle() {
        let (remote, store, manager) = setup(None).await;
        let path = Path::new("doc.docx");

        let outcome = manager.lock(path, LockMode::Manual).await.unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(ref r) if r.owner == "alice"));
        assert_eq!(
            manager.state(path).await.unwrap(),
            LockState::Locked(LockMode::Manual)
        );
        let state = store.get(path).await.unwrap().unwrap();
        assert_eq!(
            state.columns.get(COLUMN_LOCK_OWNER).map(String::as_str),
            Some("alice")
        );

        // Second lock reuses the record without a remote call
        assert!(matches!(
            manager.lock(path, LockMode::Manual).await.unwrap(),
            LockOutcome::Reused(_)
        ));
        assert_eq!(remote.calls().lock, 1);

        assert_eq!(manager.unlock(path).await.unwrap(), UnlockOutcome::Released);
        assert_eq!(manager.state(path).await.unwrap(), LockState::Unlocked);
        let state = store.get(path).await.unwrap().unwrap();
        assert!(state.lock.is_none());
        assert!(!state.columns.contains_key(COLUMN_LOCK_OWNER));

        assert_eq!(
            manager.unlock(path).await.unwrap(),
            UnlockOutcome::AlreadyUnlocked
        );
    }

    #[tokio::test]
    async fn test_remote_failure_rolls_back() {
        let (remote, store, manager) = setup(None).await;
        let path = Path::new("doc.docx");
        remote.fail_next(RemoteOp::Lock, RemoteError::Unavailable("down".into()));

        let err = manager.lock(path, LockMode::Manual).await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteUnavailable(_)));
        let state = store.get(path).await.unwrap().unwrap();
        assert!(state.lock.is_none());
        assert!(state.columns.is_empty());
        assert_eq!(manager.state(path).await.unwrap(), LockState::Unlocked);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_rollback_is_logged() {
        let (remote, store, manager) = setup(None).await;
        let path = Path::new("doc.docx");
        let id = store.get_item(path).await.unwrap().unwrap().remote_id.unwrap();
        remote.fail_next(RemoteOp::Unlock, RemoteError::Unavailable("down".into()));

        manager.release_unrecorded(path, &id, "lock-1").await;
        assert_eq!(remote.calls().unlock, 1);
        assert!(logs_contain("Failed to release remote lock"));
    }

    #[tokio::test]
    async fn test_unlock_already_released_remotely() {
        let (remote, store, manager) = setup(None).await;
        let path = Path::new("doc.docx");
        let LockOutcome::Acquired(record) = manager.lock(path, LockMode::Manual).await.unwrap()
        else {
            panic!("expected a fresh lock");
        };
        let id = store.get_item(path).await.unwrap().unwrap().remote_id.unwrap();
        remote.unlock(&id, &record.token).await.unwrap();

        assert_eq!(manager.unlock(path).await.unwrap(), UnlockOutcome::Released);
        assert!(store.get(path).await.unwrap().unwrap().lock.is_none());
    }

    #[tokio::test]
    async fn test_foreign_lock_is_left_alone() {
        let (remote, store, manager) = setup(None).await;
        let path = Path::new("doc.docx");
        let id = store.get_item(path).await.unwrap().unwrap().remote_id.unwrap();
        let bobs = remote.lock(&id, true, "bob").await.unwrap();
        store
            .set_lock(path, Some(&foreign_record(&bobs)))
            .await
            .unwrap();
        remote.reset_calls();

        assert_eq!(manager.state(path).await.unwrap(), LockState::Unlocked);
        assert_eq!(
            manager.lock(path, LockMode::Manual).await.unwrap(),
            LockOutcome::HeldElsewhere("bob".into())
        );
        assert_eq!(
            manager.unlock(path).await.unwrap(),
            UnlockOutcome::AlreadyUnlocked
        );

        assert_eq!(remote.calls().lock, 0);
        assert_eq!(remote.calls().unlock, 0);
        assert_eq!(remote.metadata(&id).unwrap().lock, Some(bobs.clone()));
        let record = store.get(path).await.unwrap().unwrap().lock.unwrap();
        assert_eq!(record.owner, "bob");
        assert_eq!(record.mode, LockMode::None);
    }

    #[tokio::test]
    async fn test_unmirrored_foreign_lock_reported() {
        let (remote, store, manager) = setup(None).await;
        let path = Path::new("doc.docx");
        let id = store.get_item(path).await.unwrap().unwrap().remote_id.unwrap();
        remote.lock(&id, true, "bob").await.unwrap();

        assert_eq!(
            manager.lock(path, LockMode::Manual).await.unwrap(),
            LockOutcome::HeldElsewhere("bob".into())
        );
        assert_eq!(manager.state(path).await.unwrap(), LockState::Unlocked);
        assert_eq!(remote.metadata(&id).unwrap().lock.unwrap().owner, "bob");
    }

    #[tokio::test]
    async fn test_concurrent_lock_calls_take_one_remote_lock() {
        let (remote, _store, manager) = setup(Some(Duration::from_millis(100))).await;
        let manager = Arc::new(manager);
        let path = Path::new("doc.docx");

        let (a, b) = tokio::join!(
            manager.lock(path, LockMode::Manual),
            manager.lock(path, LockMode::Manual)
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(remote.calls().lock, 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, LockOutcome::Acquired(_)))
                .count(),
            1
        );
        assert!(outcomes.iter().any(|o| matches!(o, LockOutcome::Busy)));
    }

    #[tokio::test]
    async fn test_auto_lock_never_releases_manual() {
        let (remote, _store, manager) = setup(None).await;
        let path = Path::new("doc.docx");
        manager.lock(path, LockMode::Manual).await.unwrap();

        let token = manager.token(path).await.unwrap().unwrap();
        let auto = manager.begin_auto(&token).await.unwrap();
        assert!(!auto.acquired);
        manager.end_auto(&token, &auto).await.unwrap();
        drop(token);

        assert_eq!(remote.calls().unlock, 0);
        assert_eq!(
            manager.state(path).await.unwrap(),
            LockState::Locked(LockMode::Manual)
        );
    }

    #[tokio::test]
    async fn test_auto_lock_round_trip() {
        let (remote, _store, manager) = setup(None).await;
        let path = Path::new("doc.docx");

        let token = manager.token(path).await.unwrap().unwrap();
        let auto = manager.begin_auto(&token).await.unwrap();
        assert!(auto.acquired);
        assert_eq!(auto.record.as_ref().unwrap().mode, LockMode::Auto);
        manager.end_auto(&token, &auto).await.unwrap();

        assert_eq!(remote.calls().lock, 1);
        assert_eq!(remote.calls().unlock, 1);
        assert_eq!(manager.state(path).await.unwrap(), LockState::Unlocked);
    }
}
