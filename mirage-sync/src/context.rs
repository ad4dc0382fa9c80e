//! Shared handles used by the reconcilers and monitors

use mirage_index::{
    ItemStore, PatternFilter, PlaceholderSurface, RemoteId, SyncFilter, COLUMN_CONFLICT,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::echo::EchoSet;
use crate::errors::{ConflictKind, Result, SyncError};
use crate::lock::LockManager;
use crate::remote::RemoteStore;

/// Cooperative stop request checked between items
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything one engine instance shares between its components
pub struct SyncContext {
    pub config: SyncConfig,
    pub store: ItemStore,
    pub local: Arc<dyn PlaceholderSurface>,
    pub remote: Arc<dyn RemoteStore>,
    pub locks: Arc<LockManager>,
    pub filter: Arc<dyn SyncFilter>,
    pub echoes: EchoSet,
    pub stop: StopFlag,
}

impl SyncContext {
    /// Wire up a context with a pattern filter and lock manager from `config`
    pub fn new(
        config: SyncConfig,
        store: ItemStore,
        local: Arc<dyn PlaceholderSurface>,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let locks = Arc::new(LockManager::new(
            store.clone(),
            remote.clone(),
            config.lock_acquire_timeout,
            config.lock_owner.clone(),
            config.auto_lock,
        ));
        let filter = Arc::new(PatternFilter::new(config.filter_patterns.clone()));
        let echoes = EchoSet::new(config.echo_ttl);

        Ok(Arc::new(Self {
            config,
            store,
            local,
            remote,
            locks,
            filter,
            echoes,
            stop: StopFlag::new(),
        }))
    }

    /// Remote id of a local folder; the sync root maps to the configured root
    pub async fn folder_remote_id(&self, folder: &Path) -> Result<Option<RemoteId>> {
        if folder.as_os_str().is_empty() {
            return Ok(Some(self.config.remote_root()));
        }
        Ok(self
            .store
            .get_item(folder)
            .await?
            .and_then(|row| row.remote_id))
    }

    /// Local folder a remote id maps to
    pub async fn local_folder(&self, id: &RemoteId) -> Result<Option<std::path::PathBuf>> {
        if *id == self.config.remote_root() {
            return Ok(Some(std::path::PathBuf::new()));
        }
        Ok(self
            .store
            .find_by_remote_id(id)
            .await?
            .filter(|row| row.is_dir)
            .map(|row| row.path))
    }

    pub async fn mark_conflict(&self, path: &Path, kind: ConflictKind) -> Result<()> {
        self.store
            .set_column(path, COLUMN_CONFLICT, Some(&kind.to_string()))
            .await?;
        Ok(())
    }

    pub async fn clear_conflict(&self, path: &Path) -> Result<()> {
        self.store.set_column(path, COLUMN_CONFLICT, None).await?;
        Ok(())
    }
}

/// Consecutive unreachable-remote failures after which a walk gives up
pub const UNAVAILABLE_STREAK_LIMIT: usize = 5;

/// Counters for one reconciliation walk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkReport {
    pub converted: usize,
    pub created: usize,
    pub updated: usize,
    pub moved: usize,
    pub deleted: usize,
    pub materialized: usize,
    pub hydrated: usize,
    pub dehydrated: usize,
    pub conflicts: usize,
    pub busy: usize,
    pub failed: usize,
    unavailable_streak: usize,
}

impl WalkReport {
    /// Nothing local or remote was changed
    pub fn is_noop(&self) -> bool {
        self.converted == 0
            && self.created == 0
            && self.updated == 0
            && self.moved == 0
            && self.deleted == 0
            && self.materialized == 0
            && self.hydrated == 0
            && self.dehydrated == 0
    }

    pub fn merge(&mut self, other: &WalkReport) {
        self.converted += other.converted;
        self.created += other.created;
        self.updated += other.updated;
        self.moved += other.moved;
        self.deleted += other.deleted;
        self.materialized += other.materialized;
        self.hydrated += other.hydrated;
        self.dehydrated += other.dehydrated;
        self.conflicts += other.conflicts;
        self.busy += other.busy;
        self.failed += other.failed;
    }

    /// An item went through; breaks a run of unreachable-remote failures
    pub fn note_ok(&mut self) {
        self.unavailable_streak = 0;
    }

    /// Log a per-item failure and decide whether the walk may continue
    ///
    /// Every failure is counted against its item. The walk is aborted only
    /// after [`UNAVAILABLE_STREAK_LIMIT`] unreachable-remote failures in a row.
    pub fn record_error(&mut self, path: &Path, err: SyncError) -> Result<()> {
        if let SyncError::RemoteUnavailable(reason) = &err {
            warn!("Remote unavailable while syncing {:?}: {}", path, reason);
            self.failed += 1;
            self.unavailable_streak += 1;
            if self.unavailable_streak >= UNAVAILABLE_STREAK_LIMIT {
                return Err(err);
            }
            return Ok(());
        }
        self.unavailable_streak = 0;
        match &err {
            e if e.is_benign() => debug!("{:?} vanished during sync: {}", path, e),
            e if e.is_busy() => {
                debug!("{:?} busy, deferring: {}", path, e);
                self.busy += 1;
            }
            SyncError::Conflict(kind, _) => {
                warn!("Conflict on {:?}: {}", path, kind);
                self.conflicts += 1;
            }
            e => {
                warn!("Failed to sync {:?}: {}", path, e);
                self.failed += 1;
            }
        }
        Ok(())
    }
}
