//! Incoming reconciliation: remote changes applied to the local tree
//!
//! Only populated folders are walked. Dirty local items are never touched;
//! they are the outgoing side's business.

use mirage_index::{
    ItemState, LockMode, LockRecord, PinState, PlaceholderInfo, PlaceholderSurface, RemoteId,
    COLUMN_LOCK_OWNER,
};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::{SyncContext, WalkReport};
use crate::errors::{ConflictKind, Result, SyncError};
use crate::lock::foreign_record;
use crate::remote::{ItemMetadata, RemoteChange, RemoteChangeKind, RemoteError};

/// Effect of applying one remote item locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Materialized,
    Updated,
    Moved,
    Deleted,
    Hydrated,
    Dehydrated,
    Unchanged,
    /// Local item has unpushed changes
    KeptDirty,
    /// Parent is not visible locally
    OutOfView,
}

impl ApplyOutcome {
    fn count(self, report: &mut WalkReport) {
        match self {
            ApplyOutcome::Materialized => report.materialized += 1,
            ApplyOutcome::Updated => report.updated += 1,
            ApplyOutcome::Moved => report.moved += 1,
            ApplyOutcome::Deleted => report.deleted += 1,
            ApplyOutcome::Hydrated => report.hydrated += 1,
            ApplyOutcome::Dehydrated => report.dehydrated += 1,
            _ => {}
        }
    }
}

pub struct IncomingReconciler {
    ctx: Arc<SyncContext>,
}

impl IncomingReconciler {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    fn local(&self) -> &dyn PlaceholderSurface {
        self.ctx.local.as_ref()
    }

    /// Reconcile `folder` and every populated folder below it
    pub async fn reconcile(&self, folder: &Path) -> Result<WalkReport> {
        let mut report = WalkReport::default();
        let mut queue = VecDeque::from([folder.to_path_buf()]);

        while let Some(current) = queue.pop_front() {
            if self.ctx.stop.is_stopped() {
                break;
            }
            if !self.is_populated(&current).await {
                continue;
            }
            if let Err(e) = self.reconcile_folder(&current, &mut report).await {
                report.record_error(&current, e)?;
                continue;
            }

            let children = match self.local().tracked_children(&current).await {
                Ok(children) => children,
                Err(e) => {
                    report.record_error(&current, e.into())?;
                    continue;
                }
            };
            for child in children {
                if child.is_dir && child.hydrated {
                    queue.push_back(child.path);
                }
            }
        }

        if !report.is_noop() {
            info!(
                "Incoming pass for {:?}: {} new, {} updated, {} moved, {} deleted",
                folder, report.materialized, report.updated, report.moved, report.deleted
            );
        }
        Ok(report)
    }

    async fn is_populated(&self, folder: &Path) -> bool {
        if folder.as_os_str().is_empty() {
            return true;
        }
        match self.local().state(folder).await {
            Ok(state) => state.is_placeholder && state.is_dir && state.hydrated,
            Err(_) => false,
        }
    }

    async fn reconcile_folder(&self, folder: &Path, report: &mut WalkReport) -> Result<()> {
        let Some(folder_id) = self.ctx.folder_remote_id(folder).await? else {
            debug!("{:?} not created remotely yet, skipping", folder);
            return Ok(());
        };
        let children = self
            .ctx
            .remote
            .list_children(&folder_id)
            .await
            .map_err(|e| SyncError::from_remote(e, folder))?;

        let mut present = HashSet::new();
        for meta in &children {
            if self.ctx.stop.is_stopped() {
                return Ok(());
            }
            present.insert(meta.id.clone());
            let path = folder.join(&meta.name);
            match self.apply_item(folder, meta).await {
                Ok(outcome) => {
                    report.note_ok();
                    outcome.count(report);
                }
                Err(e) => report.record_error(&path, e)?,
            }
        }

        for state in self.local().tracked_children(folder).await? {
            if self.ctx.stop.is_stopped() {
                return Ok(());
            }
            let Some(id) = state.remote_id.clone() else {
                continue;
            };
            if state.is_new() || present.contains(&id) || self.ctx.filter.avoid_sync(&state.path)
            {
                continue;
            }
            match self.apply_missing(&state, &id).await {
                Ok(outcome) => {
                    report.note_ok();
                    outcome.count(report);
                }
                Err(e) => report.record_error(&state.path, e)?,
            }
        }

        Ok(())
    }

    /// Apply one remote child of the local `folder`
    async fn apply_item(&self, folder: &Path, meta: &ItemMetadata) -> Result<ApplyOutcome> {
        let target = folder.join(&meta.name);

        let Some(row) = self.ctx.store.find_by_remote_id(&meta.id).await? else {
            return self.materialize(folder, meta).await;
        };

        let mut outcome = ApplyOutcome::Unchanged;
        let mut path = row.path.clone();
        if path != target {
            match self.apply_move(&path, &target).await? {
                ApplyOutcome::Moved => {
                    outcome = ApplyOutcome::Moved;
                    path = target;
                }
                other => return Ok(other),
            }
        }

        match self.apply_update(&path, meta).await? {
            ApplyOutcome::Unchanged => {}
            other => outcome = other,
        }
        match self.apply_hydration_policy(&path).await? {
            ApplyOutcome::Unchanged => {}
            other if outcome == ApplyOutcome::Unchanged => outcome = other,
            _ => {}
        }
        Ok(outcome)
    }

    async fn materialize(&self, folder: &Path, meta: &ItemMetadata) -> Result<ApplyOutcome> {
        let path = folder.join(&meta.name);
        if self.ctx.filter.avoid_sync(&path) {
            return Ok(ApplyOutcome::Unchanged);
        }
        if self.local().exists(&path).await {
            // Name taken by a local item; the outgoing side reports the clash
            debug!("{:?} exists locally, not materializing {}", path, meta.id);
            return Ok(ApplyOutcome::Unchanged);
        }

        let info = placeholder_info(meta, self.lock_for(meta, None));
        self.local().materialize(folder, &info).await?;
        debug!("Materialized {:?} ({} {})", path, meta.id, meta.etag);

        self.apply_hydration_policy(&path).await?;
        Ok(ApplyOutcome::Materialized)
    }

    /// Follow a remote rename/move of a confirmed local item
    async fn apply_move(&self, from: &Path, to: &Path) -> Result<ApplyOutcome> {
        let handle = self.ctx.local.open_exclusive(from).await?;
        let state = self.local().state(from).await?;

        if state.is_moved() || !state.in_sync {
            debug!("{:?} has local changes, not applying remote move", from);
            return Ok(ApplyOutcome::KeptDirty);
        }
        if self.local().exists(to).await {
            debug!("{:?} taken locally, not applying remote move", to);
            return Ok(ApplyOutcome::Unchanged);
        }

        self.local().move_placeholder(&handle, to).await?;
        info!("Applied remote move {:?} -> {:?}", from, to);
        Ok(ApplyOutcome::Moved)
    }

    /// Apply new remote metadata to a confirmed local item
    async fn apply_update(&self, path: &Path, meta: &ItemMetadata) -> Result<ApplyOutcome> {
        let state = self.local().state(path).await?;
        self.sync_foreign_lock(&state, meta).await?;

        if state.etag.as_deref() == Some(meta.etag.as_str()) {
            return Ok(ApplyOutcome::Unchanged);
        }
        if let Some(recorded) = state.remote_modified {
            if meta.modified < recorded {
                debug!(
                    "Ignoring {} for {:?}: older than recorded version",
                    meta.etag, path
                );
                return Ok(ApplyOutcome::Unchanged);
            }
        }
        if !state.in_sync {
            return self.keep_dirty(path, meta).await;
        }

        let handle = self.ctx.local.open_exclusive(path).await?;
        let state = self.local().state(path).await?;
        if !state.in_sync {
            return self.keep_dirty(path, meta).await;
        }

        let info = placeholder_info(meta, self.lock_for(meta, state.lock.as_ref()));
        self.local().update_placeholder(&handle, &info).await?;
        info!(
            "Applied remote update to {:?} ({:?} -> {})",
            path, state.etag, meta.etag
        );
        Ok(ApplyOutcome::Updated)
    }

    /// Both sides changed; local content stays and the item is flagged
    async fn keep_dirty(&self, path: &Path, meta: &ItemMetadata) -> Result<ApplyOutcome> {
        debug!("{:?} dirty, keeping local content over {}", path, meta.etag);
        self.ctx
            .mark_conflict(path, ConflictKind::ServerModified)
            .await?;
        Ok(ApplyOutcome::KeptDirty)
    }

    /// A tracked child vanished from its remote folder: moved away or deleted
    async fn apply_missing(&self, state: &ItemState, id: &RemoteId) -> Result<ApplyOutcome> {
        match self.ctx.remote.get(id).await {
            Ok(meta) => {
                let parent = match &meta.parent_id {
                    Some(parent_id) => self.ctx.local_folder(parent_id).await?,
                    None => None,
                };
                match parent {
                    Some(folder) if self.is_populated(&folder).await => {
                        self.apply_item(&folder, &meta).await
                    }
                    _ => {
                        debug!("{:?} moved out of the local view", state.path);
                        self.remove_local(&state.path).await
                    }
                }
            }
            Err(RemoteError::NotFound(_)) => self.remove_local(&state.path).await,
            Err(e) => Err(SyncError::from_remote(e, &state.path)),
        }
    }

    /// Delete a confirmed local item whose remote counterpart is gone
    async fn remove_local(&self, path: &Path) -> Result<ApplyOutcome> {
        let handle = self.ctx.local.open_exclusive(path).await?;
        let state = match self.local().state(path).await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => {
                self.local().forget(path).await?;
                return Ok(ApplyOutcome::Unchanged);
            }
            Err(e) => return Err(e.into()),
        };

        if state.is_new() || !state.in_sync || state.is_moved() {
            debug!("{:?} has unpushed changes, keeping it", path);
            return Ok(ApplyOutcome::KeptDirty);
        }
        if state.is_dir && !self.subtree_is_clean(path).await? {
            debug!("{:?} contains unpushed changes, keeping it", path);
            return Ok(ApplyOutcome::KeptDirty);
        }

        self.local().remove_placeholder(&handle).await?;
        info!("Applied remote delete of {:?}", path);
        Ok(ApplyOutcome::Deleted)
    }

    /// Every local entry below `folder` is confirmed and unchanged
    async fn subtree_is_clean(&self, folder: &Path) -> Result<bool> {
        let mut queue = VecDeque::from([folder.to_path_buf()]);
        while let Some(current) = queue.pop_front() {
            for entry in self.local().list_local(&current).await? {
                if self.ctx.filter.avoid_sync(&entry.path) {
                    continue;
                }
                let state = self.local().state(&entry.path).await?;
                if !state.is_placeholder || state.is_new() || !state.in_sync || state.is_moved() {
                    return Ok(false);
                }
                if entry.is_dir {
                    queue.push_back(entry.path);
                }
            }
        }
        Ok(true)
    }

    /// Hydrate pinned items, dehydrate unpinned ones
    pub async fn apply_hydration_policy(&self, path: &Path) -> Result<ApplyOutcome> {
        let state = self.local().state(path).await?;
        if !state.is_placeholder {
            return Ok(ApplyOutcome::Unchanged);
        }

        match state.pin_state {
            PinState::Pinned if !state.hydrated => {
                let handle = self.ctx.local.open_exclusive(path).await?;
                let content = if state.is_dir {
                    Vec::new()
                } else {
                    let Some(id) = &state.remote_id else {
                        return Ok(ApplyOutcome::Unchanged);
                    };
                    self.ctx
                        .remote
                        .read(id)
                        .await
                        .map_err(|e| SyncError::from_remote(e, path))?
                };
                self.local().hydrate(&handle, &content).await?;
                debug!("Hydrated pinned {:?}", path);
                Ok(ApplyOutcome::Hydrated)
            }
            PinState::Unpinned if state.hydrated && state.in_sync && !state.is_dir => {
                let handle = self.ctx.local.open_exclusive(path).await?;
                self.local().dehydrate(&handle).await?;
                debug!("Dehydrated unpinned {:?}", path);
                Ok(ApplyOutcome::Dehydrated)
            }
            _ => Ok(ApplyOutcome::Unchanged),
        }
    }

    /// Fetch content of a dehydrated file (or populate a folder) on demand
    pub async fn hydrate(&self, path: &Path) -> Result<()> {
        let state = self.local().state(path).await?;
        if state.hydrated {
            return Ok(());
        }
        let handle = self.ctx.local.open_exclusive(path).await?;
        let content = match (&state.remote_id, state.is_dir) {
            (Some(id), false) => self
                .ctx
                .remote
                .read(id)
                .await
                .map_err(|e| SyncError::from_remote(e, path))?,
            _ => Vec::new(),
        };
        self.local().hydrate(&handle, &content).await?;
        Ok(())
    }

    /// Apply one entry of the remote change feed
    pub async fn apply_change(&self, change: &RemoteChange) -> Result<ApplyOutcome> {
        let meta = &change.item;
        if change.kind == RemoteChangeKind::Deleted {
            return match self.ctx.store.find_by_remote_id(&meta.id).await? {
                Some(row) => self.remove_local(&row.path).await,
                None => Ok(ApplyOutcome::Unchanged),
            };
        }

        let folder = match &meta.parent_id {
            Some(parent_id) => self.ctx.local_folder(parent_id).await?,
            None => return Ok(ApplyOutcome::Unchanged),
        };
        match folder {
            Some(folder) if self.is_populated(&folder).await => {
                self.apply_item(&folder, meta).await
            }
            _ => Ok(ApplyOutcome::OutOfView),
        }
    }

    /// Lock to record for `meta`, keeping our own record when the token matches
    fn lock_for(&self, meta: &ItemMetadata, ours: Option<&LockRecord>) -> Option<LockRecord> {
        let remote = meta.lock.as_ref()?;
        match ours {
            Some(record) if record.token == remote.token => Some(record.clone()),
            _ => Some(foreign_record(remote)),
        }
    }

    /// Mirror a lock held by someone else into the side data
    async fn sync_foreign_lock(&self, state: &ItemState, meta: &ItemMetadata) -> Result<()> {
        let ours = state
            .lock
            .as_ref()
            .filter(|record| record.mode != LockMode::None);
        if ours.is_some() {
            return Ok(());
        }

        let wanted = self.lock_for(meta, None);
        if wanted == state.lock {
            return Ok(());
        }
        self.ctx.store.set_lock(&state.path, wanted.as_ref()).await?;
        self.ctx
            .store
            .set_column(
                &state.path,
                COLUMN_LOCK_OWNER,
                wanted.as_ref().map(|record| record.owner.as_str()),
            )
            .await?;
        Ok(())
    }
}

fn placeholder_info(meta: &ItemMetadata, lock: Option<LockRecord>) -> PlaceholderInfo {
    PlaceholderInfo {
        name: meta.name.clone(),
        is_dir: meta.is_dir,
        remote_id: meta.id.clone(),
        etag: meta.etag.clone(),
        size: meta.size,
        modified: meta.modified,
        lock,
    }
}
