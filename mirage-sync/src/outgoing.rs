//! Outgoing reconciliation: local changes pushed to the remote
//!
//! A walk runs three passes over populated folders, parents first:
//!
//! 1. move pass: track untracked entries and push local moves, so every row
//!    is keyed by its current path before anything else happens
//! 2. delete pass: confirmed rows whose local entry is gone are deleted remotely
//! 3. create/update pass: new items are created, dirty items pushed

use mirage_index::{ItemState, LockMode, PlaceholderSurface};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::{SyncContext, WalkReport};
use crate::echo::EchoKind;
use crate::errors::{ConflictKind, Result, SyncError};
use crate::remote::{NewItem, RemoteError};

/// Result of pushing one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Created,
    Updated,
    Moved,
    Deleted,
    /// Nothing to push
    Unchanged,
    /// Parent folder has no remote identity yet
    Deferred,
    /// Item token held elsewhere
    Busy,
}

pub struct OutgoingReconciler {
    ctx: Arc<SyncContext>,
}

impl OutgoingReconciler {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    fn local(&self) -> &dyn PlaceholderSurface {
        self.ctx.local.as_ref()
    }

    fn skip(&self, path: &Path) -> bool {
        self.ctx.filter.avoid_sync(path)
    }

    /// Reconcile `folder` and everything populated below it
    pub async fn reconcile(&self, folder: &Path) -> Result<WalkReport> {
        let mut report = WalkReport::default();

        let visited = self.move_pass(folder, &mut report).await?;
        if !self.ctx.stop.is_stopped() {
            self.delete_pass(&visited, &mut report).await?;
        }
        if !self.ctx.stop.is_stopped() {
            self.create_update_pass(folder, &mut report).await?;
        }

        if !report.is_noop() {
            info!(
                "Outgoing pass for {:?}: {} created, {} updated, {} moved, {} deleted",
                folder, report.created, report.updated, report.moved, report.deleted
            );
        }
        Ok(report)
    }

    /// Breadth-first over populated folders; returns the folders visited
    async fn move_pass(&self, folder: &Path, report: &mut WalkReport) -> Result<Vec<PathBuf>> {
        let mut visited = Vec::new();
        let mut queue = VecDeque::from([folder.to_path_buf()]);

        while let Some(current) = queue.pop_front() {
            let entries = match self.local().list_local(&current).await {
                Ok(entries) => entries,
                Err(e) => {
                    report.record_error(&current, e.into())?;
                    continue;
                }
            };
            visited.push(current);

            for entry in entries {
                if self.ctx.stop.is_stopped() {
                    return Ok(visited);
                }
                if self.skip(&entry.path) {
                    continue;
                }

                match self.track_and_move(&entry.path, report).await {
                    Ok(state) => {
                        report.note_ok();
                        if state.is_dir && state.hydrated {
                            queue.push_back(entry.path);
                        }
                    }
                    Err(e) => report.record_error(&entry.path, e)?,
                }
            }
        }

        Ok(visited)
    }

    /// Move-pass step for one entry, returning its state afterwards
    async fn track_and_move(&self, path: &Path, report: &mut WalkReport) -> Result<ItemState> {
        let mut state = self.local().state(path).await?;
        if !state.is_placeholder {
            state = self.local().convert_to_placeholder(path).await?;
            report.converted += 1;
            debug!("Tracking new local item {:?}", path);
        }

        if state.is_moved() {
            if state.is_new() {
                // Never pushed, so there is nothing to move remotely
                self.ctx.store.set_original_path(path, Some(path)).await?;
            } else if self.push_move(path).await? == PushOutcome::Moved {
                report.moved += 1;
            }
        } else if state.original_path.is_none() {
            self.ctx.store.set_original_path(path, Some(path)).await?;
        }

        self.local().state(path).await.map_err(Into::into)
    }

    /// Push a local move of the item now at `path`
    ///
    /// Used by the move pass and by the local change monitor for renames.
    pub async fn push_move(&self, path: &Path) -> Result<PushOutcome> {
        let _handle = self.ctx.local.open_exclusive(path).await?;
        let state = self.local().state(path).await?;
        if !state.is_moved() {
            return Ok(PushOutcome::Unchanged);
        }
        let original = state.original_path.clone().unwrap_or_else(|| path.to_path_buf());
        if state.is_new() {
            self.ctx.store.set_original_path(path, Some(path)).await?;
            return Ok(PushOutcome::Unchanged);
        }

        let Some(id) = state.remote_id.clone() else {
            return Ok(PushOutcome::Unchanged);
        };
        let parent = path.parent().unwrap_or(Path::new(""));
        let Some(parent_id) = self.ctx.folder_remote_id(parent).await? else {
            debug!("Parent of {:?} not created remotely yet, deferring move", path);
            return Ok(PushOutcome::Deferred);
        };
        let name = file_name(path);

        self.ctx.echoes.expect(&id, EchoKind::Moved);
        if let Err(e) = self.ctx.remote.move_to(&id, &parent_id, &name).await {
            self.ctx.echoes.take(&id, &EchoKind::Moved);
            return Err(SyncError::from_remote(e, path));
        }

        // in_sync stays whatever the local content dictates
        self.ctx.store.set_original_path(path, Some(path)).await?;
        self.ctx
            .store
            .rebase_original_paths(&original, path)
            .await?;

        info!("Pushed move {:?} -> {:?}", original, path);
        Ok(PushOutcome::Moved)
    }

    /// Rows under visited folders whose local entry disappeared
    async fn delete_pass(&self, folders: &[PathBuf], report: &mut WalkReport) -> Result<()> {
        for folder in folders {
            let tracked = match self.local().tracked_children(folder).await {
                Ok(tracked) => tracked,
                Err(e) => {
                    report.record_error(folder, e.into())?;
                    continue;
                }
            };

            for state in tracked {
                if self.ctx.stop.is_stopped() {
                    return Ok(());
                }
                if self.skip(&state.path) || self.local().exists(&state.path).await {
                    continue;
                }
                match self.push_delete(&state.path).await {
                    Ok(outcome) => {
                        report.note_ok();
                        if outcome == PushOutcome::Deleted {
                            report.deleted += 1;
                        }
                    }
                    Err(e) => report.record_error(&state.path, e)?,
                }
            }
        }
        Ok(())
    }

    /// Propagate a local deletion of a tracked item
    pub async fn push_delete(&self, path: &Path) -> Result<PushOutcome> {
        let _handle = self.ctx.local.open_exclusive(path).await?;
        if self.local().exists(path).await {
            return Ok(PushOutcome::Unchanged);
        }
        let Some(state) = self.ctx.store.get(path).await? else {
            return Ok(PushOutcome::Unchanged);
        };

        if !state.in_sync || state.is_new() {
            // Unconfirmed local state only; the remote copy stays
            debug!("Dropping tracking for unpushed {:?}", path);
            self.local().forget(path).await?;
            return Ok(PushOutcome::Unchanged);
        }

        if let Some(id) = &state.remote_id {
            self.ctx.echoes.expect(id, EchoKind::Deleted);
            match self.ctx.remote.delete(id).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => {}
                Err(e) => {
                    self.ctx.echoes.take(id, &EchoKind::Deleted);
                    return Err(SyncError::from_remote(e, path));
                }
            }
        }
        self.local().forget(path).await?;

        info!("Pushed delete of {:?}", path);
        Ok(PushOutcome::Deleted)
    }

    async fn create_update_pass(&self, folder: &Path, report: &mut WalkReport) -> Result<()> {
        let mut queue = VecDeque::from([folder.to_path_buf()]);

        while let Some(current) = queue.pop_front() {
            let entries = match self.local().list_local(&current).await {
                Ok(entries) => entries,
                Err(e) => {
                    report.record_error(&current, e.into())?;
                    continue;
                }
            };

            for entry in entries {
                if self.ctx.stop.is_stopped() {
                    return Ok(());
                }
                if self.skip(&entry.path) {
                    continue;
                }

                match self.push_item(&entry.path).await {
                    Ok(outcome) => {
                        report.note_ok();
                        match outcome {
                            PushOutcome::Created => report.created += 1,
                            PushOutcome::Updated => report.updated += 1,
                            PushOutcome::Busy => report.busy += 1,
                            _ => {}
                        }
                        if entry.is_dir && self.is_populated(&entry.path).await {
                            queue.push_back(entry.path);
                        }
                    }
                    Err(e) => report.record_error(&entry.path, e)?,
                }
            }
        }

        Ok(())
    }

    async fn is_populated(&self, path: &Path) -> bool {
        self.local()
            .state(path)
            .await
            .map(|s| s.hydrated)
            .unwrap_or(false)
    }

    /// Push whatever a single local change requires: a move, then content
    pub async fn push_local_change(&self, path: &Path) -> Result<PushOutcome> {
        if self.skip(path) {
            return Ok(PushOutcome::Unchanged);
        }
        let state = self.local().state(path).await?;
        if state.is_placeholder && state.is_moved() {
            match self.push_move(path).await? {
                PushOutcome::Moved => {
                    return match self.push_item(path).await? {
                        PushOutcome::Unchanged => Ok(PushOutcome::Moved),
                        other => Ok(other),
                    };
                }
                PushOutcome::Unchanged => {}
                other => return Ok(other),
            }
        }
        self.push_item(path).await
    }

    /// Create or update one item as its state requires
    pub async fn push_item(&self, path: &Path) -> Result<PushOutcome> {
        if self.skip(path) {
            return Ok(PushOutcome::Unchanged);
        }

        let mut state = self.local().state(path).await?;
        if !state.is_placeholder {
            state = self.local().convert_to_placeholder(path).await?;
        }

        if state.is_new() {
            self.push_create(path).await
        } else if !state.in_sync {
            if state.is_dir {
                // Folders carry no content
                self.ctx.store.set_in_sync(path, true, None).await?;
                Ok(PushOutcome::Unchanged)
            } else {
                self.push_update(path).await
            }
        } else {
            Ok(PushOutcome::Unchanged)
        }
    }

    async fn push_create(&self, path: &Path) -> Result<PushOutcome> {
        let handle = self.ctx.local.open_exclusive(path).await?;
        let state = self.local().state(path).await?;

        if state.is_moved() {
            self.ctx.mark_conflict(path, ConflictKind::ClientMoved).await?;
            return Err(SyncError::Conflict(ConflictKind::ClientMoved, path.to_path_buf()));
        }
        if !state.is_new() {
            return Ok(PushOutcome::Unchanged);
        }

        let parent = path.parent().unwrap_or(Path::new(""));
        let Some(parent_id) = self.ctx.folder_remote_id(parent).await? else {
            debug!("Parent of {:?} not created remotely yet, deferring", path);
            return Ok(PushOutcome::Deferred);
        };

        let snapshot = self.local().read_snapshot(&handle).await?;
        let item = NewItem {
            name: file_name(path),
            is_dir: state.is_dir,
            modified: snapshot.modified,
        };

        let meta = match self
            .ctx
            .remote
            .create(&parent_id, &item, snapshot.content.as_deref())
            .await
        {
            Ok(meta) => meta,
            Err(RemoteError::AlreadyExists(_)) => {
                self.ctx
                    .mark_conflict(path, ConflictKind::ClientModified)
                    .await?;
                return Err(SyncError::Conflict(
                    ConflictKind::ClientModified,
                    path.to_path_buf(),
                ));
            }
            Err(e) => return Err(SyncError::from_remote(e, path)),
        };
        self.ctx
            .echoes
            .expect(&meta.id, EchoKind::Version(meta.etag.clone()));

        let store = &self.ctx.store;
        store.set_remote_id(path, &meta.id).await?;
        store
            .set_etag(path, Some(&meta.etag), Some(meta.modified))
            .await?;
        store.set_original_path(path, Some(path)).await?;
        store
            .set_in_sync(path, true, Some(snapshot.fingerprint))
            .await?;
        self.ctx.clear_conflict(path).await?;

        info!("Created {:?} remotely as {} ({})", path, meta.id, meta.etag);
        Ok(PushOutcome::Created)
    }

    async fn push_update(&self, path: &Path) -> Result<PushOutcome> {
        let Some(token) = self.ctx.locks.token(path).await? else {
            return Ok(PushOutcome::Busy);
        };
        let auto = self.ctx.locks.begin_auto(&token).await?;

        let result = self.push_content(path, auto.record.as_ref()).await;

        if let Err(e) = self.ctx.locks.end_auto(&token, &auto).await {
            debug!("Auto-unlock of {:?} left for later: {}", path, e);
        }
        result
    }

    async fn push_content(
        &self,
        path: &Path,
        lock: Option<&mirage_index::LockRecord>,
    ) -> Result<PushOutcome> {
        let handle = self.ctx.local.open_exclusive(path).await?;
        let state = self.local().state(path).await?;
        if state.in_sync || state.is_new() {
            return Ok(PushOutcome::Unchanged);
        }
        let (Some(id), Some(expected)) = (state.remote_id.clone(), state.etag.clone()) else {
            return Ok(PushOutcome::Unchanged);
        };

        let snapshot = self.local().read_snapshot(&handle).await?;
        let content = snapshot.content.unwrap_or_default();
        let token = lock
            .filter(|record| record.mode != LockMode::None)
            .map(|record| record.token.as_str());

        let meta = match self
            .ctx
            .remote
            .update(&id, &content, snapshot.modified, &expected, token)
            .await
        {
            Ok(meta) => meta,
            Err(RemoteError::PreconditionFailed(current)) => {
                debug!(
                    "Push of {:?} rejected, remote at {} but we had {}",
                    path, current, expected
                );
                self.ctx
                    .mark_conflict(path, ConflictKind::ServerModified)
                    .await?;
                return Err(SyncError::Conflict(
                    ConflictKind::ServerModified,
                    path.to_path_buf(),
                ));
            }
            Err(e) => return Err(SyncError::from_remote(e, path)),
        };
        self.ctx
            .echoes
            .expect(&id, EchoKind::Version(meta.etag.clone()));

        self.ctx
            .store
            .set_etag(path, Some(&meta.etag), Some(meta.modified))
            .await?;
        self.ctx
            .store
            .set_in_sync(path, true, Some(snapshot.fingerprint))
            .await?;
        self.ctx.clear_conflict(path).await?;

        info!("Pushed {:?} ({} -> {})", path, expected, meta.etag);
        Ok(PushOutcome::Updated)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
