//! Change monitors
//!
//! Both monitors feed a bounded channel of [`ChangeEvent`]s drained by one
//! task per monitor family. Local events come from the file system watcher,
//! remote events from polling the remote change feed. Between full passes
//! they keep individual items current.

use mirage_index::FsEvent;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::context::SyncContext;
use crate::errors::{Result, SyncError};
use crate::incoming::{ApplyOutcome, IncomingReconciler};
use crate::outgoing::{OutgoingReconciler, PushOutcome};
use crate::remote::{ItemMetadata, RemoteChange, RemoteChangeKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    AttributeChanged,
    /// `from` is known for local renames only
    Renamed { from: Option<PathBuf> },
    Removed,
}

/// One observed change, local (`metadata == None`) or remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    pub metadata: Option<ItemMetadata>,
}

impl ChangeEvent {
    pub fn local(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            metadata: None,
        }
    }

    /// Event for a remote change; `path` is the best known local location
    pub fn remote(change: RemoteChange, path: impl Into<PathBuf>) -> Self {
        let kind = match change.kind {
            RemoteChangeKind::Created => ChangeKind::Created,
            RemoteChangeKind::Updated => ChangeKind::Modified,
            RemoteChangeKind::Moved => ChangeKind::Renamed { from: None },
            RemoteChangeKind::Deleted => ChangeKind::Removed,
        };
        Self {
            kind,
            path: path.into(),
            metadata: Some(change.item),
        }
    }

    /// Remote change this event was built from
    pub fn remote_change(&self) -> Option<RemoteChange> {
        let item = self.metadata.clone()?;
        let kind = match self.kind {
            ChangeKind::Created => RemoteChangeKind::Created,
            ChangeKind::Modified | ChangeKind::AttributeChanged => RemoteChangeKind::Updated,
            ChangeKind::Renamed { .. } => RemoteChangeKind::Moved,
            ChangeKind::Removed => RemoteChangeKind::Deleted,
        };
        Some(RemoteChange { kind, item })
    }
}

impl From<FsEvent> for ChangeEvent {
    fn from(event: FsEvent) -> Self {
        match event {
            FsEvent::Created(path) => ChangeEvent::local(ChangeKind::Created, path),
            FsEvent::Modified(path) => ChangeEvent::local(ChangeKind::Modified, path),
            FsEvent::AttributeChanged(path) => {
                ChangeEvent::local(ChangeKind::AttributeChanged, path)
            }
            FsEvent::Removed(path) => ChangeEvent::local(ChangeKind::Removed, path),
            FsEvent::Renamed { from, to } => {
                ChangeEvent::local(ChangeKind::Renamed { from: Some(from) }, to)
            }
        }
    }
}

/// Counters shared by a monitor and its observers
#[derive(Debug, Default)]
pub struct MonitorStats {
    pub handled: AtomicUsize,
    /// Local events dropped while a full pass was running
    pub dropped_quiesced: AtomicUsize,
    /// Remote changes recognized as our own writes
    pub dropped_echoes: AtomicUsize,
    pub failed: AtomicUsize,
}

impl MonitorStats {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}

/// Suppresses local monitoring while a full pass runs
#[derive(Clone, Default)]
pub struct Quiesce(Arc<AtomicUsize>);

impl Quiesce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Quiesce until the returned guard is dropped
    pub fn enter(&self) -> QuiesceGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        QuiesceGuard(self.0.clone())
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

pub struct QuiesceGuard(Arc<AtomicUsize>);

impl Drop for QuiesceGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Reacts to local file system changes
pub struct LocalMonitor {
    outgoing: Arc<OutgoingReconciler>,
    incoming: Arc<IncomingReconciler>,
    quiesce: Quiesce,
    stats: Arc<MonitorStats>,
}

impl LocalMonitor {
    pub fn new(
        outgoing: Arc<OutgoingReconciler>,
        incoming: Arc<IncomingReconciler>,
        quiesce: Quiesce,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            quiesce,
            stats: Arc::new(MonitorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<MonitorStats> {
        self.stats.clone()
    }

    /// Handle one local event
    pub async fn handle(&self, event: &ChangeEvent) -> Result<()> {
        let path = event.path.as_path();
        match &event.kind {
            ChangeKind::Created | ChangeKind::Modified => {
                let outcome = self.outgoing.push_local_change(path).await?;
                trace!("Local change on {:?}: {:?}", path, outcome);
            }
            ChangeKind::Renamed { from } => {
                debug!("Local rename {:?} -> {:?}", from, path);
                let outcome = self.outgoing.push_local_change(path).await?;
                if outcome == PushOutcome::Deferred {
                    debug!("Move of {:?} deferred to the next pass", path);
                }
            }
            ChangeKind::AttributeChanged => {
                self.incoming.apply_hydration_policy(path).await?;
            }
            ChangeKind::Removed => {
                // Deletions are confirmed by the next full pass
                debug!("Local removal of {:?} deferred to the next pass", path);
            }
        }
        Ok(())
    }

    /// Drain `events` until the channel closes
    pub fn spawn(self: Arc<Self>, mut events: mpsc::Receiver<ChangeEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Local change monitor started");
            while let Some(event) = events.recv().await {
                if self.quiesce.is_active() {
                    trace!("Dropping local event during full pass: {:?}", event);
                    MonitorStats::bump(&self.stats.dropped_quiesced);
                    continue;
                }
                match self.handle(&event).await {
                    Ok(()) => MonitorStats::bump(&self.stats.handled),
                    Err(e) => log_failure(&self.stats, &event.path, e),
                }
            }
            info!("Local change monitor stopped");
        })
    }
}

/// Polls the remote change feed and applies changes locally
pub struct RemoteMonitor {
    ctx: Arc<SyncContext>,
    incoming: Arc<IncomingReconciler>,
    stats: Arc<MonitorStats>,
}

impl RemoteMonitor {
    pub fn new(ctx: Arc<SyncContext>, incoming: Arc<IncomingReconciler>) -> Self {
        Self {
            ctx,
            incoming,
            stats: Arc::new(MonitorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<MonitorStats> {
        self.stats.clone()
    }

    /// Fetch changes after `cursor` and queue those that are not echoes
    ///
    /// A `None` cursor only establishes the starting point.
    pub async fn poll_once(
        &self,
        cursor: &mut Option<u64>,
        events: &mpsc::Sender<ChangeEvent>,
    ) -> Result<usize> {
        let batch = self
            .ctx
            .remote
            .changes(*cursor)
            .await
            .map_err(|e| SyncError::from_remote(e, Path::new("")))?;
        let first_poll = cursor.is_none();
        *cursor = Some(batch.cursor);
        if first_poll {
            return Ok(0);
        }

        let mut queued = 0;
        for change in batch.changes {
            if self.ctx.echoes.is_echo(&change) {
                trace!("Dropping echo of our own write to {}", change.item.id);
                MonitorStats::bump(&self.stats.dropped_echoes);
                continue;
            }
            let path = self.local_path(&change.item).await;
            if events.send(ChangeEvent::remote(change, path)).await.is_err() {
                break;
            }
            queued += 1;
        }
        Ok(queued)
    }

    async fn local_path(&self, meta: &ItemMetadata) -> PathBuf {
        if let Ok(Some(row)) = self.ctx.store.find_by_remote_id(&meta.id).await {
            return row.path;
        }
        if let Some(parent) = &meta.parent_id {
            if let Ok(Some(folder)) = self.ctx.local_folder(parent).await {
                return folder.join(&meta.name);
            }
        }
        PathBuf::from(&meta.name)
    }

    pub async fn handle(&self, event: &ChangeEvent) -> Result<ApplyOutcome> {
        let Some(change) = event.remote_change() else {
            return Ok(ApplyOutcome::Unchanged);
        };
        let outcome = self.incoming.apply_change(&change).await?;
        debug!("Remote {:?} on {:?}: {:?}", change.kind, event.path, outcome);
        Ok(outcome)
    }

    /// Spawn the poller and the dispatcher; both end when `shutdown` flips
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel(self.ctx.config.channel_capacity);
        let interval = self.ctx.config.remote_poll_interval;

        let dispatcher = {
            let monitor = self.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match monitor.handle(&event).await {
                        Ok(_) => MonitorStats::bump(&monitor.stats.handled),
                        Err(e) => log_failure(&monitor.stats, &event.path, e),
                    }
                }
            })
        };

        tokio::spawn(async move {
            info!("Remote change monitor started");
            let mut cursor = None;
            loop {
                if let Err(e) = self.poll_once(&mut cursor, &tx).await {
                    warn!("Polling remote changes failed: {}", e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            drop(tx);
            let _ = dispatcher.await;
            info!("Remote change monitor stopped");
        })
    }
}

fn log_failure(stats: &MonitorStats, path: &Path, err: SyncError) {
    if err.is_benign() {
        debug!("{:?} vanished before the change was applied", path);
    } else if err.is_busy() {
        debug!("{:?} busy, change left for the next pass", path);
    } else {
        warn!("Failed to apply change to {:?}: {}", path, err);
        MonitorStats::bump(&stats.failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mirage_index::RemoteId;

    #[test]
    fn test_fs_event_conversion() {
        let event = ChangeEvent::from(FsEvent::Renamed {
            from: PathBuf::from("a/doc.docx"),
            to: PathBuf::from("b/doc.docx"),
        });
        assert_eq!(event.path, PathBuf::from("b/doc.docx"));
        assert_eq!(
            event.kind,
            ChangeKind::Renamed {
                from: Some(PathBuf::from("a/doc.docx"))
            }
        );
        assert!(event.metadata.is_none());
        assert!(event.remote_change().is_none());
    }

    #[test]
    fn test_remote_event_roundtrip() {
        let change = RemoteChange {
            kind: RemoteChangeKind::Moved,
            item: ItemMetadata {
                id: RemoteId::from("r1"),
                parent_id: Some(RemoteId::from("root")),
                name: "x.txt".into(),
                is_dir: false,
                size: 0,
                modified: Utc::now(),
                etag: "v1".into(),
                lock: None,
            },
        };
        let event = ChangeEvent::remote(change.clone(), "x.txt");
        assert_eq!(event.kind, ChangeKind::Renamed { from: None });
        assert_eq!(event.remote_change(), Some(change));
    }

    #[test]
    fn test_quiesce_guard() {
        let quiesce = Quiesce::new();
        assert!(!quiesce.is_active());
        {
            let _a = quiesce.enter();
            let _b = quiesce.enter();
            assert!(quiesce.is_active());
        }
        assert!(!quiesce.is_active());
    }
}
