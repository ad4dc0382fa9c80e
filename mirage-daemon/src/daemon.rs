use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mirage_index::{
    ItemStore, LocalPlaceholders, LocalWatcher, LockMode, PinState, PlaceholderSurface,
    WatcherConfig,
};
use mirage_sync::{
    ChangeEvent, CycleReport, IncomingReconciler, LocalMonitor, LockOutcome, MonitorStats,
    OutgoingReconciler, Quiesce, RemoteMonitor, RemoteStore, SchedulerState, SyncContext,
    SyncScheduler, UnlockOutcome,
};

use crate::config::DaemonConfig;

/// Handles of a started engine
struct Running {
    ctx: Arc<SyncContext>,
    incoming: Arc<IncomingReconciler>,
    scheduler: Arc<SyncScheduler>,
    watcher: Option<LocalWatcher>,
    local_task: Option<JoinHandle<()>>,
    local_stats: Arc<MonitorStats>,
    remote_task: Option<JoinHandle<()>>,
    remote_stats: Arc<MonitorStats>,
    remote_shutdown: watch::Sender<bool>,
}

/// One sync root wired to one remote
pub struct Daemon {
    config: DaemonConfig,
    remote: Arc<dyn RemoteStore>,
    running: Mutex<Option<Running>>,
}

impl Daemon {
    pub fn new(config: DaemonConfig, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            config,
            remote,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Open state, then start the scheduler and both monitors
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            bail!("Daemon already running");
        }
        self.config.validate()?;

        info!("Starting mirage for {:?}", self.config.sync_root);

        tokio::fs::create_dir_all(&self.config.sync_root)
            .await
            .with_context(|| format!("Failed to create {}", self.config.sync_root.display()))?;
        let root = self
            .config
            .sync_root
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", self.config.sync_root.display()))?;
        if let Some(parent) = self.config.state_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let store = ItemStore::open(&self.config.state_path).with_context(|| {
            format!("Failed to open state at {}", self.config.state_path.display())
        })?;
        let orphans = store.purge_orphans().await?;
        if orphans > 0 {
            debug!("Purged {} orphaned side data rows", orphans);
        }

        let sync = self.config.sync.clone();
        let local: Arc<dyn PlaceholderSurface> = Arc::new(LocalPlaceholders::new(
            &root,
            store.clone(),
            sync.placeholder_config(),
        ));
        let ctx = SyncContext::new(sync, store, local, self.remote.clone())?;

        let outgoing = Arc::new(OutgoingReconciler::new(ctx.clone()));
        let incoming = Arc::new(IncomingReconciler::new(ctx.clone()));
        let quiesce = Quiesce::new();
        let scheduler = Arc::new(SyncScheduler::new(
            ctx.clone(),
            outgoing.clone(),
            incoming.clone(),
            quiesce.clone(),
        ));

        let local_monitor = Arc::new(LocalMonitor::new(outgoing, incoming.clone(), quiesce));
        let local_stats = local_monitor.stats();
        let (watcher, local_task) = if self.config.watch_local {
            let (tx, rx) = mpsc::channel::<ChangeEvent>(ctx.config.channel_capacity);
            let watcher_config = WatcherConfig {
                debounce_delay: self.config.watch_debounce,
                recursive: true,
            };
            let watcher = LocalWatcher::start(&root, watcher_config, tx)?;
            (Some(watcher), Some(local_monitor.spawn(rx)))
        } else {
            (None, None)
        };

        let remote_monitor = Arc::new(RemoteMonitor::new(ctx.clone(), incoming.clone()));
        let remote_stats = remote_monitor.stats();
        let (remote_shutdown, shutdown_rx) = watch::channel(false);
        let remote_task = self
            .config
            .watch_remote
            .then(|| remote_monitor.spawn(shutdown_rx));

        scheduler.start().await;

        *running = Some(Running {
            ctx,
            incoming,
            scheduler,
            watcher,
            local_task,
            local_stats,
            remote_task,
            remote_stats,
            remote_shutdown,
        });
        info!("mirage started");
        Ok(())
    }

    /// Stop monitors, then the scheduler; the item in flight finishes first
    pub async fn shutdown(&self) -> Result<()> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };
        info!("Shutting down mirage");

        if let Some(watcher) = running.watcher.take() {
            watcher.stop();
        }
        if let Some(task) = running.local_task.take() {
            if let Err(e) = task.await {
                warn!("Local monitor ended abnormally: {}", e);
            }
        }

        running.remote_shutdown.send_replace(true);
        if let Some(task) = running.remote_task.take() {
            if let Err(e) = task.await {
                warn!("Remote monitor ended abnormally: {}", e);
            }
        }

        running.scheduler.stop().await;

        info!(
            "mirage stopped ({} local and {} remote changes handled)",
            MonitorStats::get(&running.local_stats.handled),
            MonitorStats::get(&running.remote_stats.handled)
        );
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Run until Ctrl-C, then shut down
    pub async fn run_until_signal(&self) -> Result<()> {
        self.start().await?;
        match signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        self.shutdown().await
    }

    pub async fn scheduler_state(&self) -> SchedulerState {
        match self.running.lock().await.as_ref() {
            Some(running) => running.scheduler.state(),
            None => SchedulerState::Disabled,
        }
    }

    /// Run a full cycle now instead of waiting for the timer
    pub async fn sync_now(&self) -> Result<CycleReport> {
        let scheduler = self.with_running(|r| r.scheduler.clone()).await?;
        Ok(scheduler.run_once().await?)
    }

    /// Fetch the content of a placeholder on demand
    pub async fn hydrate(&self, path: &Path) -> Result<()> {
        let incoming = self.with_running(|r| r.incoming.clone()).await?;
        incoming
            .hydrate(path)
            .await
            .with_context(|| format!("Failed to hydrate {}", path.display()))
    }

    /// Pin or unpin an item and apply the hydration policy right away
    pub async fn set_pin_state(&self, path: &Path, pin_state: PinState) -> Result<()> {
        let (ctx, incoming) = self
            .with_running(|r| (r.ctx.clone(), r.incoming.clone()))
            .await?;
        ctx.local.set_pin_state(path, pin_state).await?;
        incoming.apply_hydration_policy(path).await?;
        Ok(())
    }

    /// Take a user-requested lock
    pub async fn lock(&self, path: &Path) -> Result<LockOutcome> {
        let ctx = self.with_running(|r| r.ctx.clone()).await?;
        Ok(ctx.locks.lock(path, LockMode::Manual).await?)
    }

    pub async fn unlock(&self, path: &Path) -> Result<UnlockOutcome> {
        let ctx = self.with_running(|r| r.ctx.clone()).await?;
        Ok(ctx.locks.unlock(path).await?)
    }

    async fn with_running<T>(&self, f: impl FnOnce(&Running) -> T) -> Result<T> {
        match self.running.lock().await.as_ref() {
            Some(running) => Ok(f(running)),
            None => bail!("Daemon is not running"),
        }
    }
}
