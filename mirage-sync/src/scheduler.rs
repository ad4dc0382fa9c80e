//! Periodic full synchronization
//!
//! A single timer is rearmed after each cycle finishes, so cycles never
//! overlap. Each cycle pushes local changes first, then pulls remote ones,
//! with local monitoring quiesced for the duration.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::{SyncContext, WalkReport};
use crate::errors::{Result, SyncError};
use crate::incoming::IncomingReconciler;
use crate::monitor::Quiesce;
use crate::outgoing::OutgoingReconciler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Disabled,
    Enabled,
    Synchronizing,
    Idle,
}

/// Result of one full cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub outgoing: WalkReport,
    pub incoming: WalkReport,
}

impl CycleReport {
    pub fn is_noop(&self) -> bool {
        self.outgoing.is_noop() && self.incoming.is_noop()
    }
}

pub struct SyncScheduler {
    ctx: Arc<SyncContext>,
    outgoing: Arc<OutgoingReconciler>,
    incoming: Arc<IncomingReconciler>,
    quiesce: Quiesce,
    state: watch::Sender<SchedulerState>,
    events: broadcast::Sender<SchedulerState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    cycle_lock: Mutex<()>,
}

impl SyncScheduler {
    pub fn new(
        ctx: Arc<SyncContext>,
        outgoing: Arc<OutgoingReconciler>,
        incoming: Arc<IncomingReconciler>,
        quiesce: Quiesce,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Disabled);
        let (events, _) = broadcast::channel(32);
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx,
            outgoing,
            incoming,
            quiesce,
            state,
            events,
            shutdown,
            task: Mutex::new(None),
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerState> {
        self.events.subscribe()
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
        // No subscribers is fine
        let _ = self.events.send(state);
    }

    /// Run one full cycle now, waiting for any cycle already in progress
    pub async fn run_once(&self) -> Result<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;
        let _quiet = self.quiesce.enter();
        let previous = self.state();
        self.set_state(SchedulerState::Synchronizing);

        let result = self.cycle().await;

        let next = if previous == SchedulerState::Disabled {
            SchedulerState::Disabled
        } else {
            SchedulerState::Idle
        };
        self.set_state(next);
        result
    }

    async fn cycle(&self) -> Result<CycleReport> {
        let root = std::path::Path::new("");
        // An aborted outgoing pass must not hold back remote changes
        let outgoing = match self.outgoing.reconcile(root).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Outgoing pass aborted: {}", e);
                let mut report = WalkReport::default();
                report.failed += 1;
                report
            }
        };
        if self.ctx.stop.is_stopped() {
            return Ok(CycleReport {
                outgoing,
                incoming: WalkReport::default(),
            });
        }
        let incoming = self.incoming.reconcile(root).await?;
        Ok(CycleReport { outgoing, incoming })
    }

    /// Start periodic cycles; the first one runs immediately
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            debug!("Scheduler already running");
            return;
        }
        self.ctx.stop.reset();
        self.shutdown.send_replace(false);
        self.set_state(SchedulerState::Enabled);

        let scheduler = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.ctx.config.sync_interval;

        *task = Some(tokio::spawn(async move {
            info!("Sync scheduler started, interval {:?}", interval);
            let mut delay = Duration::ZERO;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if *shutdown.borrow() {
                    break;
                }

                // A panic inside the cycle surfaces as a JoinError
                let runner = scheduler.clone();
                match tokio::spawn(async move { runner.run_once().await }).await {
                    Ok(Ok(report)) => log_cycle(&report),
                    Ok(Err(SyncError::RemoteUnavailable(reason))) => {
                        warn!("Remote unavailable, retrying next cycle: {}", reason)
                    }
                    Ok(Err(e)) => error!("Sync cycle failed: {}", e),
                    Err(e) => error!("Sync cycle aborted: {}", e),
                }
                delay = interval;
            }
            info!("Sync scheduler stopped");
        }));
    }

    /// Stop scheduling and interrupt a running cycle between items
    pub async fn stop(&self) {
        self.ctx.stop.stop();
        self.shutdown.send_replace(true);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }
        self.set_state(SchedulerState::Disabled);
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.state(), SchedulerState::Disabled)
    }
}

fn log_cycle(report: &CycleReport) {
    if report.is_noop() {
        debug!("Sync cycle complete, nothing to do");
        return;
    }
    let out = &report.outgoing;
    let inc = &report.incoming;
    info!(
        "Sync cycle complete: pushed {} created, {} updated, {} moved, {} deleted; \
         pulled {} materialized, {} updated, {} moved, {} deleted",
        out.created, out.updated, out.moved, out.deleted,
        inc.materialized, inc.updated, inc.moved, inc.deleted
    );
    let conflicts = out.conflicts + inc.conflicts;
    if conflicts > 0 {
        warn!("{} items in conflict", conflicts);
    }
}
