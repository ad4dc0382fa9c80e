pub mod config;
pub mod context;
pub mod echo;
pub mod errors;
pub mod incoming;
pub mod lock;
pub mod memory;
pub mod monitor;
pub mod outgoing;
pub mod remote;
pub mod scheduler;

pub use config::SyncConfig;
pub use context::{StopFlag, SyncContext, WalkReport, UNAVAILABLE_STREAK_LIMIT};
pub use echo::{EchoKind, EchoSet};
pub use errors::{ConflictKind, Result, SyncError};
pub use incoming::{ApplyOutcome, IncomingReconciler};
pub use lock::{AutoLock, LockManager, LockOutcome, LockState, LockToken, UnlockOutcome};
pub use memory::{CallCounts, MemoryRemote, RemoteOp};
pub use monitor::{ChangeEvent, ChangeKind, LocalMonitor, MonitorStats, Quiesce, RemoteMonitor};
pub use outgoing::{OutgoingReconciler, PushOutcome};
pub use remote::{
    ChangeBatch, ItemMetadata, NewItem, RemoteChange, RemoteChangeKind, RemoteError, RemoteLock,
    RemoteResult, RemoteStore,
};
pub use scheduler::{CycleReport, SchedulerState, SyncScheduler};
