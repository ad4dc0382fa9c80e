pub mod errors;
pub mod filter;
pub mod handle;
pub mod item;
pub mod placeholder;
pub mod schema;
pub mod store;
pub mod watcher;

pub use errors::{IndexError, Result};
pub use filter::{default_patterns, PatternFilter, SyncFilter};
pub use handle::{ItemGuard, ItemLocks};
pub use item::{
    key_path, path_key, ItemRow, ItemState, LocalFingerprint, LockMode, LockRecord, PinState,
    RemoteId, SideData, COLUMN_CONFLICT, COLUMN_LOCK_OWNER,
};
pub use placeholder::{
    ItemHandle, LocalEntry, LocalPlaceholders, LocalSnapshot, PlaceholderConfig, PlaceholderInfo,
    PlaceholderSurface,
};
pub use store::{ItemDatabase, ItemStore};
pub use watcher::{EventDebouncer, FsEvent, LocalWatcher, WatcherConfig};
