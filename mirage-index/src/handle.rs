//! Per-item mutual exclusion
//!
//! [`ItemLocks`] hands out at most one [`ItemGuard`] per key at a time.
//! Waiting is bounded; a timeout means another operation on the same item
//! is in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::errors::{IndexError, Result};
use crate::item::path_key;

type Slots = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Registry of per-item async mutexes keyed by relative path
#[derive(Clone, Default)]
pub struct ItemLocks {
    slots: Slots,
}

impl ItemLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.to_string()).or_default().clone()
    }

    /// Wait up to `timeout` for exclusive access to `path`
    pub async fn acquire(&self, path: &Path, timeout: Duration) -> Result<ItemGuard> {
        let key = path_key(path);
        let slot = self.slot(&key);

        match tokio::time::timeout(timeout, slot.lock_owned()).await {
            Ok(guard) => {
                trace!("Acquired item guard for {}", key);
                Ok(ItemGuard {
                    key,
                    path: path.to_path_buf(),
                    slots: self.slots.clone(),
                    guard: Some(guard),
                })
            }
            Err(_) => {
                self.release_slot(&key);
                Err(IndexError::ItemBusy(path.to_path_buf()))
            }
        }
    }

    /// Take the guard only if nobody holds it right now
    pub fn try_acquire(&self, path: &Path) -> Result<ItemGuard> {
        let key = path_key(path);
        let slot = self.slot(&key);

        match slot.try_lock_owned() {
            Ok(guard) => Ok(ItemGuard {
                key,
                path: path.to_path_buf(),
                slots: self.slots.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                self.release_slot(&key);
                Err(IndexError::ItemBusy(path.to_path_buf()))
            }
        }
    }

    pub fn is_held(&self, path: &Path) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(&path_key(path))
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    fn release_slot(&self, key: &str) {
        remove_idle(&self.slots, key, 0);
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Drop the registry entry when only `holders` references besides the map remain
fn remove_idle(slots: &Slots, key: &str, holders: usize) {
    let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(slot) = slots.get(key) {
        if Arc::strong_count(slot) <= holders + 1 {
            slots.remove(key);
        }
    }
}

/// Exclusive access to one item, released on drop
pub struct ItemGuard {
    key: String,
    path: PathBuf,
    slots: Slots,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ItemGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for ItemGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemGuard").field("path", &self.path).finish()
    }
}

impl Drop for ItemGuard {
    fn drop(&mut self) {
        // Release the mutex before checking for waiters
        let guard = self.guard.take();
        drop(guard);
        remove_idle(&self.slots, &self.key, 0);
        trace!("Released item guard for {}", self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let locks = ItemLocks::new();
        let first = locks
            .acquire(Path::new("a.txt"), Duration::from_millis(50))
            .await
            .unwrap();

        let err = locks
            .acquire(Path::new("a.txt"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::ItemBusy(_)));
        assert!(locks.is_held(Path::new("a.txt")));

        // Different item is independent
        let other = locks
            .acquire(Path::new("b.txt"), Duration::from_millis(20))
            .await;
        assert!(other.is_ok());

        drop(first);
        assert!(locks.try_acquire(Path::new("a.txt")).is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_guard_after_release() {
        let locks = ItemLocks::new();
        let first = locks
            .acquire(Path::new("x"), Duration::from_millis(50))
            .await
            .unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire(Path::new("x"), Duration::from_secs(2))
                    .await
                    .map(|_| ())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_slots_are_cleaned_up() {
        let locks = ItemLocks::new();
        {
            let _a = locks.try_acquire(Path::new("a")).unwrap();
            let _b = locks.try_acquire(Path::new("b")).unwrap();
            assert_eq!(locks.slot_count(), 2);
        }
        assert_eq!(locks.slot_count(), 0);
    }
}
