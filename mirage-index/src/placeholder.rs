//! Local placeholder surface
//!
//! [`PlaceholderSurface`] is what the reconcilers need from the local side.
//! [`LocalPlaceholders`] provides it on a plain directory: tracking data lives
//! in the [`ItemStore`], a dehydrated file is a zero-length file, and a
//! folder that was materialized but never populated is not descended into.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{File, Metadata, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};

use crate::errors::{IndexError, Result};
use crate::handle::{ItemGuard, ItemLocks};
use crate::item::{
    ItemRow, ItemState, LocalFingerprint, LockRecord, PinState, RemoteId, COLUMN_LOCK_OWNER,
};
use crate::store::ItemStore;

/// An entry present on the local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Remote metadata needed to create or refresh a placeholder
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderInfo {
    pub name: String,
    pub is_dir: bool,
    pub remote_id: RemoteId,
    pub etag: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub lock: Option<LockRecord>,
}

/// Metadata and content read while writers were excluded
#[derive(Debug, Clone)]
pub struct LocalSnapshot {
    pub is_dir: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub fingerprint: LocalFingerprint,
    /// `None` for folders and dehydrated files
    pub content: Option<Vec<u8>>,
}

/// Exclusive, non-write-sharing access to one local item
///
/// Holding a handle is the serialization point for every
/// read-metadata / decide / commit sequence on that item.
#[derive(Debug)]
pub struct ItemHandle {
    guard: ItemGuard,
}

impl ItemHandle {
    pub fn new(guard: ItemGuard) -> Self {
        Self { guard }
    }

    pub fn path(&self) -> &Path {
        self.guard.path()
    }
}

/// Capabilities the engine consumes from the local placeholder layer
#[async_trait]
pub trait PlaceholderSurface: Send + Sync {
    /// Absolute path of the sync root
    fn root(&self) -> &Path;

    /// Current state of a local entry; `NotFound` if nothing exists there
    async fn state(&self, path: &Path) -> Result<ItemState>;

    /// Entries physically present in `folder`
    async fn list_local(&self, folder: &Path) -> Result<Vec<LocalEntry>>;

    /// Tracked items recorded under `folder`, whether or not they still exist
    async fn tracked_children(&self, folder: &Path) -> Result<Vec<ItemState>>;

    async fn exists(&self, path: &Path) -> bool;

    async fn is_tracked(&self, path: &Path) -> Result<bool>;

    /// Start tracking a plain local entry
    async fn convert_to_placeholder(&self, path: &Path) -> Result<ItemState>;

    /// Create a placeholder for a remote item under `parent`
    async fn materialize(&self, parent: &Path, info: &PlaceholderInfo) -> Result<PathBuf>;

    async fn open_exclusive(&self, path: &Path) -> Result<ItemHandle>;

    async fn set_pin_state(&self, path: &Path, pin_state: PinState) -> Result<()>;

    /// Make content (or folder children) available locally
    async fn hydrate(&self, handle: &ItemHandle, content: &[u8]) -> Result<()>;

    /// Evict local content, keeping metadata
    async fn dehydrate(&self, handle: &ItemHandle) -> Result<()>;

    async fn read_snapshot(&self, handle: &ItemHandle) -> Result<LocalSnapshot>;

    /// Apply incoming remote metadata; content is fetched again on next hydration
    async fn update_placeholder(&self, handle: &ItemHandle, info: &PlaceholderInfo) -> Result<()>;

    /// Move a tracked item locally, confirming the new path
    async fn move_placeholder(&self, handle: &ItemHandle, to: &Path) -> Result<()>;

    /// Delete a tracked item locally together with its state
    async fn remove_placeholder(&self, handle: &ItemHandle) -> Result<()>;

    /// Drop tracking state for an item that no longer exists locally
    async fn forget(&self, path: &Path) -> Result<()>;
}

/// Tunables for [`LocalPlaceholders`]
#[derive(Debug, Clone)]
pub struct PlaceholderConfig {
    /// How long `open_exclusive` waits for the current holder
    pub handle_timeout: Duration,
    /// Attempts at reading a snapshot that was not torn by a concurrent writer
    pub snapshot_attempts: u32,
}

impl Default for PlaceholderConfig {
    fn default() -> Self {
        Self {
            handle_timeout: Duration::from_secs(5),
            snapshot_attempts: 5,
        }
    }
}

/// Placeholder emulation on a regular directory tree
pub struct LocalPlaceholders {
    root: PathBuf,
    store: ItemStore,
    handles: ItemLocks,
    config: PlaceholderConfig,
}

impl LocalPlaceholders {
    pub fn new(root: impl Into<PathBuf>, store: ItemStore, config: PlaceholderConfig) -> Self {
        Self {
            root: root.into(),
            store,
            handles: ItemLocks::new(),
            config,
        }
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    /// Look up the tracked row for `path`, following local renames by file id
    async fn resolve_row(&self, path: &Path, meta: &Metadata) -> Result<Option<ItemRow>> {
        let current_id = file_id(meta);

        if let Some(row) = self.store.get_item(path).await? {
            if row.file_id != current_id && current_id.is_some() {
                // Saved by delete-and-recreate: same path, new identity
                trace!("File identity of {:?} changed, keeping tracking", path);
                self.store.set_file_id(path, current_id).await?;
            }
            return Ok(Some(row));
        }

        let Some(id) = current_id else {
            return Ok(None);
        };
        let Some(previous) = self.store.find_by_file_id(id).await? else {
            return Ok(None);
        };
        if previous.path == path || self.absolute(&previous.path).exists() {
            return Ok(None);
        }

        debug!("Detected local move {:?} -> {:?}", previous.path, path);
        self.store.move_item(&previous.path, path).await?;
        Ok(self.store.get_item(path).await?)
    }

    /// Clear `in_sync` when content changed since the last confirmation
    async fn refresh_sync_flag(&self, row: &ItemRow, meta: &Metadata) -> Result<()> {
        if row.is_dir || !row.in_sync {
            return Ok(());
        }

        let current = fingerprint(meta);
        match row.fingerprint {
            Some(recorded) if recorded != current => {
                debug!("Local content of {:?} changed, marking dirty", row.path);
                self.store.set_in_sync(&row.path, false, None).await?;
                if !row.hydrated && current.size > 0 {
                    self.store.set_hydrated(&row.path, true, None).await?;
                }
            }
            Some(_) => {}
            None => {
                self.store
                    .set_in_sync(&row.path, true, Some(current))
                    .await?;
            }
        }
        Ok(())
    }

    async fn metadata(&self, path: &Path) -> Result<Metadata> {
        match tokio::fs::symlink_metadata(self.absolute(path)).await {
            Ok(meta) => Ok(meta),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(IndexError::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_remote(&self, path: &Path, info: &PlaceholderInfo) -> Result<()> {
        self.store
            .set_etag(path, Some(&info.etag), Some(info.modified))
            .await?;
        self.store.set_lock(path, info.lock.as_ref()).await?;
        self.store
            .set_column(
                path,
                COLUMN_LOCK_OWNER,
                info.lock.as_ref().map(|l| l.owner.as_str()),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PlaceholderSurface for LocalPlaceholders {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn state(&self, path: &Path) -> Result<ItemState> {
        let meta = self.metadata(path).await?;
        let Some(row) = self.resolve_row(path, &meta).await? else {
            return Ok(ItemState::untracked(path, meta.is_dir()));
        };
        self.refresh_sync_flag(&row, &meta).await?;

        self.store
            .get(path)
            .await?
            .ok_or_else(|| IndexError::NotTracked(path.to_path_buf()))
    }

    async fn list_local(&self, folder: &Path) -> Result<Vec<LocalEntry>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(self.absolute(folder)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IndexError::NotFound(folder.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                trace!("Skipping symlink {:?}", entry.path());
                continue;
            }
            entries.push(LocalEntry {
                path: folder.join(entry.file_name()),
                is_dir: file_type.is_dir(),
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn tracked_children(&self, folder: &Path) -> Result<Vec<ItemState>> {
        let mut states = Vec::new();
        for row in self.store.children_of(folder).await? {
            let side = self.store.get_side_data(&row.path).await?;
            states.push(ItemState::from_parts(row, side));
        }
        Ok(states)
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::symlink_metadata(self.absolute(path)).await.is_ok()
    }

    async fn is_tracked(&self, path: &Path) -> Result<bool> {
        Ok(self.state(path).await?.is_placeholder)
    }

    async fn convert_to_placeholder(&self, path: &Path) -> Result<ItemState> {
        let state = self.state(path).await?;
        if state.is_placeholder {
            return Ok(state);
        }

        let meta = self.metadata(path).await?;
        let mut row = ItemRow::untracked(path, meta.is_dir());
        row.file_id = file_id(&meta);
        self.store.upsert_item(&row).await?;

        info!("Converted {:?} to placeholder", path);
        self.store
            .get(path)
            .await?
            .ok_or_else(|| IndexError::NotTracked(path.to_path_buf()))
    }

    async fn materialize(&self, parent: &Path, info: &PlaceholderInfo) -> Result<PathBuf> {
        let path = parent.join(&info.name);
        let absolute = self.absolute(&path);

        if info.is_dir {
            tokio::fs::create_dir(&absolute).await?;
        } else {
            let target = absolute.clone();
            tokio::task::spawn_blocking(move || {
                OpenOptions::new().write(true).create_new(true).open(target)
            })
            .await
            .map_err(|e| IndexError::Io(std::io::Error::other(e)))??;
        }

        let meta = self.metadata(&path).await?;
        let mut row = ItemRow::untracked(&path, info.is_dir);
        row.file_id = file_id(&meta);
        row.remote_id = Some(info.remote_id.clone());
        row.in_sync = true;
        row.original_path = Some(path.clone());
        // Empty files have nothing to fetch; folders start unpopulated
        row.hydrated = !info.is_dir && info.size == 0;
        row.fingerprint = Some(fingerprint(&meta));
        self.store.upsert_item(&row).await?;
        self.record_remote(&path, info).await?;

        debug!("Materialized placeholder {:?}", path);
        Ok(path)
    }

    async fn open_exclusive(&self, path: &Path) -> Result<ItemHandle> {
        let guard = self
            .handles
            .acquire(path, self.config.handle_timeout)
            .await?;
        Ok(ItemHandle::new(guard))
    }

    async fn set_pin_state(&self, path: &Path, pin_state: PinState) -> Result<()> {
        self.store.set_pin_state(path, pin_state).await
    }

    async fn hydrate(&self, handle: &ItemHandle, content: &[u8]) -> Result<()> {
        let path = handle.path();
        let row = self
            .store
            .get_item(path)
            .await?
            .ok_or_else(|| IndexError::NotTracked(path.to_path_buf()))?;

        if row.is_dir {
            self.store.set_hydrated(path, true, None).await?;
            debug!("Populated folder {:?}", path);
            return Ok(());
        }

        let absolute = self.absolute(path);
        let data = content.to_vec();
        let meta = blocking(move || write_locked(&absolute, &data)).await?;
        self.store
            .set_hydrated(path, true, Some(fingerprint(&meta)))
            .await?;
        debug!("Hydrated {:?} ({} bytes)", path, content.len());
        Ok(())
    }

    async fn dehydrate(&self, handle: &ItemHandle) -> Result<()> {
        let path = handle.path();
        let row = self
            .store
            .get_item(path)
            .await?
            .ok_or_else(|| IndexError::NotTracked(path.to_path_buf()))?;

        if row.is_dir || !row.hydrated {
            return Ok(());
        }

        let absolute = self.absolute(path);
        let meta = blocking(move || write_locked(&absolute, &[])).await?;
        self.store
            .set_hydrated(path, false, Some(fingerprint(&meta)))
            .await?;
        debug!("Dehydrated {:?}", path);
        Ok(())
    }

    async fn read_snapshot(&self, handle: &ItemHandle) -> Result<LocalSnapshot> {
        let path = handle.path().to_path_buf();
        let hydrated = self
            .store
            .get_item(&path)
            .await?
            .map(|row| row.hydrated)
            .unwrap_or(true);
        let absolute = self.absolute(&path);
        let attempts = self.config.snapshot_attempts.max(1);

        blocking(move || {
            for attempt in 1..=attempts {
                match read_locked(&absolute, hydrated)? {
                    Some(snapshot) => return Ok(snapshot),
                    None => {
                        trace!("Snapshot of {:?} torn on attempt {}", absolute, attempt);
                        std::thread::sleep(Duration::from_millis(20 * attempt as u64));
                    }
                }
            }
            warn!("Could not read a stable snapshot of {:?}", absolute);
            Err(IndexError::ItemBusy(path))
        })
        .await
    }

    async fn update_placeholder(&self, handle: &ItemHandle, info: &PlaceholderInfo) -> Result<()> {
        let path = handle.path();
        let row = self
            .store
            .get_item(path)
            .await?
            .ok_or_else(|| IndexError::NotTracked(path.to_path_buf()))?;

        let mut fingerprint_after = None;
        let mut hydrated = row.hydrated;
        if !row.is_dir && row.hydrated {
            // Stale content is dropped; the next hydration fetches the new revision
            let absolute = self.absolute(path);
            let meta = blocking(move || write_locked(&absolute, &[])).await?;
            fingerprint_after = Some(fingerprint(&meta));
            hydrated = info.size == 0;
        }

        self.store
            .set_hydrated(path, hydrated, fingerprint_after)
            .await?;
        self.store.set_remote_id(path, &info.remote_id).await?;
        self.store.set_in_sync(path, true, None).await?;
        self.record_remote(path, info).await?;

        debug!("Updated placeholder {:?} to {}", path, info.etag);
        Ok(())
    }

    async fn move_placeholder(&self, handle: &ItemHandle, to: &Path) -> Result<()> {
        let from = handle.path();
        let absolute_to = self.absolute(to);
        if absolute_to.exists() {
            return Err(IndexError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", to.display()),
            )));
        }
        if let Some(parent) = absolute_to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::rename(self.absolute(from), &absolute_to).await?;
        self.store.move_item(from, to).await?;
        self.store.set_original_path(to, Some(to)).await?;
        self.store.rebase_original_paths(from, to).await?;

        debug!("Moved placeholder {:?} -> {:?}", from, to);
        Ok(())
    }

    async fn remove_placeholder(&self, handle: &ItemHandle) -> Result<()> {
        let path = handle.path();
        let absolute = self.absolute(path);
        match tokio::fs::symlink_metadata(&absolute).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&absolute).await?,
            Ok(_) => tokio::fs::remove_file(&absolute).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.store.delete_item(path).await?;

        debug!("Removed placeholder {:?}", path);
        Ok(())
    }

    async fn forget(&self, path: &Path) -> Result<()> {
        self.store.delete_item(path).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| IndexError::Io(std::io::Error::other(e)))?
}

/// Replace file content while holding an exclusive OS lock
fn write_locked(path: &Path, content: &[u8]) -> Result<Metadata> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.lock_exclusive()?;
    let result = (|| -> Result<Metadata> {
        file.set_len(0)?;
        file.write_all(content)?;
        file.sync_data()?;
        Ok(file.metadata()?)
    })();
    let _ = FileExt::unlock(&file);
    result
}

/// Read metadata and content under an exclusive OS lock
///
/// Returns `None` when the metadata changed during the read, meaning a
/// writer that ignores advisory locks raced with us.
fn read_locked(path: &Path, hydrated: bool) -> Result<Option<LocalSnapshot>> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        return Ok(Some(LocalSnapshot {
            is_dir: true,
            size: 0,
            modified: modified_utc(&meta),
            fingerprint: fingerprint(&meta),
            content: None,
        }));
    }

    let mut file = File::open(path)?;
    if file.try_lock_exclusive().is_err() {
        return Ok(None);
    }

    let result = (|| -> Result<Option<LocalSnapshot>> {
        let before = file.metadata()?;
        let content = if hydrated {
            let mut buf = Vec::with_capacity(before.len() as usize);
            file.read_to_end(&mut buf)?;
            Some(buf)
        } else {
            None
        };
        let after = std::fs::metadata(path)?;
        if fingerprint(&before) != fingerprint(&after) {
            return Ok(None);
        }
        Ok(Some(LocalSnapshot {
            is_dir: false,
            size: before.len(),
            modified: modified_utc(&before),
            fingerprint: fingerprint(&before),
            content,
        }))
    })();
    let _ = FileExt::unlock(&file);
    result
}

fn modified_utc(meta: &Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Size and mtime of a local entry
pub fn fingerprint(meta: &Metadata) -> LocalFingerprint {
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    LocalFingerprint {
        size: if meta.is_dir() { 0 } else { meta.len() },
        modified,
    }
}

/// Stable identity of a local entry across renames, where the platform has one
#[cfg(unix)]
pub fn file_id(meta: &Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
pub fn file_id(_meta: &Metadata) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalPlaceholders) {
        let dir = TempDir::new().unwrap();
        let store = ItemStore::open_in_memory().unwrap();
        let placeholders =
            LocalPlaceholders::new(dir.path(), store, PlaceholderConfig::default());
        (dir, placeholders)
    }

    fn info(name: &str, id: &str, etag: &str, size: u64) -> PlaceholderInfo {
        PlaceholderInfo {
            name: name.to_string(),
            is_dir: false,
            remote_id: RemoteId::from(id),
            etag: etag.to_string(),
            size,
            modified: Utc::now(),
            lock: None,
        }
    }

    async fn confirm(p: &LocalPlaceholders, path: &Path, id: &str) {
        let meta = std::fs::metadata(p.root().join(path)).unwrap();
        p.store()
            .set_remote_id(path, &RemoteId::from(id))
            .await
            .unwrap();
        p.store()
            .set_etag(path, Some("v1"), Some(Utc::now()))
            .await
            .unwrap();
        p.store()
            .set_original_path(path, Some(path))
            .await
            .unwrap();
        p.store()
            .set_in_sync(path, true, Some(fingerprint(&meta)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_untracked_then_converted() {
        let (dir, p) = setup();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let state = p.state(Path::new("notes.txt")).await.unwrap();
        assert!(!state.is_placeholder);

        let state = p
            .convert_to_placeholder(Path::new("notes.txt"))
            .await
            .unwrap();
        assert!(state.is_placeholder);
        assert!(state.is_new());
        assert!(!state.in_sync);
        assert!(p.is_tracked(Path::new("notes.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_entry_is_not_found() {
        let (_dir, p) = setup();
        let err = p.state(Path::new("ghost.txt")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_local_edit_clears_in_sync() {
        let (dir, p) = setup();
        std::fs::write(dir.path().join("a.txt"), b"one").unwrap();
        p.convert_to_placeholder(Path::new("a.txt")).await.unwrap();
        confirm(&p, Path::new("a.txt"), "r1").await;
        assert!(p.state(Path::new("a.txt")).await.unwrap().in_sync);

        std::fs::write(dir.path().join("a.txt"), b"longer content").unwrap();
        let state = p.state(Path::new("a.txt")).await.unwrap();
        assert!(!state.in_sync);
        assert!(!state.is_new());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rename_is_followed_by_file_id() {
        let (dir, p) = setup();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("a/doc.docx"), b"doc").unwrap();
        p.convert_to_placeholder(Path::new("a/doc.docx"))
            .await
            .unwrap();
        confirm(&p, Path::new("a/doc.docx"), "r1").await;

        std::fs::rename(dir.path().join("a/doc.docx"), dir.path().join("b/doc.docx")).unwrap();

        let state = p.state(Path::new("b/doc.docx")).await.unwrap();
        assert!(state.is_placeholder);
        assert!(state.is_moved());
        assert_eq!(state.original_path, Some(PathBuf::from("a/doc.docx")));
        assert_eq!(state.etag.as_deref(), Some("v1"));
        assert!(state.in_sync);
    }

    #[tokio::test]
    async fn test_materialize_hydrate_dehydrate() {
        let (dir, p) = setup();
        let path = p
            .materialize(Path::new(""), &info("remote.txt", "r7", "v3", 5))
            .await
            .unwrap();
        assert_eq!(path, PathBuf::from("remote.txt"));

        let state = p.state(&path).await.unwrap();
        assert!(state.in_sync);
        assert!(!state.hydrated);
        assert_eq!(state.etag.as_deref(), Some("v3"));

        let handle = p.open_exclusive(&path).await.unwrap();
        p.hydrate(&handle, b"hello").await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("remote.txt")).unwrap(), b"hello");
        let state = p.state(&path).await.unwrap();
        assert!(state.hydrated);
        assert!(state.in_sync);

        p.dehydrate(&handle).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("remote.txt")).unwrap().len(), 0);
        let state = p.state(&path).await.unwrap();
        assert!(!state.hydrated);
        assert!(state.in_sync);
    }

    #[tokio::test]
    async fn test_snapshot_reads_content() {
        let (dir, p) = setup();
        std::fs::write(dir.path().join("s.txt"), b"snapshot").unwrap();
        p.convert_to_placeholder(Path::new("s.txt")).await.unwrap();

        let handle = p.open_exclusive(Path::new("s.txt")).await.unwrap();
        let snapshot = p.read_snapshot(&handle).await.unwrap();
        assert_eq!(snapshot.size, 8);
        assert_eq!(snapshot.content.as_deref(), Some(&b"snapshot"[..]));
    }

    #[tokio::test]
    async fn test_open_exclusive_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = ItemStore::open_in_memory().unwrap();
        let p = LocalPlaceholders::new(
            dir.path(),
            store,
            PlaceholderConfig {
                handle_timeout: Duration::from_millis(30),
                ..Default::default()
            },
        );

        let _held = p.open_exclusive(Path::new("x.txt")).await.unwrap();
        let err = p.open_exclusive(Path::new("x.txt")).await.unwrap_err();
        assert!(matches!(err, IndexError::ItemBusy(_)));
    }

    #[tokio::test]
    async fn test_move_and_remove_placeholder() {
        let (dir, p) = setup();
        std::fs::write(dir.path().join("old.txt"), b"x").unwrap();
        p.convert_to_placeholder(Path::new("old.txt")).await.unwrap();
        confirm(&p, Path::new("old.txt"), "r1").await;

        let handle = p.open_exclusive(Path::new("old.txt")).await.unwrap();
        p.move_placeholder(&handle, Path::new("new.txt"))
            .await
            .unwrap();
        drop(handle);

        assert!(!dir.path().join("old.txt").exists());
        let state = p.state(Path::new("new.txt")).await.unwrap();
        assert!(!state.is_moved());
        assert_eq!(state.etag.as_deref(), Some("v1"));

        let handle = p.open_exclusive(Path::new("new.txt")).await.unwrap();
        p.remove_placeholder(&handle).await.unwrap();
        assert!(!dir.path().join("new.txt").exists());
        assert!(p.store().get(Path::new("new.txt")).await.unwrap().is_none());
    }
}
