//! Per-item metadata tracked by the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Column key for the lock owner shown next to an item
pub const COLUMN_LOCK_OWNER: &str = "lock_owner";
/// Column key for an unresolved conflict marker
pub const COLUMN_CONFLICT: &str = "conflict";

/// Opaque identity of an item on the remote side
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RemoteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// How a lock came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Requested explicitly by the user, survives restarts
    Manual,
    /// Taken transparently around a content push
    Auto,
    None,
}

/// Remote lock persisted alongside an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub token: String,
    pub owner: String,
    pub exclusive: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub mode: LockMode,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Hydration hint set by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinState {
    #[default]
    Unspecified,
    /// Keep content available locally
    Pinned,
    /// Content may be evicted
    Unpinned,
}

impl PinState {
    pub(crate) fn to_db(self) -> i64 {
        match self {
            PinState::Unspecified => 0,
            PinState::Pinned => 1,
            PinState::Unpinned => 2,
        }
    }

    pub(crate) fn from_db(value: i64) -> Self {
        match value {
            1 => PinState::Pinned,
            2 => PinState::Unpinned,
            _ => PinState::Unspecified,
        }
    }
}

/// Size and mtime recorded when the engine last confirmed local content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalFingerprint {
    pub size: u64,
    /// Nanoseconds since the unix epoch
    pub modified: i64,
}

/// Side-channel data that must survive delete-and-recreate save patterns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideData {
    pub etag: Option<String>,
    pub remote_modified: Option<DateTime<Utc>>,
    pub lock: Option<LockRecord>,
    pub columns: BTreeMap<String, String>,
}

/// Row of the `items` table
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRow {
    pub path: PathBuf,
    pub file_id: Option<u64>,
    pub is_dir: bool,
    pub remote_id: Option<RemoteId>,
    pub in_sync: bool,
    pub original_path: Option<PathBuf>,
    pub pin_state: PinState,
    pub hydrated: bool,
    pub fingerprint: Option<LocalFingerprint>,
}

impl ItemRow {
    /// A freshly tracked local entry nobody has confirmed yet
    pub fn untracked(path: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self {
            path: path.into(),
            file_id: None,
            is_dir,
            remote_id: None,
            in_sync: false,
            original_path: None,
            pin_state: PinState::Unspecified,
            hydrated: true,
            fingerprint: None,
        }
    }
}

/// Full view of one item, tracked entry plus side data
#[derive(Debug, Clone, PartialEq)]
pub struct ItemState {
    pub path: PathBuf,
    pub is_placeholder: bool,
    pub is_dir: bool,
    pub in_sync: bool,
    pub original_path: Option<PathBuf>,
    pub remote_id: Option<RemoteId>,
    pub etag: Option<String>,
    pub remote_modified: Option<DateTime<Utc>>,
    pub lock: Option<LockRecord>,
    pub columns: BTreeMap<String, String>,
    pub pin_state: PinState,
    pub hydrated: bool,
}

impl ItemState {
    /// State of a plain local entry the engine does not track
    pub fn untracked(path: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self {
            path: path.into(),
            is_placeholder: false,
            is_dir,
            in_sync: false,
            original_path: None,
            remote_id: None,
            etag: None,
            remote_modified: None,
            lock: None,
            columns: BTreeMap::new(),
            pin_state: PinState::Unspecified,
            hydrated: true,
        }
    }

    pub(crate) fn from_parts(row: ItemRow, side: SideData) -> Self {
        Self {
            path: row.path,
            is_placeholder: true,
            is_dir: row.is_dir,
            in_sync: row.in_sync,
            original_path: row.original_path,
            remote_id: row.remote_id,
            etag: side.etag,
            remote_modified: side.remote_modified,
            lock: side.lock,
            columns: side.columns,
            pin_state: row.pin_state,
            hydrated: row.hydrated,
        }
    }

    /// No remote identity or version token has ever been recorded
    pub fn is_new(&self) -> bool {
        self.remote_id.is_none() || self.etag.is_none()
    }

    /// Path differs from the one confirmed at the last sync
    pub fn is_moved(&self) -> bool {
        match &self.original_path {
            Some(original) => original != &self.path,
            None => false,
        }
    }

    pub fn conflict(&self) -> Option<&str> {
        self.columns.get(COLUMN_CONFLICT).map(String::as_str)
    }
}

/// Normalize a relative path into the `/`-separated key used in the database
pub fn path_key(path: &Path) -> String {
    let mut key = String::new();
    for component in path.components() {
        if let Component::Normal(part) = component {
            if !key.is_empty() {
                key.push('/');
            }
            key.push_str(&part.to_string_lossy());
        }
    }
    key
}

/// Inverse of [`path_key`]
pub fn key_path(key: &str) -> PathBuf {
    key.split('/').filter(|part| !part.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_and_moved_flags() {
        let mut state = ItemState::untracked("b/doc.docx", false);
        state.is_placeholder = true;
        assert!(state.is_new());
        assert!(!state.is_moved());

        state.remote_id = Some(RemoteId::from("r1"));
        state.etag = Some("v1".to_string());
        state.original_path = Some(PathBuf::from("a/doc.docx"));
        assert!(!state.is_new());
        assert!(state.is_moved());

        state.original_path = Some(PathBuf::from("b/doc.docx"));
        assert!(!state.is_moved());
    }

    #[test]
    fn test_missing_etag_counts_as_new() {
        let mut state = ItemState::untracked("notes.txt", false);
        state.remote_id = Some(RemoteId::from("r1"));
        assert!(state.is_new());
    }

    #[test]
    fn test_path_key_roundtrip() {
        assert_eq!(path_key(Path::new("a/b/c.txt")), "a/b/c.txt");
        assert_eq!(path_key(Path::new("./a//b")), "a/b");
        assert_eq!(key_path("a/b/c.txt"), PathBuf::from("a").join("b").join("c.txt"));
        assert_eq!(path_key(Path::new("")), "");
    }

    #[test]
    fn test_lock_expiry() {
        let now = Utc::now();
        let mut record = LockRecord {
            token: "t".into(),
            owner: "me".into(),
            exclusive: true,
            expires_at: None,
            mode: LockMode::Manual,
        };
        assert!(!record.is_expired(now));
        record.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(record.is_expired(now));
    }
}
