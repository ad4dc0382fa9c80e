//! Error types for sync operations

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::remote::RemoteError;

/// Why an item could not be reconciled without losing a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Local content changed while the remote one did too
    ClientModified,
    /// Remote version moved on since our last confirmation
    ServerModified,
    /// Item was moved locally while a create was in flight
    ClientMoved,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictKind::ClientModified => "ClientModified",
            ConflictKind::ServerModified => "ServerModified",
            ConflictKind::ClientMoved => "ClientMoved",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Conflict ({0}): {1}")]
    Conflict(ConflictKind, PathBuf),

    #[error("Item lock busy: {0}")]
    LockBusy(PathBuf),

    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(PathBuf),

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("Index error: {0}")]
    Index(#[from] mirage_index::IndexError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Map a remote failure for the item at `path`
    pub fn from_remote(err: RemoteError, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match err {
            RemoteError::PreconditionFailed(_) => {
                SyncError::Conflict(ConflictKind::ServerModified, path)
            }
            RemoteError::NotFound(_) => SyncError::NotFound(path),
            RemoteError::PermissionDenied(_) => SyncError::PermissionDenied(path),
            RemoteError::Unavailable(msg) => SyncError::RemoteUnavailable(msg),
            other => SyncError::Remote(other.to_string()),
        }
    }

    /// The item vanished while we acted on it; nothing left to do
    pub fn is_benign(&self) -> bool {
        match self {
            SyncError::NotFound(_) => true,
            SyncError::Index(e) => e.is_not_found(),
            SyncError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Item is mid-transaction elsewhere; retry on a later pass
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SyncError::LockBusy(_) | SyncError::Index(mirage_index::IndexError::ItemBusy(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;

    #[test]
    fn test_precondition_maps_to_server_modified() {
        let err = SyncError::from_remote(RemoteError::PreconditionFailed("v2".into()), "a.txt");
        assert!(matches!(
            err,
            SyncError::Conflict(ConflictKind::ServerModified, _)
        ));
        assert_eq!(err.to_string(), "Conflict (ServerModified): a.txt");
    }

    #[test]
    fn test_benign_and_busy() {
        assert!(SyncError::NotFound("x".into()).is_benign());
        assert!(
            SyncError::Index(mirage_index::IndexError::NotFound("x".into())).is_benign()
        );
        assert!(SyncError::LockBusy("x".into()).is_busy());
        assert!(SyncError::Index(mirage_index::IndexError::ItemBusy("x".into())).is_busy());
        assert!(!SyncError::Remote("boom".into()).is_benign());
    }
}
