//! Remote item store interface

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirage_index::RemoteId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported by a remote store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote item not found: {0}")]
    NotFound(String),

    /// `expected_version` no longer matches the remote item
    #[error("Precondition failed, remote is at {0}")]
    PreconditionFailed(String),

    #[error("Name already taken: {0}")]
    AlreadyExists(String),

    #[error("Item locked by {0}")]
    Locked(String),

    #[error("Item not locked: {0}")]
    NotLocked(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Remote failure: {0}")]
    Other(String),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Metadata of one remote item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub id: RemoteId,
    /// `None` only for the root
    pub parent_id: Option<RemoteId>,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Version token, changes on every content update
    pub etag: String,
    pub lock: Option<RemoteLock>,
}

/// Lock as reported by the remote side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLock {
    pub token: String,
    pub owner: String,
    pub exclusive: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Metadata supplied when creating an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub name: String,
    pub is_dir: bool,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteChangeKind {
    Created,
    Updated,
    /// Renamed and/or reparented
    Moved,
    Deleted,
}

/// One entry of the remote change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub kind: RemoteChangeKind,
    /// Item metadata after the change (last known metadata for deletes)
    pub item: ItemMetadata,
}

/// Changes since a cursor plus the cursor to resume from
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub changes: Vec<RemoteChange>,
    pub cursor: u64,
}

/// Operations the engine needs from the remote side
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create(
        &self,
        parent: &RemoteId,
        item: &NewItem,
        content: Option<&[u8]>,
    ) -> RemoteResult<ItemMetadata>;

    /// Replace content; fails with `PreconditionFailed` when the remote
    /// version is not `expected_version`
    async fn update(
        &self,
        id: &RemoteId,
        content: &[u8],
        modified: DateTime<Utc>,
        expected_version: &str,
        lock_token: Option<&str>,
    ) -> RemoteResult<ItemMetadata>;

    async fn move_to(
        &self,
        id: &RemoteId,
        new_parent: &RemoteId,
        new_name: &str,
    ) -> RemoteResult<ItemMetadata>;

    async fn delete(&self, id: &RemoteId) -> RemoteResult<()>;

    async fn list_children(&self, parent: &RemoteId) -> RemoteResult<Vec<ItemMetadata>>;

    async fn lock(&self, id: &RemoteId, exclusive: bool, owner: &str) -> RemoteResult<RemoteLock>;

    async fn unlock(&self, id: &RemoteId, token: &str) -> RemoteResult<()>;

    async fn read(&self, id: &RemoteId) -> RemoteResult<Vec<u8>>;

    async fn get(&self, id: &RemoteId) -> RemoteResult<ItemMetadata>;

    /// Changes after `cursor`; `None` starts from the current head
    async fn changes(&self, cursor: Option<u64>) -> RemoteResult<ChangeBatch>;
}
