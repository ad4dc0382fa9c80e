//! In-process remote store
//!
//! [`MemoryRemote`] keeps a tree of items in memory and behaves like a
//! versioned remote: every content update bumps the ETag (`v1`, `v2`, ...),
//! stale updates fail with `PreconditionFailed`, and every mutation is
//! appended to a change feed. It also counts calls and can inject faults,
//! which is what the engine tests rely on.
//!
//! Methods without the trait's names (`put_file`, `edit`, `rename`,
//! `remove`) act as "another client" and are not counted as engine calls.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mirage_index::RemoteId;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace};

use crate::remote::{
    ChangeBatch, ItemMetadata, NewItem, RemoteChange, RemoteChangeKind, RemoteError, RemoteLock,
    RemoteResult, RemoteStore,
};

/// Remote operations, for counting and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Create,
    Update,
    MoveTo,
    Delete,
    ListChildren,
    Lock,
    Unlock,
    Read,
    Get,
    Changes,
}

/// Number of engine calls per operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: usize,
    pub update: usize,
    pub move_to: usize,
    pub delete: usize,
    pub list_children: usize,
    pub lock: usize,
    pub unlock: usize,
    pub read: usize,
    pub get: usize,
    pub changes: usize,
}

impl CallCounts {
    fn bump(&mut self, op: RemoteOp) {
        let slot = match op {
            RemoteOp::Create => &mut self.create,
            RemoteOp::Update => &mut self.update,
            RemoteOp::MoveTo => &mut self.move_to,
            RemoteOp::Delete => &mut self.delete,
            RemoteOp::ListChildren => &mut self.list_children,
            RemoteOp::Lock => &mut self.lock,
            RemoteOp::Unlock => &mut self.unlock,
            RemoteOp::Read => &mut self.read,
            RemoteOp::Get => &mut self.get,
            RemoteOp::Changes => &mut self.changes,
        };
        *slot += 1;
    }

    /// Calls that change remote state
    pub fn mutations(&self) -> usize {
        self.create + self.update + self.move_to + self.delete + self.lock + self.unlock
    }
}

struct Node {
    meta: ItemMetadata,
    content: Vec<u8>,
    version: u64,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<RemoteId, Node>,
    next_id: u64,
    log: Vec<RemoteChange>,
    calls: CallCounts,
    faults: HashMap<RemoteOp, VecDeque<RemoteError>>,
    offline: bool,
}

impl Inner {
    fn node(&self, id: &RemoteId) -> RemoteResult<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    fn node_mut(&mut self, id: &RemoteId) -> RemoteResult<&mut Node> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    fn children(&self, parent: &RemoteId) -> impl Iterator<Item = &Node> {
        let parent = parent.clone();
        self.nodes
            .values()
            .filter(move |n| n.meta.parent_id.as_ref() == Some(&parent))
    }

    fn name_taken(&self, parent: &RemoteId, name: &str, except: Option<&RemoteId>) -> bool {
        self.children(parent)
            .any(|n| n.meta.name == name && Some(&n.meta.id) != except)
    }

    fn record(&mut self, kind: RemoteChangeKind, item: ItemMetadata) {
        self.log.push(RemoteChange { kind, item });
    }

    fn insert(
        &mut self,
        parent: &RemoteId,
        item: &NewItem,
        content: Vec<u8>,
    ) -> RemoteResult<ItemMetadata> {
        let parent_node = self.node(parent)?;
        if !parent_node.meta.is_dir {
            return Err(RemoteError::Other(format!("{parent} is not a folder")));
        }
        if self.name_taken(parent, &item.name, None) {
            return Err(RemoteError::AlreadyExists(item.name.clone()));
        }

        self.next_id += 1;
        let meta = ItemMetadata {
            id: RemoteId::new(format!("item-{}", self.next_id)),
            parent_id: Some(parent.clone()),
            name: item.name.clone(),
            is_dir: item.is_dir,
            size: content.len() as u64,
            modified: item.modified,
            etag: "v1".to_string(),
            lock: None,
        };
        self.nodes.insert(
            meta.id.clone(),
            Node {
                meta: meta.clone(),
                content,
                version: 1,
            },
        );
        self.record(RemoteChangeKind::Created, meta.clone());
        Ok(meta)
    }

    fn write(
        &mut self,
        id: &RemoteId,
        content: Vec<u8>,
        modified: DateTime<Utc>,
    ) -> RemoteResult<ItemMetadata> {
        let node = self.node_mut(id)?;
        node.version += 1;
        node.meta.etag = format!("v{}", node.version);
        node.meta.size = content.len() as u64;
        node.meta.modified = modified;
        node.content = content;
        let meta = node.meta.clone();
        self.record(RemoteChangeKind::Updated, meta.clone());
        Ok(meta)
    }

    fn relocate(
        &mut self,
        id: &RemoteId,
        new_parent: &RemoteId,
        new_name: &str,
    ) -> RemoteResult<ItemMetadata> {
        self.node(id)?;
        if !self.node(new_parent)?.meta.is_dir {
            return Err(RemoteError::Other(format!("{new_parent} is not a folder")));
        }
        if self.name_taken(new_parent, new_name, Some(id)) {
            return Err(RemoteError::AlreadyExists(new_name.to_string()));
        }

        let node = self.node_mut(id)?;
        node.meta.parent_id = Some(new_parent.clone());
        node.meta.name = new_name.to_string();
        let meta = node.meta.clone();
        self.record(RemoteChangeKind::Moved, meta.clone());
        Ok(meta)
    }

    fn remove_tree(&mut self, id: &RemoteId) -> RemoteResult<()> {
        let meta = self.node(id)?.meta.clone();
        let children: Vec<RemoteId> = self.children(id).map(|n| n.meta.id.clone()).collect();
        for child in children {
            self.remove_tree(&child)?;
        }
        self.nodes.remove(id);
        self.record(RemoteChangeKind::Deleted, meta);
        Ok(())
    }

    fn active_lock(&self, id: &RemoteId) -> RemoteResult<Option<&RemoteLock>> {
        let now = Utc::now();
        Ok(self
            .node(id)?
            .meta
            .lock
            .as_ref()
            .filter(|l| l.expires_at.map(|at| at > now).unwrap_or(true)))
    }
}

/// Versioned in-memory remote store
pub struct MemoryRemote {
    inner: Mutex<Inner>,
    root: RemoteId,
    delay: Option<Duration>,
    lock_ttl: Option<ChronoDuration>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        let root = RemoteId::from("root");
        let mut inner = Inner::default();
        inner.nodes.insert(
            root.clone(),
            Node {
                meta: ItemMetadata {
                    id: root.clone(),
                    parent_id: None,
                    name: String::new(),
                    is_dir: true,
                    size: 0,
                    modified: Utc::now(),
                    etag: "v1".to_string(),
                    lock: None,
                },
                content: Vec::new(),
                version: 1,
            },
        );

        Self {
            inner: Mutex::new(inner),
            root,
            delay: None,
            lock_ttl: Some(ChronoDuration::minutes(30)),
        }
    }

    /// Sleep this long inside every engine call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Expiry granted to new locks; `None` means locks never expire
    pub fn with_lock_ttl(mut self, ttl: Option<ChronoDuration>) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn root_id(&self) -> &RemoteId {
        &self.root
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of engine call counters
    pub fn calls(&self) -> CallCounts {
        self.lock_inner().calls.clone()
    }

    pub fn reset_calls(&self) {
        self.lock_inner().calls = CallCounts::default();
    }

    /// Make the next call of `op` fail with `err`
    pub fn fail_next(&self, op: RemoteOp, err: RemoteError) {
        self.lock_inner()
            .faults
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Fail every engine call with `Unavailable` while offline
    pub fn set_offline(&self, offline: bool) {
        self.lock_inner().offline = offline;
    }

    /// Count the call, then apply delay and injected faults
    async fn enter(&self, op: RemoteOp) -> RemoteResult<()> {
        {
            let mut inner = self.lock_inner();
            inner.calls.bump(op);
            trace!("MemoryRemote {:?}", op);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock_inner();
        if inner.offline {
            return Err(RemoteError::Unavailable("remote offline".to_string()));
        }
        if let Some(err) = inner.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            debug!("Injected {:?} failure: {}", op, err);
            return Err(err);
        }
        Ok(())
    }

    /// Create a file as another client would
    pub fn put_file(
        &self,
        parent: &RemoteId,
        name: &str,
        content: &[u8],
    ) -> RemoteResult<ItemMetadata> {
        let item = NewItem {
            name: name.to_string(),
            is_dir: false,
            modified: Utc::now(),
        };
        self.lock_inner().insert(parent, &item, content.to_vec())
    }

    /// Create a folder as another client would
    pub fn put_dir(&self, parent: &RemoteId, name: &str) -> RemoteResult<ItemMetadata> {
        let item = NewItem {
            name: name.to_string(),
            is_dir: true,
            modified: Utc::now(),
        };
        self.lock_inner().insert(parent, &item, Vec::new())
    }

    /// Replace content as another client would, bumping the version
    pub fn edit(&self, id: &RemoteId, content: &[u8]) -> RemoteResult<ItemMetadata> {
        self.lock_inner().write(id, content.to_vec(), Utc::now())
    }

    /// Rename or reparent as another client would
    pub fn rename(
        &self,
        id: &RemoteId,
        new_parent: &RemoteId,
        new_name: &str,
    ) -> RemoteResult<ItemMetadata> {
        self.lock_inner().relocate(id, new_parent, new_name)
    }

    /// Delete as another client would
    pub fn remove(&self, id: &RemoteId) -> RemoteResult<()> {
        self.lock_inner().remove_tree(id)
    }

    pub fn metadata(&self, id: &RemoteId) -> Option<ItemMetadata> {
        self.lock_inner().nodes.get(id).map(|n| n.meta.clone())
    }

    pub fn content(&self, id: &RemoteId) -> Option<Vec<u8>> {
        self.lock_inner().nodes.get(id).map(|n| n.content.clone())
    }

    /// Resolve a `/`-separated path from the root
    pub fn find(&self, path: &str) -> Option<ItemMetadata> {
        let inner = self.lock_inner();
        let mut current = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = inner
                .children(&current)
                .find(|n| n.meta.name == part)?
                .meta
                .id
                .clone();
        }
        inner.nodes.get(&current).map(|n| n.meta.clone())
    }

    /// Number of items excluding the root
    pub fn item_count(&self) -> usize {
        self.lock_inner().nodes.len().saturating_sub(1)
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn create(
        &self,
        parent: &RemoteId,
        item: &NewItem,
        content: Option<&[u8]>,
    ) -> RemoteResult<ItemMetadata> {
        self.enter(RemoteOp::Create).await?;
        let data = content.map(<[u8]>::to_vec).unwrap_or_default();
        self.lock_inner().insert(parent, item, data)
    }

    async fn update(
        &self,
        id: &RemoteId,
        content: &[u8],
        modified: DateTime<Utc>,
        expected_version: &str,
        lock_token: Option<&str>,
    ) -> RemoteResult<ItemMetadata> {
        self.enter(RemoteOp::Update).await?;
        let mut inner = self.lock_inner();

        let current = inner.node(id)?.meta.etag.clone();
        if current != expected_version {
            return Err(RemoteError::PreconditionFailed(current));
        }
        if let Some(lock) = inner.active_lock(id)? {
            if Some(lock.token.as_str()) != lock_token && lock.exclusive {
                return Err(RemoteError::Locked(lock.owner.clone()));
            }
        }

        inner.write(id, content.to_vec(), modified)
    }

    async fn move_to(
        &self,
        id: &RemoteId,
        new_parent: &RemoteId,
        new_name: &str,
    ) -> RemoteResult<ItemMetadata> {
        self.enter(RemoteOp::MoveTo).await?;
        self.lock_inner().relocate(id, new_parent, new_name)
    }

    async fn delete(&self, id: &RemoteId) -> RemoteResult<()> {
        self.enter(RemoteOp::Delete).await?;
        self.lock_inner().remove_tree(id)
    }

    async fn list_children(&self, parent: &RemoteId) -> RemoteResult<Vec<ItemMetadata>> {
        self.enter(RemoteOp::ListChildren).await?;
        let inner = self.lock_inner();
        inner.node(parent)?;
        let mut children: Vec<ItemMetadata> =
            inner.children(parent).map(|n| n.meta.clone()).collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn lock(&self, id: &RemoteId, exclusive: bool, owner: &str) -> RemoteResult<RemoteLock> {
        self.enter(RemoteOp::Lock).await?;
        let mut inner = self.lock_inner();

        if let Some(existing) = inner.active_lock(id)? {
            return Err(RemoteError::Locked(existing.owner.clone()));
        }

        inner.next_id += 1;
        let lock = RemoteLock {
            token: format!("lock-{}", inner.next_id),
            owner: owner.to_string(),
            exclusive,
            expires_at: self.lock_ttl.map(|ttl| Utc::now() + ttl),
        };
        let node = inner.node_mut(id)?;
        node.meta.lock = Some(lock.clone());
        Ok(lock)
    }

    async fn unlock(&self, id: &RemoteId, token: &str) -> RemoteResult<()> {
        self.enter(RemoteOp::Unlock).await?;
        let mut inner = self.lock_inner();
        let node = inner.node_mut(id)?;

        let held = node
            .meta
            .lock
            .as_ref()
            .map(|lock| (lock.token == token, lock.owner.clone()));
        match held {
            Some((true, _)) => {
                node.meta.lock = None;
                Ok(())
            }
            Some((false, owner)) => Err(RemoteError::Locked(owner)),
            None => Err(RemoteError::NotLocked(id.to_string())),
        }
    }

    async fn read(&self, id: &RemoteId) -> RemoteResult<Vec<u8>> {
        self.enter(RemoteOp::Read).await?;
        Ok(self.lock_inner().node(id)?.content.clone())
    }

    async fn get(&self, id: &RemoteId) -> RemoteResult<ItemMetadata> {
        self.enter(RemoteOp::Get).await?;
        Ok(self.lock_inner().node(id)?.meta.clone())
    }

    async fn changes(&self, cursor: Option<u64>) -> RemoteResult<ChangeBatch> {
        self.enter(RemoteOp::Changes).await?;
        let inner = self.lock_inner();
        let head = inner.log.len() as u64;
        let start = cursor.unwrap_or(head).min(head) as usize;
        Ok(ChangeBatch {
            changes: inner.log[start..].to_vec(),
            cursor: head,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_item(name: &str) -> NewItem {
        NewItem {
            name: name.to_string(),
            is_dir: false,
            modified: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_update_versions() {
        let remote = MemoryRemote::new();
        let root = remote.root_id().clone();

        let meta = remote
            .create(&root, &new_item("notes.txt"), Some(b"hello"))
            .await
            .unwrap();
        assert_eq!(meta.etag, "v1");
        assert_eq!(remote.find("notes.txt").unwrap().id, meta.id);

        let updated = remote
            .update(&meta.id, b"hello again", Utc::now(), "v1", None)
            .await
            .unwrap();
        assert_eq!(updated.etag, "v2");

        let err = remote
            .update(&meta.id, b"stale", Utc::now(), "v1", None)
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::PreconditionFailed("v2".to_string()));
        assert_eq!(remote.content(&meta.id).unwrap(), b"hello again");
        assert_eq!(remote.calls().update, 2);
    }

    #[tokio::test]
    async fn test_name_clash_and_move() {
        let remote = MemoryRemote::new();
        let root = remote.root_id().clone();
        let dir = remote.put_dir(&root, "b").unwrap();
        let file = remote.put_file(&root, "doc.docx", b"x").unwrap();
        remote.put_file(&dir.id, "other.txt", b"y").unwrap();

        let err = remote
            .create(&root, &new_item("doc.docx"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::AlreadyExists(_)));

        let moved = remote.move_to(&file.id, &dir.id, "doc.docx").await.unwrap();
        assert_eq!(moved.parent_id, Some(dir.id.clone()));
        // Moves keep the content version
        assert_eq!(moved.etag, "v1");
        assert!(remote.find("b/doc.docx").is_some());
    }

    #[tokio::test]
    async fn test_lock_excludes_other_writers() {
        let remote = MemoryRemote::new();
        let root = remote.root_id().clone();
        let file = remote.put_file(&root, "f.txt", b"x").unwrap();

        let lock = remote.lock(&file.id, true, "alice").await.unwrap();
        assert!(matches!(
            remote.lock(&file.id, true, "bob").await,
            Err(RemoteError::Locked(owner)) if owner == "alice"
        ));
        assert!(matches!(
            remote.update(&file.id, b"y", Utc::now(), "v1", None).await,
            Err(RemoteError::Locked(_))
        ));
        remote
            .update(&file.id, b"y", Utc::now(), "v1", Some(&lock.token))
            .await
            .unwrap();

        remote.unlock(&file.id, &lock.token).await.unwrap();
        assert!(matches!(
            remote.unlock(&file.id, &lock.token).await,
            Err(RemoteError::NotLocked(_))
        ));
    }

    #[tokio::test]
    async fn test_change_feed_and_faults() {
        let remote = MemoryRemote::new();
        let root = remote.root_id().clone();

        let start = remote.changes(None).await.unwrap();
        assert!(start.changes.is_empty());

        let dir = remote.put_dir(&root, "a").unwrap();
        remote.put_file(&dir.id, "x.txt", b"1").unwrap();
        remote.remove(&dir.id).unwrap();

        let batch = remote.changes(Some(start.cursor)).await.unwrap();
        let kinds: Vec<_> = batch.changes.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RemoteChangeKind::Created,
                RemoteChangeKind::Created,
                RemoteChangeKind::Deleted,
                RemoteChangeKind::Deleted,
            ]
        );
        assert!(remote.changes(Some(batch.cursor)).await.unwrap().changes.is_empty());

        remote.fail_next(RemoteOp::Get, RemoteError::Unavailable("down".into()));
        assert!(remote.get(&root).await.is_err());
        assert!(remote.get(&root).await.is_ok());

        remote.set_offline(true);
        assert!(matches!(
            remote.list_children(&root).await,
            Err(RemoteError::Unavailable(_))
        ));
    }
}
