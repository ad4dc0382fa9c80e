//! Pending-echo set for remote change suppression
//!
//! Every remote write the engine performs is recorded here before the remote
//! change monitor can observe it. When the change arrives it is matched and
//! dropped instead of being applied back to the local tree.

use mirage_index::RemoteId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::remote::{RemoteChange, RemoteChangeKind};

/// What a pending echo is expected to look like
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EchoKind {
    /// Content create/update producing this version token
    Version(String),
    Moved,
    Deleted,
}

impl EchoKind {
    /// Echo key a remote change would match
    pub fn of(change: &RemoteChange) -> Self {
        match change.kind {
            RemoteChangeKind::Created | RemoteChangeKind::Updated => {
                EchoKind::Version(change.item.etag.clone())
            }
            RemoteChangeKind::Moved => EchoKind::Moved,
            RemoteChangeKind::Deleted => EchoKind::Deleted,
        }
    }
}

/// TTL-bounded set of expected remote echoes, shared by clones
#[derive(Clone)]
pub struct EchoSet {
    ttl: Duration,
    pending: Arc<Mutex<HashMap<(RemoteId, EchoKind), Instant>>>,
}

impl EchoSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Remember that our own write will show up as `kind` on `id`
    pub fn expect(&self, id: &RemoteId, kind: EchoKind) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        pending.retain(|_, at| now.duration_since(*at) < self.ttl);
        trace!("Expecting echo {:?} for {}", kind, id);
        pending.insert((id.clone(), kind), now);
    }

    /// Consume a matching, unexpired echo
    pub fn take(&self, id: &RemoteId, kind: &EchoKind) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.remove(&(id.clone(), kind.clone())) {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Whether `change` was caused by the engine itself
    pub fn is_echo(&self, change: &RemoteChange) -> bool {
        self.take(&change.item.id, &EchoKind::of(change))
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ItemMetadata;
    use chrono::Utc;

    fn change(kind: RemoteChangeKind, etag: &str) -> RemoteChange {
        RemoteChange {
            kind,
            item: ItemMetadata {
                id: RemoteId::from("r1"),
                parent_id: Some(RemoteId::from("root")),
                name: "a.txt".into(),
                is_dir: false,
                size: 1,
                modified: Utc::now(),
                etag: etag.into(),
                lock: None,
            },
        }
    }

    #[test]
    fn test_echo_is_consumed_once() {
        let echoes = EchoSet::new(Duration::from_secs(60));
        echoes.expect(&RemoteId::from("r1"), EchoKind::Version("v2".into()));

        assert!(!echoes.is_echo(&change(RemoteChangeKind::Updated, "v3")));
        assert!(echoes.is_echo(&change(RemoteChangeKind::Updated, "v2")));
        assert!(!echoes.is_echo(&change(RemoteChangeKind::Updated, "v2")));
        assert!(echoes.is_empty());
    }

    #[test]
    fn test_expired_echo_is_not_matched() {
        let echoes = EchoSet::new(Duration::from_millis(0));
        echoes.expect(&RemoteId::from("r1"), EchoKind::Moved);
        assert!(!echoes.is_echo(&change(RemoteChangeKind::Moved, "v1")));
    }

    #[test]
    fn test_created_matches_version() {
        let echoes = EchoSet::new(Duration::from_secs(60));
        echoes.expect(&RemoteId::from("r1"), EchoKind::Version("v1".into()));
        assert!(echoes.is_echo(&change(RemoteChangeKind::Created, "v1")));
    }
}
