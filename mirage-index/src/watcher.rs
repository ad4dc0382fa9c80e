//! File system watcher for the sync root
//!
//! Raw `notify` events are converted to [`FsEvent`]s with paths relative to
//! the root, debounced per path and forwarded into a bounded channel.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::errors::{IndexError, Result};

/// Change observed on the local tree, relative to the sync root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created(PathBuf),
    /// File content written
    Modified(PathBuf),
    /// Metadata only (pin attributes, permissions, times)
    AttributeChanged(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl FsEvent {
    /// Path the event is reported under
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::Created(p)
            | FsEvent::Modified(p)
            | FsEvent::AttributeChanged(p)
            | FsEvent::Removed(p) => p,
            FsEvent::Renamed { to, .. } => to,
        }
    }
}

/// Debounces file system events to avoid processing rapid changes
pub struct EventDebouncer {
    pending: HashMap<PathBuf, (FsEvent, Instant)>,
    delay: Duration,
}

impl EventDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            delay,
        }
    }

    /// Add an event, merging with a pending event for the same path
    pub fn add_event(&mut self, event: FsEvent) {
        let path = event.path().to_path_buf();
        let merged = match (self.pending.get(&path), &event) {
            // A write right after creation is still a creation
            (Some((FsEvent::Created(_), _)), FsEvent::Modified(_))
            | (Some((FsEvent::Created(_), _)), FsEvent::AttributeChanged(_)) => {
                FsEvent::Created(path.clone())
            }
            (Some((FsEvent::Renamed { from, .. }, _)), FsEvent::Modified(_)) => FsEvent::Renamed {
                from: from.clone(),
                to: path.clone(),
            },
            _ => event,
        };
        self.pending.insert(path, (merged, Instant::now()));
    }

    /// Events that have been stable for the debounce delay
    pub fn get_ready_events(&mut self) -> Vec<FsEvent> {
        let now = Instant::now();
        let mut ready = Vec::new();

        self.pending.retain(|_path, (event, timestamp)| {
            if now.duration_since(*timestamp) >= self.delay {
                ready.push(event.clone());
                false
            } else {
                true
            }
        });

        ready
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Configuration for the local watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce delay for file system events (default: 200ms)
    pub debounce_delay: Duration,
    pub recursive: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_delay: Duration::from_millis(200),
            recursive: true,
        }
    }
}

/// Watches the sync root and feeds debounced events into a channel
pub struct LocalWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
    task: JoinHandle<()>,
}

impl LocalWatcher {
    /// Start watching `root`; events are sent to `events` until it closes
    pub fn start<T>(
        root: impl AsRef<Path>,
        config: WatcherConfig,
        events: mpsc::Sender<T>,
    ) -> Result<Self>
    where
        T: From<FsEvent> + Send + 'static,
    {
        let root = root.as_ref().canonicalize()?;
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();

        let callback_root = root.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for fs_event in convert_notify_event(&callback_root, event) {
                        let _ = raw_tx.send(fs_event);
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
            Config::default(),
        )
        .map_err(|e| IndexError::WatcherError(e.to_string()))?;

        let mode = if config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&root, mode)
            .map_err(|e| IndexError::WatcherError(e.to_string()))?;
        info!("Watching sync root {:?}", root);

        let delay = config.debounce_delay;
        let task = tokio::spawn(async move {
            let mut debouncer = EventDebouncer::new(delay);
            let mut tick = tokio::time::interval(delay.max(Duration::from_millis(10)) / 2);

            loop {
                tokio::select! {
                    raw = raw_rx.recv() => match raw {
                        Some(event) => debouncer.add_event(event),
                        None => break,
                    },
                    _ = tick.tick() => {
                        for event in debouncer.get_ready_events() {
                            trace!("Local event {:?}", event);
                            if events.send(T::from(event)).await.is_err() {
                                debug!("Event receiver closed, stopping watcher task");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            root,
            task,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop watching and discard pending events
    pub fn stop(self) {
        self.task.abort();
        info!("Stopped watching {:?}", self.root);
    }
}

fn relative(root: &Path, path: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    Some(rel.to_path_buf())
}

/// Convert a notify event to zero or more root-relative events
fn convert_notify_event(root: &Path, event: Event) -> Vec<FsEvent> {
    use notify::event::{ModifyKind, RenameMode};

    let first = event.paths.first().and_then(|p| relative(root, p));
    let single = |make: fn(PathBuf) -> FsEvent| -> Vec<FsEvent> {
        first.clone().map(make).into_iter().collect()
    };

    match event.kind {
        EventKind::Create(_) => single(FsEvent::Created),
        EventKind::Remove(_) => single(FsEvent::Removed),
        EventKind::Modify(ModifyKind::Metadata(_)) => single(FsEvent::AttributeChanged),
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            single(FsEvent::Modified)
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if event.paths.len() >= 2 => {
                match (first.clone(), relative(root, &event.paths[1])) {
                    (Some(from), Some(to)) => vec![FsEvent::Renamed { from, to }],
                    // Moved in from outside the root
                    (None, Some(to)) => vec![FsEvent::Created(to)],
                    (Some(from), None) => vec![FsEvent::Removed(from)],
                    (None, None) => Vec::new(),
                }
            }
            RenameMode::From => single(FsEvent::Removed),
            RenameMode::To => single(FsEvent::Created),
            _ => single(FsEvent::Modified),
        },
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, MetadataKind, ModifyKind, RenameMode};
    use tempfile::TempDir;

    #[test]
    fn test_convert_relative_paths() {
        let root = Path::new("/sync");
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/sync/a/new.txt"));
        assert_eq!(
            convert_notify_event(root, event),
            vec![FsEvent::Created(PathBuf::from("a/new.txt"))]
        );

        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/sync/a/doc.docx"))
            .add_path(PathBuf::from("/sync/b/doc.docx"));
        assert_eq!(
            convert_notify_event(root, event),
            vec![FsEvent::Renamed {
                from: PathBuf::from("a/doc.docx"),
                to: PathBuf::from("b/doc.docx"),
            }]
        );

        let event = Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)))
            .add_path(PathBuf::from("/sync/pinned.txt"));
        assert_eq!(
            convert_notify_event(root, event),
            vec![FsEvent::AttributeChanged(PathBuf::from("pinned.txt"))]
        );

        // Root itself and foreign paths are dropped
        let event = Event::new(EventKind::Create(CreateKind::Folder)).add_path(PathBuf::from("/sync"));
        assert!(convert_notify_event(root, event).is_empty());
    }

    #[test]
    fn test_debouncer_merges_created_and_modified() {
        let mut debouncer = EventDebouncer::new(Duration::from_millis(0));
        debouncer.add_event(FsEvent::Created(PathBuf::from("x.txt")));
        debouncer.add_event(FsEvent::Modified(PathBuf::from("x.txt")));
        debouncer.add_event(FsEvent::Modified(PathBuf::from("y.txt")));
        assert!(debouncer.has_pending());

        let mut ready = debouncer.get_ready_events();
        ready.sort_by(|a, b| a.path().cmp(b.path()));
        assert_eq!(
            ready,
            vec![
                FsEvent::Created(PathBuf::from("x.txt")),
                FsEvent::Modified(PathBuf::from("y.txt")),
            ]
        );
        assert!(!debouncer.has_pending());
    }

    #[test]
    fn test_debouncer_holds_recent_events() {
        let mut debouncer = EventDebouncer::new(Duration::from_secs(60));
        debouncer.add_event(FsEvent::Removed(PathBuf::from("gone.txt")));
        assert!(debouncer.get_ready_events().is_empty());
        assert!(debouncer.has_pending());
    }

    #[tokio::test]
    async fn test_watcher_reports_creation() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel::<FsEvent>(16);
        let watcher = LocalWatcher::start(
            dir.path(),
            WatcherConfig {
                debounce_delay: Duration::from_millis(50),
                recursive: true,
            },
            tx,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(dir.path().join("hello.txt"), b"hi").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path(), Path::new("hello.txt"));
        watcher.stop();
    }
}
