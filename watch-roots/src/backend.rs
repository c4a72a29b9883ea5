//! Watcher backends.
//!
//! A backend turns OS change notifications for a root into entries in the
//! root's [`PendingCollection`]. Roots only see the [`WatcherBackend`]
//! contract: `init` when a session starts and `dispose` when it is torn
//! down.

use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error};

use crate::error::{Result, WatchError};
use crate::ignore::IgnoreSet;
use crate::pending::{ChangeKind, PendingCollection};

/// Opaque per-session state owned by a backend.
pub struct WatcherHandle {
    backend: &'static str,
    state: Box<dyn Any + Send>,
}

impl WatcherHandle {
    pub fn new(backend: &'static str, state: impl Any + Send) -> Self {
        Self {
            backend,
            state: Box::new(state),
        }
    }

    /// Name of the backend that created this handle.
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Recover the backend's state.
    pub fn into_inner<T: Any>(self) -> Option<Box<T>> {
        self.state.downcast().ok()
    }
}

impl fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

/// OS change-notification backend.
pub trait WatcherBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Start observing `root`, feeding changes into `pending`.
    fn init(
        &self,
        root: &Path,
        ignore: &IgnoreSet,
        pending: PendingCollection,
    ) -> Result<WatcherHandle>;

    /// Stop observing and release the handle.
    fn dispose(&self, handle: WatcherHandle);
}

/// Backend built on `notify`'s recommended watcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyBackend;

struct NotifyState {
    watcher: RecommendedWatcher,
    root: PathBuf,
}

impl WatcherBackend for NotifyBackend {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn init(
        &self,
        root: &Path,
        ignore: &IgnoreSet,
        pending: PendingCollection,
    ) -> Result<WatcherHandle> {
        let ignore = ignore.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    queue_event(event, &ignore, &pending);
                }
                Err(e) => {
                    error!("Watch error: {e}");
                }
            },
        )
        .map_err(|e| WatchError::WatcherInit {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::WatcherInit {
                path: root.to_path_buf(),
                reason: e.to_string(),
            })?;

        debug!("Started watching: {}", root.display());
        Ok(WatcherHandle::new(
            self.name(),
            NotifyState {
                watcher,
                root: root.to_path_buf(),
            },
        ))
    }

    fn dispose(&self, handle: WatcherHandle) {
        let Some(state) = handle.into_inner::<NotifyState>() else {
            error!("notify backend asked to dispose a foreign watcher handle");
            return;
        };
        let NotifyState { mut watcher, root } = *state;
        if let Err(e) = watcher.unwatch(&root) {
            debug!("Failed to unwatch {}: {e}", root.display());
        }
        debug!("Stopped watching: {}", root.display());
    }
}

/// Queue the paths of `event` that are not ignored.
///
/// Returns how many paths were queued.
fn queue_event(event: notify::Event, ignore: &IgnoreSet, pending: &PendingCollection) -> usize {
    let kind = ChangeKind::from(event.kind);
    let rescan = event.need_rescan();

    let mut queued = 0;
    for path in event.paths {
        if !ignore.is_ignored(&path) {
            pending.add(path, kind, false);
            queued += 1;
        }
    }

    if rescan {
        debug!("notify requested a rescan");
        pending.ping();
    } else if queued == 0 {
        debug!("dropped event for ignored paths");
    }
    queued
}

/// Backend that observes nothing.
///
/// Useful for roots that are tracked but never receive OS events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

impl WatcherBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn init(
        &self,
        _root: &Path,
        _ignore: &IgnoreSet,
        _pending: PendingCollection,
    ) -> Result<WatcherHandle> {
        Ok(WatcherHandle::new(self.name(), ()))
    }

    fn dispose(&self, _handle: WatcherHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_notify_backend_queues_changes() {
        let temp_dir = TempDir::new().unwrap();
        let root = dunce::canonicalize(temp_dir.path()).unwrap();
        let pending = PendingCollection::new();

        let handle = NotifyBackend
            .init(&root, &IgnoreSet::new(), pending.clone())
            .unwrap();
        assert_eq!(handle.backend(), "notify");

        let file = root.join("hello.txt");
        std::fs::write(&file, "hi").unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while !pending.contains(&file) && Instant::now() < deadline {
            pending.wait(Duration::from_millis(50));
        }
        assert!(pending.contains(&file));

        NotifyBackend.dispose(handle);
    }

    #[test]
    fn test_queue_event_skips_ignored_paths() {
        let mut ignore = IgnoreSet::new();
        ignore.add("/w/target", false);
        let pending = PendingCollection::new();
        let event = notify::Event::new(notify::EventKind::Create(notify::event::CreateKind::File))
            .add_path(PathBuf::from("/w/src/lib.rs"))
            .add_path(PathBuf::from("/w/target/debug/out"));

        assert_eq!(queue_event(event, &ignore, &pending), 1);

        let changes = pending.drain();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, PathBuf::from("/w/src/lib.rs"));
        assert_eq!(changes[0].kind, ChangeKind::Created);
    }

    #[test]
    fn test_queue_event_pings_on_rescan() {
        let pending = PendingCollection::new();
        let event = notify::Event::new(notify::EventKind::Other)
            .set_flag(notify::event::Flag::Rescan);

        assert_eq!(queue_event(event, &IgnoreSet::new(), &pending), 0);

        assert!(pending.is_empty());
        assert!(pending.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_notify_backend_rejects_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("gone");

        let err = NotifyBackend
            .init(&missing, &IgnoreSet::new(), PendingCollection::new())
            .unwrap_err();
        assert!(matches!(err, WatchError::WatcherInit { .. }));
    }
}
