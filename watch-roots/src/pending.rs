//! Pending change collections.
//!
//! The watcher backend pushes observed paths into a [`PendingCollection`];
//! consumers drain it once changes have settled. Paths are coalesced so a
//! burst of events for one file yields a single entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Kind of change observed for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
    MetadataChanged,
    Unknown,
}

impl From<notify::EventKind> for ChangeKind {
    fn from(kind: notify::EventKind) -> Self {
        match kind {
            notify::EventKind::Create(_) => Self::Created,
            notify::EventKind::Modify(notify::event::ModifyKind::Name(_)) => Self::Renamed,
            notify::EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => {
                Self::MetadataChanged
            }
            notify::EventKind::Modify(_) => Self::Modified,
            notify::EventKind::Remove(_) => Self::Deleted,
            _ => Self::Unknown,
        }
    }
}

/// A path waiting to be examined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Affected path.
    pub path: PathBuf,

    /// Most recent kind of change seen for the path.
    pub kind: ChangeKind,

    /// When the most recent change was observed.
    pub observed_at: DateTime<Utc>,

    /// Whether the whole subtree under `path` must be re-examined.
    pub recursive: bool,
}

#[derive(Debug, Default)]
struct PendingState {
    items: HashMap<PathBuf, PendingChange>,
    pinged: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<PendingState>,
    cond: Condvar,
}

/// Lock-protected, path-coalescing queue of pending changes.
///
/// Clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct PendingCollection {
    shared: Arc<Shared>,
}

impl PendingCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change and wake any waiter.
    ///
    /// A recursive entry is never downgraded by a later non-recursive one.
    pub fn add(&self, path: impl Into<PathBuf>, kind: ChangeKind, recursive: bool) {
        let path = path.into();
        let mut state = self.shared.state.lock();
        let observed_at = Utc::now();
        state
            .items
            .entry(path.clone())
            .and_modify(|change| {
                change.kind = kind;
                change.observed_at = observed_at;
                change.recursive |= recursive;
            })
            .or_insert(PendingChange {
                path,
                kind,
                observed_at,
                recursive,
            });
        state.pinged = true;
        self.shared.cond.notify_all();
    }

    /// Take every pending change, oldest first.
    pub fn drain(&self) -> Vec<PendingChange> {
        let mut state = self.shared.state.lock();
        state.pinged = false;
        let mut changes: Vec<_> = state.items.drain().map(|(_, change)| change).collect();
        changes.sort_by(|a, b| a.observed_at.cmp(&b.observed_at).then(a.path.cmp(&b.path)));
        changes
    }

    /// Whether `path` is queued.
    pub fn contains(&self, path: &Path) -> bool {
        self.shared.state.lock().items.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().items.is_empty()
    }

    /// Wake waiters without adding anything.
    pub fn ping(&self) {
        let mut state = self.shared.state.lock();
        state.pinged = true;
        self.shared.cond.notify_all();
    }

    /// Block until the collection is pinged or `timeout` elapses.
    ///
    /// Returns whether a ping was observed. Consumes the ping.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if !state.pinged {
            let _ = self
                .shared
                .cond
                .wait_while_for(&mut state, |s| !s.pinged, timeout);
        }
        std::mem::take(&mut state.pinged)
    }
}
