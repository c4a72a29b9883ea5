//! Watch roots.
//!
//! A [`Root`] is one watched directory tree. Its identity and configuration
//! are fixed at creation; its [`Session`] (tree view, pending queues and
//! watcher handle) can be torn down and rebuilt any number of times while
//! the root lives. Roots are shared through counted [`RootHandle`]s and are
//! destroyed exactly once, when the last handle goes away.
//!
//! Lock order: the registry lock is always taken before any lock owned by a
//! root, never the other way around.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::backend::{WatcherBackend, WatcherHandle};
use crate::config::{ConfigLoader, RootSettings, ServiceConfig, is_case_sensitive_filesystem};
use crate::error::{Result, WatchError};
use crate::ignore::IgnoreSet;
use crate::pending::PendingCollection;
use crate::trigger::TriggerTable;

// Numbers are never reused, so a path that is unwatched and watched again
// gets a new number.
static NEXT_ROOT_NUMBER: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    /// Constructed, watcher not yet initialized.
    Fresh,
    /// Watcher initialized.
    Initialized,
    /// Started by its owner.
    Running,
    /// Cancelled; waiting for its owners to let go.
    Cancelled,
    /// Final reference released.
    Destroyed,
}

/// Number of roots that have been constructed and not yet destroyed.
#[derive(Debug, Default)]
pub struct LiveRootCounter {
    count: AtomicUsize,
    lock: Mutex<()>,
    zero: Condvar,
}

impl LiveRootCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current number of live roots.
    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn increment(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.lock.lock();
            self.zero.notify_all();
        }
    }

    /// Wait up to `timeout` for the count to reach zero.
    ///
    /// Returns whether it did.
    pub fn wait_for_zero(&self, timeout: Duration) -> bool {
        let mut guard = self.lock.lock();
        if self.get() == 0 {
            return true;
        }
        let _ = self.zero.wait_for(&mut guard, timeout);
        self.get() == 0
    }
}

/// Immutable identity of a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootIdentity {
    /// Normalized root path.
    pub path: PathBuf,

    /// Process-unique, increasing number.
    pub number: u64,
}

/// Configuration fixed at creation.
#[derive(Debug, Clone)]
pub struct RootConfig {
    /// Resolved thresholds.
    pub settings: RootSettings,

    /// Whether paths under the root compare case sensitively.
    pub case_sensitive: bool,

    /// Paths excluded from watching.
    pub ignore: IgnoreSet,

    /// Parsed `.watchmanconfig`, when the root has a valid one.
    pub document: Option<Value>,
}

/// A directory in the in-memory tree view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedDir {
    path: PathBuf,
    dirs: std::collections::BTreeMap<String, WatchedDir>,
}

impl WatchedDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dirs: Default::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Find or create the directory at `relative` beneath this one.
    pub fn ensure_dir(&mut self, relative: &Path) -> &mut WatchedDir {
        let mut dir = self;
        for component in relative.components() {
            let name = component.as_os_str().to_string_lossy().into_owned();
            let path = dir.path.join(&name);
            dir = dir.dirs.entry(name).or_insert_with(|| WatchedDir::new(path));
        }
        dir
    }

    /// Number of directories in this subtree, including this one.
    pub fn dir_count(&self) -> usize {
        1 + self.dirs.values().map(WatchedDir::dir_count).sum::<usize>()
    }
}

/// Mutable state rebuilt by every teardown.
#[derive(Debug)]
pub struct Session {
    root_dir: WatchedDir,
    pending: PendingCollection,
    pending_symlink_targets: PendingCollection,
    // Handles are only `Send`; the mutex keeps the session `Sync`.
    watcher: Mutex<Option<WatcherHandle>>,
    last_cmd_timestamp: DateTime<Utc>,
}

impl Session {
    fn new(root_path: &Path) -> Self {
        Self {
            root_dir: WatchedDir::new(root_path),
            pending: PendingCollection::new(),
            pending_symlink_targets: PendingCollection::new(),
            watcher: Mutex::new(None),
            last_cmd_timestamp: Utc::now(),
        }
    }

    /// Root of the tree view.
    pub fn root_dir(&self) -> &WatchedDir {
        &self.root_dir
    }

    pub fn root_dir_mut(&mut self) -> &mut WatchedDir {
        &mut self.root_dir
    }

    pub fn pending(&self) -> &PendingCollection {
        &self.pending
    }

    pub fn pending_symlink_targets(&self) -> &PendingCollection {
        &self.pending_symlink_targets
    }

    /// Whether a watcher backend is attached.
    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }

    pub fn last_cmd_timestamp(&self) -> DateTime<Utc> {
        self.last_cmd_timestamp
    }

    fn dispose(self, backend: &dyn WatcherBackend) {
        let Self {
            root_dir,
            pending,
            pending_symlink_targets,
            watcher,
            ..
        } = self;

        let drained = pending.drain().len();
        if drained > 0 {
            debug!("discarded {drained} pending changes");
        }
        pending_symlink_targets.drain();

        // The tree goes before the watcher is disposed.
        drop(root_dir);

        if let Some(handle) = watcher.into_inner() {
            backend.dispose(handle);
        }

        // Anyone still waiting on the old queues must look again.
        pending.ping();
        pending_symlink_targets.ping();
    }
}

/// One watched directory tree.
pub struct Root {
    identity: RootIdentity,
    config: RootConfig,
    backend: Arc<dyn WatcherBackend>,
    live_roots: Arc<LiveRootCounter>,
    status: Mutex<LifecycleStatus>,
    status_changed: Condvar,
    session: RwLock<Session>,
    // Pending queue of the current session, reachable without the session lock.
    wakeup: Mutex<PendingCollection>,
    triggers: RwLock<TriggerTable>,
}

impl Root {
    /// Create a root for `path`.
    ///
    /// Fails when the directory cannot be opened, when the VCS ignore
    /// configuration is malformed, or when the watcher backend cannot start.
    /// A bad `.watchmanconfig` is logged and the defaults are used.
    pub fn create(
        path: impl Into<PathBuf>,
        service: &ServiceConfig,
        loader: &dyn ConfigLoader,
        backend: Arc<dyn WatcherBackend>,
        live_roots: Arc<LiveRootCounter>,
    ) -> Result<RootHandle> {
        let path = path.into();

        // Only a probe: the handle is closed straight away.
        std::fs::read_dir(&path).map_err(|e| WatchError::io(&path, e))?;

        let document = match loader.load(&path) {
            Ok(document) => document,
            Err(e) => {
                error!("{e}");
                None
            }
        };
        let config = RootConfig {
            settings: RootSettings::resolve(document.as_ref(), service),
            case_sensitive: is_case_sensitive_filesystem(&path),
            ignore: IgnoreSet::from_config(&path, document.as_ref(), service)?,
            document,
        };

        let identity = RootIdentity {
            number: NEXT_ROOT_NUMBER.fetch_add(1, Ordering::SeqCst),
            path,
        };

        let root = RootHandle(Arc::new(Self::new(identity, config, backend, live_roots)));
        {
            let mut session = root.session.write();
            root.init_watcher(&mut session)?;
        }
        root.set_status(LifecycleStatus::Initialized);

        info!(
            "created root {} (number {}, backend {})",
            root.path().display(),
            root.number(),
            root.backend.name()
        );
        Ok(root)
    }

    fn new(
        identity: RootIdentity,
        config: RootConfig,
        backend: Arc<dyn WatcherBackend>,
        live_roots: Arc<LiveRootCounter>,
    ) -> Self {
        live_roots.increment();
        let session = Session::new(&identity.path);
        let wakeup = Mutex::new(session.pending.clone());
        Self {
            identity,
            config,
            backend,
            live_roots,
            status: Mutex::new(LifecycleStatus::Fresh),
            status_changed: Condvar::new(),
            session: RwLock::new(session),
            wakeup,
            triggers: RwLock::new(TriggerTable::new()),
        }
    }

    fn init_watcher(&self, session: &mut Session) -> Result<()> {
        let handle = self.backend.init(
            &self.identity.path,
            &self.config.ignore,
            session.pending.clone(),
        )?;
        *session.watcher.get_mut() = Some(handle);
        session.last_cmd_timestamp = Utc::now();
        Ok(())
    }

    pub fn identity(&self) -> &RootIdentity {
        &self.identity
    }

    pub fn path(&self) -> &Path {
        &self.identity.path
    }

    pub fn number(&self) -> u64 {
        self.identity.number
    }

    pub fn config(&self) -> &RootConfig {
        &self.config
    }

    pub fn settings(&self) -> &RootSettings {
        &self.config.settings
    }

    pub fn status(&self) -> LifecycleStatus {
        *self.status.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == LifecycleStatus::Cancelled
    }

    fn set_status(&self, status: LifecycleStatus) {
        *self.status.lock() = status;
        self.status_changed.notify_all();
    }

    /// Mark the root as running.
    pub fn start(&self) -> Result<()> {
        let mut status = self.status.lock();
        match *status {
            LifecycleStatus::Fresh | LifecycleStatus::Initialized => {
                *status = LifecycleStatus::Running;
                self.status_changed.notify_all();
                Ok(())
            }
            LifecycleStatus::Running => Ok(()),
            LifecycleStatus::Cancelled | LifecycleStatus::Destroyed => {
                Err(WatchError::Cancelled(self.identity.path.clone()))
            }
        }
    }

    /// Cancel the root.
    ///
    /// Returns whether this call performed the cancellation. Only flips the
    /// state and wakes waiters; resources are released by [`Root::teardown`]
    /// and by dropping the last handle.
    pub fn cancel(&self) -> bool {
        {
            let mut status = self.status.lock();
            if matches!(
                *status,
                LifecycleStatus::Cancelled | LifecycleStatus::Destroyed
            ) {
                return false;
            }
            *status = LifecycleStatus::Cancelled;
        }
        info!("marked {} cancelled", self.identity.path.display());
        self.signal_threads();
        true
    }

    /// Wake every thread blocked on this root.
    pub fn signal_threads(&self) {
        self.status_changed.notify_all();
        self.wakeup.lock().ping();
    }

    /// Block until the root is cancelled or `timeout` elapses.
    pub fn wait_cancelled(&self, timeout: Duration) -> bool {
        let mut status = self.status.lock();
        let _ = self.status_changed.wait_while_for(
            &mut status,
            |s| !matches!(s, LifecycleStatus::Cancelled | LifecycleStatus::Destroyed),
            timeout,
        );
        matches!(
            *status,
            LifecycleStatus::Cancelled | LifecycleStatus::Destroyed
        )
    }

    /// Discard the session and replace it with a fresh one.
    ///
    /// Pending changes are dropped and the watcher handle is released;
    /// identity, configuration and triggers are kept.
    pub fn teardown(&self) {
        let mut session = self.session.write();
        self.replace_session(&mut session);
    }

    /// Tear the session down and start the watcher again.
    ///
    /// A running root stays running.
    pub fn restart(&self) -> Result<()> {
        let mut session = self.session.write();
        let status = self.status();
        if matches!(
            status,
            LifecycleStatus::Cancelled | LifecycleStatus::Destroyed
        ) {
            return Err(WatchError::Cancelled(self.identity.path.clone()));
        }
        self.replace_session(&mut session);
        self.init_watcher(&mut session)?;
        if status == LifecycleStatus::Fresh {
            self.set_status(LifecycleStatus::Initialized);
        }
        Ok(())
    }

    fn replace_session(&self, session: &mut RwLockWriteGuard<'_, Session>) {
        let fresh = Session::new(&self.identity.path);
        *self.wakeup.lock() = fresh.pending.clone();
        let old = std::mem::replace(&mut **session, fresh);
        old.dispose(self.backend.as_ref());
        debug!("tore down session for {}", self.identity.path.display());
    }

    /// Read access to the session.
    pub fn session(&self) -> RwLockReadGuard<'_, Session> {
        self.session.read()
    }

    /// Write access to the session.
    pub fn session_mut(&self) -> RwLockWriteGuard<'_, Session> {
        self.session.write()
    }

    /// Queue of pending changes for the current session.
    pub fn pending(&self) -> PendingCollection {
        self.session.read().pending.clone()
    }

    pub fn triggers(&self) -> RwLockReadGuard<'_, TriggerTable> {
        self.triggers.read()
    }

    pub fn triggers_mut(&self) -> RwLockWriteGuard<'_, TriggerTable> {
        self.triggers.write()
    }

    /// Record client activity.
    pub fn touch(&self) {
        self.session.write().last_cmd_timestamp = Utc::now();
    }

    /// Time since the last client activity.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.session.read().last_cmd_timestamp)
            .to_std()
            .unwrap_or_default()
    }

    /// Whether the root has been idle long enough to be reaped.
    pub fn is_idle_reapable(&self, now: DateTime<Utc>) -> bool {
        let age = self.config.settings.idle_reap_age;
        !age.is_zero() && self.idle_for(now) >= age
    }
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root")
            .field("path", &self.identity.path)
            .field("number", &self.identity.number)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        debug!("root: final ref on {}", self.identity.path.display());
        let session = std::mem::replace(
            self.session.get_mut(),
            Session::new(&self.identity.path),
        );
        session.dispose(self.backend.as_ref());
        *self.status.get_mut() = LifecycleStatus::Destroyed;
        self.status_changed.notify_all();
        self.live_roots.decrement();
    }
}

/// A counted reference to a [`Root`].
///
/// Cloning adds a reference; dropping or [`RootHandle::release`] removes
/// one. The root is destroyed when the count reaches zero.
#[derive(Debug, Clone)]
pub struct RootHandle(Arc<Root>);

impl RootHandle {
    /// Take an additional reference.
    pub fn add_ref(&self) -> RootHandle {
        self.clone()
    }

    /// Release this reference.
    ///
    /// Returns whether it was the final one, in which case the root has
    /// been destroyed by the time this returns.
    pub fn release(self) -> bool {
        Arc::into_inner(self.0).is_some()
    }

    /// Release the handle held in `slot`, leaving the slot empty.
    ///
    /// Releasing an empty slot is a logic error in the caller.
    pub fn release_slot(slot: &mut Option<RootHandle>) -> Result<bool> {
        match slot.take() {
            Some(handle) => Ok(handle.release()),
            None => {
                error!("already released root passed to release_slot");
                Err(WatchError::AlreadyReleased)
            }
        }
    }

    /// Number of live references, including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Whether both handles refer to the same root object.
    pub fn ptr_eq(&self, other: &RootHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for RootHandle {
    type Target = Root;

    fn deref(&self) -> &Root {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;
    use crate::config::FileConfigLoader;
    use crate::pending::ChangeKind;
    use pretty_assertions::assert_eq;
    use std::thread;
    use tempfile::TempDir;

    fn create(path: &Path, live: &Arc<LiveRootCounter>) -> Result<RootHandle> {
        Root::create(
            path,
            &ServiceConfig::default(),
            &FileConfigLoader,
            Arc::new(NullBackend),
            live.clone(),
        )
    }

    #[test]
    fn test_create_initializes_root() {
        let temp_dir = TempDir::new().unwrap();
        let live = LiveRootCounter::new();

        let root = create(temp_dir.path(), &live).unwrap();

        assert_eq!(root.status(), LifecycleStatus::Initialized);
        assert_eq!(root.ref_count(), 1);
        assert_eq!(live.get(), 1);
        assert_eq!(root.session().root_dir().path(), temp_dir.path());
        assert!(root.session().is_watching());
        assert!(root.triggers().is_empty());
    }

    #[test]
    fn test_create_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        let live = LiveRootCounter::new();

        let err = create(&temp_dir.path().join("nope"), &live).unwrap_err();

        assert!(matches!(err, WatchError::Io { .. }));
        assert_eq!(live.get(), 0);
    }

    #[test]
    fn test_bad_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(".watchmanconfig"), "{{{").unwrap();
        let live = LiveRootCounter::new();

        let root = create(temp_dir.path(), &live).unwrap();

        assert_eq!(root.settings(), &RootSettings::default());
        assert!(root.config().document.is_none());
    }

    #[test]
    fn test_config_document_is_applied() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join(".watchmanconfig"),
            r#"{"settle": 300, "ignore_dirs": ["out"]}"#,
        )
        .unwrap();
        let live = LiveRootCounter::new();

        let root = create(temp_dir.path(), &live).unwrap();

        assert_eq!(root.settings().settle, Duration::from_millis(300));
        assert!(root.config().ignore.is_ignored(&temp_dir.path().join("out/x")));
    }

    #[test]
    fn test_bad_vcs_config_aborts_creation() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join(".watchmanconfig"),
            r#"{"ignore_vcs": 3}"#,
        )
        .unwrap();
        let live = LiveRootCounter::new();

        let err = create(temp_dir.path(), &live).unwrap_err();

        assert!(matches!(err, WatchError::VcsIgnore(_)));
        assert_eq!(live.get(), 0);
    }

    #[test]
    fn test_root_numbers_increase() {
        let temp_dir = TempDir::new().unwrap();
        let live = LiveRootCounter::new();

        let first = create(temp_dir.path(), &live).unwrap();
        let first_number = first.number();
        first.release();
        let second = create(temp_dir.path(), &live).unwrap();

        assert!(second.number() > first_number);
    }

    #[test]
    fn test_destroyed_on_final_release_only() {
        let temp_dir = TempDir::new().unwrap();
        let live = LiveRootCounter::new();

        let root = create(temp_dir.path(), &live).unwrap();
        let extra = root.add_ref();
        assert_eq!(root.ref_count(), 2);

        assert!(!root.release());
        assert_eq!(live.get(), 1);
        assert!(extra.release());
        assert_eq!(live.get(), 0);
    }

    #[test]
    fn test_release_slot_twice_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let live = LiveRootCounter::new();
        let mut slot = Some(create(temp_dir.path(), &live).unwrap());

        assert!(RootHandle::release_slot(&mut slot).unwrap());
        let err = RootHandle::release_slot(&mut slot).unwrap_err();
        assert!(matches!(err, WatchError::AlreadyReleased));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let live = LiveRootCounter::new();
        let root = create(temp_dir.path(), &live).unwrap();

        assert!(root.cancel());
        assert!(!root.cancel());
        assert_eq!(root.status(), LifecycleStatus::Cancelled);
        assert!(matches!(root.start(), Err(WatchError::Cancelled(_))));
        assert!(root.restart().is_err());
        // cancellation does not release anything
        assert_eq!(live.get(), 1);
    }

    #[test]
    fn test_cancel_wakes_waiters() {
        let temp_dir = TempDir::new().unwrap();
        let live = LiveRootCounter::new();
        let root = create(temp_dir.path(), &live).unwrap();
        root.start().unwrap();

        let pending = root.pending();
        let status_waiter = {
            let root = root.add_ref();
            thread::spawn(move || root.wait_cancelled(Duration::from_secs(10)))
        };
        let pending_waiter = thread::spawn(move || pending.wait(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(20));
        root.cancel();

        assert!(status_waiter.join().unwrap());
        assert!(pending_waiter.join().unwrap());
    }

    #[test]
    fn test_teardown_rebuilds_session_and_keeps_identity() {
        let temp_dir = TempDir::new().unwrap();
        let live = LiveRootCounter::new();
        let root = create(temp_dir.path(), &live).unwrap();
        let number = root.number();

        root.pending()
            .add(temp_dir.path().join("a"), ChangeKind::Created, false);
        root.session_mut().root_dir_mut().ensure_dir(Path::new("src/bin"));
        assert_eq!(root.session().root_dir().dir_count(), 3);

        root.teardown();

        assert!(root.pending().is_empty());
        assert!(!root.session().is_watching());
        assert_eq!(root.session().root_dir().dir_count(), 1);
        assert_eq!(root.number(), number);

        root.restart().unwrap();
        assert!(root.session().is_watching());
        assert_eq!(root.status(), LifecycleStatus::Initialized);
    }

    #[test]
    fn test_restart_keeps_running_root_running() {
        let temp_dir = TempDir::new().unwrap();
        let live = LiveRootCounter::new();
        let root = create(temp_dir.path(), &live).unwrap();
        root.start().unwrap();

        root.restart().unwrap();

        assert_eq!(root.status(), LifecycleStatus::Running);
        assert!(root.session().is_watching());
    }

    #[test]
    fn test_idle_reaping() {
        let temp_dir = TempDir::new().unwrap();
        let live = LiveRootCounter::new();
        let root = create(temp_dir.path(), &live).unwrap();

        let now = Utc::now();
        assert!(!root.is_idle_reapable(now));
        let later = now + chrono::Duration::days(6);
        assert!(root.is_idle_reapable(later));
    }

    #[test]
    fn test_live_counter_wait() {
        let temp_dir = TempDir::new().unwrap();
        let live = LiveRootCounter::new();
        let root = create(temp_dir.path(), &live).unwrap();

        assert!(!live.wait_for_zero(Duration::from_millis(10)));
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            root.release()
        });
        assert!(live.wait_for_zero(Duration::from_secs(10)));
        assert!(releaser.join().unwrap());
    }
}
