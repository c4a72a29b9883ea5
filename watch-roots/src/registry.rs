//! Process-wide registry of watched roots.
//!
//! The registry maps normalized paths to [`RootHandle`]s. It is constructed
//! explicitly when the service handles its first watch request and torn
//! down by the shutdown functions in [`crate::shutdown`].
//!
//! The registry lock only guards map operations. It is never held while
//! touching the file system, calling the watcher backend, or destroying a
//! root: handles removed from the map are released after the lock is gone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::backend::{NotifyBackend, WatcherBackend};
use crate::config::{ConfigLoader, FileConfigLoader, ServiceConfig};
use crate::error::{Result, WatchError};
use crate::root::{LiveRootCounter, Root, RootHandle};

/// The root enclosing a queried path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclosingRoot {
    /// Path of the enclosing root.
    pub root_path: PathBuf,

    /// Queried path relative to the root; `None` for the root itself.
    pub relative_path: Option<PathBuf>,
}

/// Gets or creates roots on behalf of state loading.
pub trait RootResolver {
    /// Return the root for `path`, creating it if needed.
    ///
    /// The flag tells whether the root was created by this call.
    fn resolve(&self, path: &Path) -> Result<(RootHandle, bool)>;

    /// Start watching a newly created root.
    fn start(&self, root: &RootHandle) -> Result<()>;

    /// Cancel a root and stop tracking it.
    fn cancel(&self, root: &RootHandle) -> bool;
}

/// Synchronized map from watched path to root.
pub struct RootRegistry {
    roots: RwLock<HashMap<PathBuf, RootHandle>>,
    service: ServiceConfig,
    backend: Arc<dyn WatcherBackend>,
    config_loader: Arc<dyn ConfigLoader>,
    live_roots: Arc<LiveRootCounter>,
}

impl RootRegistry {
    /// Create an empty registry.
    pub fn new(
        service: ServiceConfig,
        backend: Arc<dyn WatcherBackend>,
        config_loader: Arc<dyn ConfigLoader>,
    ) -> Self {
        Self {
            roots: RwLock::new(HashMap::new()),
            service,
            backend,
            config_loader,
            live_roots: LiveRootCounter::new(),
        }
    }

    /// Create a registry using `notify` and on-disk `.watchmanconfig` files.
    pub fn with_defaults(service: ServiceConfig) -> Self {
        Self::new(service, Arc::new(NotifyBackend), Arc::new(FileConfigLoader))
    }

    pub fn service_config(&self) -> &ServiceConfig {
        &self.service
    }

    /// Counter of roots that have not been destroyed yet.
    pub fn live_roots(&self) -> &Arc<LiveRootCounter> {
        &self.live_roots
    }

    /// Insert `root` under `path`, returning any handle it displaced.
    pub fn insert(&self, path: impl Into<PathBuf>, root: RootHandle) -> Option<RootHandle> {
        self.roots.write().insert(path.into(), root)
    }

    /// Find the root registered for exactly `path`.
    pub fn lookup(&self, path: &Path) -> Option<RootHandle> {
        self.roots.read().get(path).map(RootHandle::add_ref)
    }

    /// Remove `root` if it is still the entry registered for its path.
    ///
    /// An entry that was replaced by a newer root for the same path is left
    /// alone and `false` is returned.
    pub fn remove(&self, root: &RootHandle) -> bool {
        let removed = {
            let mut roots = self.roots.write();
            let is_current = roots
                .get(root.path())
                .is_some_and(|existing| existing.ptr_eq(root));
            if is_current {
                roots.remove(root.path())
            } else {
                None
            }
        };

        match removed {
            Some(handle) => {
                debug!("removed {} from the watch list", handle.path().display());
                handle.release();
                true
            }
            None => false,
        }
    }

    /// Snapshot of every entry.
    pub fn enumerate(&self) -> Vec<(PathBuf, RootHandle)> {
        self.roots
            .read()
            .iter()
            .map(|(path, root)| (path.clone(), root.add_ref()))
            .collect()
    }

    /// Paths of every watched root.
    pub fn watch_list(&self) -> Vec<PathBuf> {
        self.roots.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.roots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.read().is_empty()
    }

    /// Remove every entry and hand the handles to the caller.
    pub(crate) fn take_all(&self) -> Vec<(PathBuf, RootHandle)> {
        self.roots.write().drain().collect()
    }

    /// Find a watched root that contains `path`.
    ///
    /// Paths are compared by component, so a trailing separator is
    /// insignificant: `/a/b/` matches the root `/a/b` itself and has no
    /// relative path. When several roots match, which one is returned is
    /// unspecified.
    pub fn find_enclosing(&self, path: &Path) -> Option<EnclosingRoot> {
        let roots = self.roots.read();
        roots.keys().find_map(|root_path| {
            let rest = path.strip_prefix(root_path).ok()?;
            Some(EnclosingRoot {
                root_path: root_path.clone(),
                relative_path: (!rest.as_os_str().is_empty()).then(|| rest.to_path_buf()),
            })
        })
    }

    /// Return the root watching `path`, creating it when there is none.
    ///
    /// The flag tells whether this call created the root.
    pub fn create_or_get(&self, path: impl AsRef<Path>) -> Result<(RootHandle, bool)> {
        let path = path.as_ref();
        let path = dunce::canonicalize(path).map_err(|e| WatchError::io(path, e))?;

        if let Some(root) = self.lookup(&path) {
            return Ok((root, false));
        }

        let root = Root::create(
            &path,
            &self.service,
            self.config_loader.as_ref(),
            self.backend.clone(),
            self.live_roots.clone(),
        )?;

        let existing = {
            let mut roots = self.roots.write();
            match roots.get(&path) {
                Some(existing) => Some(existing.add_ref()),
                None => {
                    roots.insert(path.clone(), root.add_ref());
                    None
                }
            }
        };

        match existing {
            Some(existing) => {
                debug!("{} was watched concurrently; discarding duplicate", path.display());
                root.cancel();
                root.release();
                Ok((existing, false))
            }
            None => {
                info!("watching {}", path.display());
                Ok((root, true))
            }
        }
    }

    /// Cancel `root` and remove it from the registry.
    ///
    /// Returns whether this call cancelled it.
    pub fn cancel_root(&self, root: &RootHandle) -> bool {
        let cancelled = root.cancel();
        self.remove(root);
        cancelled
    }
}

impl RootResolver for RootRegistry {
    fn resolve(&self, path: &Path) -> Result<(RootHandle, bool)> {
        self.create_or_get(path)
    }

    fn start(&self, root: &RootHandle) -> Result<()> {
        root.start()
    }

    fn cancel(&self, root: &RootHandle) -> bool {
        self.cancel_root(root)
    }
}

impl std::fmt::Debug for RootRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootRegistry")
            .field("roots", &self.watch_list())
            .field("backend", &self.backend.name())
            .field("live_roots", &self.live_roots.get())
            .finish()
    }
}
