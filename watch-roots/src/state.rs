//! Saving and restoring the watched set.
//!
//! The persisted document lists every watched root together with the
//! definitions of its triggers, exactly as they were submitted:
//!
//! ```json
//! {"watched": [{"path": "/src/project", "triggers": [{"name": "build", "command": ["make"]}]}]}
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

use crate::config::ServiceConfig;
use crate::error::{Result, WatchError};
use crate::registry::{RootRegistry, RootResolver};
use crate::trigger::TriggerCommand;

/// Document describing the watched set.
///
/// Entries are validated one at a time when a document is read: an entry
/// that does not describe a root lands in `rejected` instead of failing the
/// whole document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawState")]
pub struct PersistedState {
    pub watched: Vec<WatchedEntry>,

    /// Entries that could not be read.
    #[serde(skip)]
    pub rejected: Vec<RejectedEntry>,
}

/// A persisted entry that does not describe a root.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedEntry {
    pub document: Value,
    pub reason: String,
}

#[derive(Deserialize)]
struct RawState {
    #[serde(default)]
    watched: Value,
}

impl From<RawState> for PersistedState {
    fn from(raw: RawState) -> Self {
        let mut state = Self::default();
        match raw.watched {
            Value::Null => {}
            Value::Array(entries) => {
                for document in entries {
                    match WatchedEntry::deserialize(&document) {
                        Ok(entry) => state.watched.push(entry),
                        Err(e) => state.rejected.push(RejectedEntry {
                            document,
                            reason: e.to_string(),
                        }),
                    }
                }
            }
            document => state.rejected.push(RejectedEntry {
                document,
                reason: "watched must be an array".to_string(),
            }),
        }
        state
    }
}

/// One watched root in a [`PersistedState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedEntry {
    pub path: PathBuf,

    /// Trigger definitions, unmodified.
    #[serde(default)]
    pub triggers: Vec<Value>,
}

/// What [`load_state`] managed to restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Roots resolved and, when new, started.
    pub roots: usize,

    /// Roots that could not be resolved or started.
    pub failed_roots: usize,

    /// Triggers installed.
    pub triggers: usize,

    /// Legacy trigger definitions that were skipped.
    pub legacy_triggers: usize,

    /// Trigger definitions that failed to parse.
    pub invalid_triggers: usize,
}

/// Describe every root in `registry` and its triggers.
///
/// The registry lock is only held while taking the snapshot.
pub fn save_state(registry: &RootRegistry) -> PersistedState {
    debug!("saving state");

    let mut watched: Vec<WatchedEntry> = registry
        .enumerate()
        .into_iter()
        .map(|(path, root)| WatchedEntry {
            path,
            triggers: root.triggers().to_documents(),
        })
        .collect();
    watched.sort_by(|a, b| a.path.cmp(&b.path));

    PersistedState {
        watched,
        rejected: Vec::new(),
    }
}

/// Recreate the roots and triggers described by `state`.
///
/// Failures affect only the entry they occur in: they are logged and the
/// remaining entries are still processed.
pub fn load_state(state: &PersistedState, resolver: &dyn RootResolver) -> LoadSummary {
    let mut summary = LoadSummary::default();

    for rejected in &state.rejected {
        error!(
            "skipping unreadable watch entry {}: {}",
            rejected.document, rejected.reason
        );
        summary.failed_roots += 1;
    }

    for entry in &state.watched {
        let (root, created) = match resolver.resolve(&entry.path) {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("failed to restore watch on {}: {e}", entry.path.display());
                summary.failed_roots += 1;
                continue;
            }
        };

        {
            let mut triggers = root.triggers_mut();
            for definition in &entry.triggers {
                match TriggerCommand::parse(definition.clone()) {
                    Ok(command) => {
                        triggers.install(command);
                        summary.triggers += 1;
                    }
                    Err(e) if e.is_legacy_trigger() => {
                        info!("skipping trigger for {}: {e}", root.path().display());
                        summary.legacy_triggers += 1;
                    }
                    Err(e) => {
                        error!("loading trigger for {}: {e}", root.path().display());
                        summary.invalid_triggers += 1;
                    }
                }
            }
        }

        if created {
            if let Err(e) = resolver.start(&root) {
                error!("starting {} failed: {e}", root.path().display());
                resolver.cancel(&root);
                summary.failed_roots += 1;
                continue;
            }
        }

        summary.roots += 1;
    }

    summary
}

/// Durable location of the persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store named by the service configuration, if any.
    pub fn from_config(service: &ServiceConfig) -> Option<Self> {
        service.state_file.clone().map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `state`, replacing the previous file atomically.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| WatchError::io(&dir, e))?;

        let mut file = NamedTempFile::new_in(&dir).map_err(|e| WatchError::io(&dir, e))?;
        serde_json::to_writer_pretty(&mut file, state).map_err(|e| WatchError::StateFile {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        file.write_all(b"\n")
            .and_then(|()| file.as_file().sync_all())
            .map_err(|e| WatchError::io(file.path(), e))?;
        file.persist(&self.path)
            .map_err(|e| WatchError::io(&self.path, e.error))?;

        debug!("saved {} watched roots to {}", state.watched.len(), self.path.display());
        Ok(())
    }

    /// Read the saved state; `None` when nothing has been saved yet.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(WatchError::io(&self.path, e)),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| WatchError::StateFile {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }
}

/// Save the registry's state to `store`.
pub fn persist(registry: &RootRegistry, store: &StateStore) -> Result<()> {
    store.save(&save_state(registry))
}

/// Restore the state saved in `store`, if any.
pub fn restore(store: &StateStore, resolver: &dyn RootResolver) -> Result<LoadSummary> {
    match store.load()? {
        Some(state) => Ok(load_state(&state, resolver)),
        None => Ok(LoadSummary::default()),
    }
}
