//! Error types for watch roots.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for watch root operations.
pub type Result<T> = std::result::Result<T, WatchError>;

/// Errors that can occur while managing watch roots.
#[derive(Error, Debug)]
pub enum WatchError {
    /// The root directory could not be opened or resolved.
    #[error("failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The watcher backend refused to start.
    #[error("watcher backend failed to initialize for {path}: {reason}")]
    WatcherInit { path: PathBuf, reason: String },

    /// A per-root configuration document was not valid JSON.
    #[error("failed to parse json from {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    /// The VCS ignore configuration was malformed.
    #[error("ignore_vcs must be an array of strings: {0}")]
    VcsIgnore(String),

    /// A trigger definition was malformed.
    #[error("invalid trigger definition: {0}")]
    TriggerParse(String),

    /// A trigger definition uses the unsupported `rules` format.
    #[error("trigger {0:?} uses the legacy rules format")]
    LegacyTrigger(String),

    /// A root handle was released more than once.
    #[error("already released root handle")]
    AlreadyReleased,

    /// The root was cancelled and can no longer be started.
    #[error("root {0} has been cancelled")]
    Cancelled(PathBuf),

    /// The persisted state file could not be read or written.
    #[error("state file {path}: {reason}")]
    StateFile { path: PathBuf, reason: String },
}

impl WatchError {
    /// Wrap an I/O error with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error marks a legacy trigger that should be skipped quietly.
    pub fn is_legacy_trigger(&self) -> bool {
        matches!(self, Self::LegacyTrigger(_))
    }
}
