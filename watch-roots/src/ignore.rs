//! Ignored paths for a root.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, error};

use crate::config::{ConfigLookup, ServiceConfig};
use crate::error::{Result, WatchError};

/// An ignored path.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IgnoredPath {
    path: PathBuf,
    vcs: bool,
}

/// Full paths excluded from watching.
///
/// Ordinary entries exclude the directory itself and everything beneath it.
/// VCS entries only exclude what lies beneath the directory, so changes to
/// the VCS directory itself remain visible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreSet {
    entries: Vec<IgnoredPath>,
}

impl IgnoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a path to the set.
    pub fn add(&mut self, path: impl Into<PathBuf>, vcs: bool) {
        let path = path.into();
        if self.entries.iter().any(|e| e.path == path) {
            return;
        }
        self.entries.push(IgnoredPath { path, vcs });
    }

    /// Check whether `path` is excluded.
    pub fn is_ignored(&self, path: &Path) -> bool {
        self.entries.iter().any(|entry| match path.strip_prefix(&entry.path) {
            Ok(rest) => !(entry.vcs && rest.as_os_str().is_empty()),
            Err(_) => false,
        })
    }

    /// Check whether `path` is one of the VCS directories.
    pub fn is_vcs_dir(&self, path: &Path) -> bool {
        self.entries.iter().any(|e| e.vcs && e.path == path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the set for a root from its configuration.
    ///
    /// Malformed `ignore_dirs` entries are logged and skipped; a malformed
    /// `ignore_vcs` value is an error.
    pub fn from_config(
        root: &Path,
        document: Option<&Value>,
        service: &ServiceConfig,
    ) -> Result<Self> {
        let lookup = ConfigLookup::new(document);
        let mut set = Self::new();
        set.apply_ignore_dirs(root, &lookup, service);
        set.apply_ignore_vcs(root, &lookup, service)?;
        Ok(set)
    }

    fn apply_ignore_dirs(&mut self, root: &Path, lookup: &ConfigLookup<'_>, service: &ServiceConfig) {
        let Some(ignores) = lookup.get("ignore_dirs") else {
            for dir in &service.ignore_dirs {
                self.add_dir(root, dir);
            }
            return;
        };

        let Some(ignores) = ignores.as_array() else {
            error!("ignore_dirs must be an array of strings");
            return;
        };

        for ignore in ignores {
            match ignore.as_str() {
                Some(dir) => self.add_dir(root, dir),
                None => error!("ignore_dirs must be an array of strings"),
            }
        }
    }

    fn add_dir(&mut self, root: &Path, dir: &str) {
        let full = root.join(dir);
        debug!("ignoring {} recursively", full.display());
        self.add(full, false);
    }

    fn apply_ignore_vcs(
        &mut self,
        root: &Path,
        lookup: &ConfigLookup<'_>,
        service: &ServiceConfig,
    ) -> Result<()> {
        let names: Vec<String> = match lookup.get("ignore_vcs") {
            None => service.ignore_vcs.clone(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| WatchError::VcsIgnore(item.to_string()))
                })
                .collect::<Result<_>>()?,
            Some(other) => return Err(WatchError::VcsIgnore(other.to_string())),
        };

        for name in names {
            self.add(root.join(name), true);
        }
        Ok(())
    }
}
