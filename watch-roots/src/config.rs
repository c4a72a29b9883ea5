//! Configuration for watch roots.
//!
//! Settings are resolved in layers: the optional per-root
//! `.watchmanconfig` document, then the service-wide [`ServiceConfig`],
//! then the built-in defaults. A value of the wrong type in a layer is
//! treated as absent and the lookup moves on to the next layer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WatchError};

/// Name of the per-root configuration document.
pub const ROOT_CONFIG_FILE: &str = ".watchmanconfig";

/// Default settle period in milliseconds.
pub const DEFAULT_SETTLE_MS: u64 = 20;

/// Default age after which deleted tree entries are collected.
pub const DEFAULT_GC_AGE_SECONDS: u64 = 86400 / 2;

/// Default interval between garbage collection passes.
pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 86400;

/// Default idle time after which a root may be reaped.
pub const DEFAULT_REAP_AGE_SECONDS: u64 = 86400 * 5;

/// Service-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Settle period in milliseconds.
    pub settle: u64,

    /// Age in seconds after which deleted entries are collected.
    pub gc_age_seconds: u64,

    /// Seconds between garbage collection passes.
    pub gc_interval_seconds: u64,

    /// Seconds a root may sit idle before it is eligible for reaping.
    /// Zero disables reaping.
    pub idle_reap_age_seconds: u64,

    /// Directories (relative to each root) to ignore recursively.
    pub ignore_dirs: Vec<String>,

    /// VCS directories (relative to each root) whose contents are ignored.
    pub ignore_vcs: Vec<String>,

    /// Where the watched set is persisted, if anywhere.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,

    /// Shutdown drain timing.
    pub drain: DrainConfig,
}

impl ServiceConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the configuration from a JSON file.
    ///
    /// A missing file yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(WatchError::io(path, e)),
        };

        serde_json::from_str(&content).map_err(|e| WatchError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Set the state file location.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Set the drain timing.
    pub fn with_drain(mut self, drain: DrainConfig) -> Self {
        self.drain = drain;
        self
    }

    /// Add a directory to ignore in every root.
    pub fn ignore_dir(mut self, dir: impl Into<String>) -> Self {
        self.ignore_dirs.push(dir.into());
        self
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            settle: DEFAULT_SETTLE_MS,
            gc_age_seconds: DEFAULT_GC_AGE_SECONDS,
            gc_interval_seconds: DEFAULT_GC_INTERVAL_SECONDS,
            idle_reap_age_seconds: DEFAULT_REAP_AGE_SECONDS,
            ignore_dirs: Vec::new(),
            ignore_vcs: vec![".git".to_string(), ".svn".to_string(), ".hg".to_string()],
            state_file: None,
            drain: DrainConfig::default(),
        }
    }
}

/// Timing of the bounded wait performed at process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// First wait interval, in microseconds.
    pub initial_interval_us: u64,

    /// Upper bound for the doubling wait interval, in milliseconds.
    pub max_interval_ms: u64,

    /// Total time allowed for roots to go away, in milliseconds.
    pub deadline_ms: u64,
}

impl DrainConfig {
    /// Create a drain configuration with the given deadline.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_micros(self.initial_interval_us.max(1))
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms).max(self.initial_interval())
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            initial_interval_us: 100,
            max_interval_ms: 1000,
            deadline_ms: 3000,
        }
    }
}

/// Loads the optional configuration document for a root.
pub trait ConfigLoader: Send + Sync {
    /// Return the parsed document, `None` when the root has none.
    fn load(&self, root: &Path) -> Result<Option<Value>>;
}

/// Reads `<root>/.watchmanconfig` from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileConfigLoader;

impl ConfigLoader for FileConfigLoader {
    fn load(&self, root: &Path) -> Result<Option<Value>> {
        let path = root.join(ROOT_CONFIG_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(WatchError::io(path, e)),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| WatchError::ConfigParse {
                path,
                reason: e.to_string(),
            })
    }
}

/// Thresholds resolved for a single root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootSettings {
    /// How long changes must be quiet before they are considered settled.
    pub settle: Duration,

    /// Age after which deleted entries are collected.
    pub gc_age: Duration,

    /// Interval between garbage collection passes.
    pub gc_interval: Duration,

    /// Idle time after which the root may be reaped; zero disables reaping.
    pub idle_reap_age: Duration,
}

impl RootSettings {
    /// Resolve thresholds from the root document, falling back to `service`.
    pub fn resolve(document: Option<&Value>, service: &ServiceConfig) -> Self {
        let lookup = ConfigLookup::new(document);
        Self {
            settle: Duration::from_millis(lookup.u64_or("settle", service.settle)),
            gc_age: Duration::from_secs(lookup.u64_or("gc_age_seconds", service.gc_age_seconds)),
            gc_interval: Duration::from_secs(
                lookup.u64_or("gc_interval_seconds", service.gc_interval_seconds),
            ),
            idle_reap_age: Duration::from_secs(
                lookup.u64_or("idle_reap_age_seconds", service.idle_reap_age_seconds),
            ),
        }
    }
}

impl Default for RootSettings {
    fn default() -> Self {
        Self::resolve(None, &ServiceConfig::default())
    }
}

/// Read-only view over an optional per-root document.
#[derive(Debug, Clone, Copy)]
pub struct ConfigLookup<'a> {
    document: Option<&'a Value>,
}

impl<'a> ConfigLookup<'a> {
    pub fn new(document: Option<&'a Value>) -> Self {
        Self { document }
    }

    /// Raw value for `key`, if the document has one.
    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.document.and_then(|doc| doc.get(key))
    }

    /// Integer value for `key`, or `default` when missing or not an integer.
    pub fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(Value::as_u64).unwrap_or(default)
    }
}

/// Whether paths under `path` compare case sensitively.
pub fn is_case_sensitive_filesystem(_path: &Path) -> bool {
    !cfg!(any(target_os = "macos", windows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_settings_fall_back_to_service_defaults() {
        let settings = RootSettings::resolve(None, &ServiceConfig::default());

        assert_eq!(settings.settle, Duration::from_millis(DEFAULT_SETTLE_MS));
        assert_eq!(settings.gc_age, Duration::from_secs(DEFAULT_GC_AGE_SECONDS));
        assert_eq!(
            settings.idle_reap_age,
            Duration::from_secs(DEFAULT_REAP_AGE_SECONDS)
        );
    }

    #[test]
    fn test_root_document_overrides_and_bad_types_are_ignored() {
        let doc = json!({
            "settle": 250,
            "gc_age_seconds": "soon",
            "idle_reap_age_seconds": 0,
        });
        let service = ServiceConfig {
            gc_age_seconds: 99,
            ..ServiceConfig::default()
        };

        let settings = RootSettings::resolve(Some(&doc), &service);

        assert_eq!(settings.settle, Duration::from_millis(250));
        assert_eq!(settings.gc_age, Duration::from_secs(99));
        assert_eq!(settings.idle_reap_age, Duration::ZERO);
    }

    #[test]
    fn test_file_loader_missing_and_invalid() {
        let temp_dir = TempDir::new().unwrap();
        assert!(FileConfigLoader.load(temp_dir.path()).unwrap().is_none());

        std::fs::write(temp_dir.path().join(ROOT_CONFIG_FILE), "{not json").unwrap();
        let err = FileConfigLoader.load(temp_dir.path()).unwrap_err();
        assert!(matches!(err, WatchError::ConfigParse { .. }));

        std::fs::write(temp_dir.path().join(ROOT_CONFIG_FILE), r#"{"settle": 5}"#).unwrap();
        let doc = FileConfigLoader.load(temp_dir.path()).unwrap();
        assert_eq!(doc, Some(json!({"settle": 5})));
    }

    #[test]
    fn test_drain_deadline_saturates() {
        let drain = DrainConfig::with_deadline(Duration::MAX);
        assert_eq!(drain.deadline_ms, u64::MAX);

        let drain = DrainConfig::with_deadline(Duration::from_millis(1500));
        assert_eq!(drain.deadline(), Duration::from_millis(1500));
    }

    #[test]
    fn test_service_config_partial_document() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("service.json");
        std::fs::write(&path, r#"{"settle": 40, "drain": {"deadline_ms": 500}}"#).unwrap();

        let config = ServiceConfig::load_from(&path).unwrap();

        assert_eq!(config.settle, 40);
        assert_eq!(config.drain.deadline(), Duration::from_millis(500));
        assert_eq!(config.drain.initial_interval(), Duration::from_micros(100));
        assert_eq!(config.ignore_vcs.len(), 3);

        let missing = ServiceConfig::load_from(temp_dir.path().join("absent.json")).unwrap();
        assert_eq!(missing, ServiceConfig::default());
    }
}
