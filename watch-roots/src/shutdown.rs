//! Stopping every root at service shutdown.

use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::config::DrainConfig;
use crate::registry::RootRegistry;
use crate::state::{StateStore, save_state};

/// Reaps child processes spawned by triggers.
pub trait ProcessReaper: Send + Sync {
    fn reap_children(&self);
}

/// Reaper for processes that never spawn children.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReaper;

impl ProcessReaper for NoopReaper {
    fn reap_children(&self) {}
}

/// Result of [`drain_on_exit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every root was destroyed.
    Drained,
    /// The deadline passed with roots still alive.
    TimedOut { live: usize },
}

/// Cancel and forget every root, then persist the (now empty) state.
///
/// Returns the paths that were being watched.
pub fn stop_all_and_persist(registry: &RootRegistry, store: Option<&StateStore>) -> Vec<PathBuf> {
    let roots = registry.take_all();

    let mut stopped = Vec::with_capacity(roots.len());
    for (path, root) in roots {
        if root.cancel() {
            debug!("stopped {}", path.display());
        }
        root.release();
        stopped.push(path);
    }

    if let Some(store) = store {
        if let Err(e) = store.save(&save_state(registry)) {
            error!("failed to save state: {e}");
        }
    }

    info!("stopped {} roots", stopped.len());
    stopped
}

/// Cancel every root and wait, within `drain.deadline()`, for all of them
/// to be destroyed.
///
/// Roots still referenced elsewhere keep the count above zero; in that case
/// an error is logged and the remaining count is returned.
pub fn drain_on_exit(
    registry: &RootRegistry,
    reaper: &dyn ProcessReaper,
    drain: &DrainConfig,
) -> DrainOutcome {
    reaper.reap_children();

    let roots = registry.take_all();
    for (_, root) in &roots {
        if !root.cancel() {
            root.signal_threads();
        }
    }
    drop(roots);

    let live_roots = registry.live_roots();
    let started = Instant::now();
    let mut interval = drain.initial_interval();
    let mut last_count = live_roots.get();

    loop {
        let elapsed = started.elapsed();
        if elapsed >= drain.deadline() {
            break;
        }

        let wait = interval.min(drain.deadline() - elapsed);
        if live_roots.wait_for_zero(wait) {
            debug!("all roots are gone");
            return DrainOutcome::Drained;
        }

        let count = live_roots.get();
        if count != last_count {
            debug!("waiting for {count} roots to go away");
            last_count = count;
        }
        interval = (interval * 2).min(drain.max_interval());
    }

    let live = live_roots.get();
    if live == 0 {
        debug!("all roots are gone");
        return DrainOutcome::Drained;
    }
    error!("{live} roots were still live at exit");
    DrainOutcome::TimedOut { live }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;
    use crate::config::{FileConfigLoader, ServiceConfig};
    use crate::root::LifecycleStatus;
    use crate::trigger::TriggerCommand;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn registry() -> RootRegistry {
        RootRegistry::new(
            ServiceConfig::default(),
            Arc::new(NullBackend),
            Arc::new(FileConfigLoader),
        )
    }

    #[derive(Default)]
    struct RecordingReaper(AtomicBool);

    impl ProcessReaper for RecordingReaper {
        fn reap_children(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_stop_all_cancels_and_persists_empty_state() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("a")).unwrap();
        std::fs::create_dir(temp_dir.path().join("b")).unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));
        let registry = registry();

        let (a, _) = registry.create_or_get(temp_dir.path().join("a")).unwrap();
        let (b, _) = registry.create_or_get(temp_dir.path().join("b")).unwrap();
        a.triggers_mut()
            .install(TriggerCommand::parse(json!({"name": "t", "command": ["x"]})).unwrap());

        let mut stopped = stop_all_and_persist(&registry, Some(&store));
        stopped.sort();

        assert_eq!(stopped, vec![a.path().to_path_buf(), b.path().to_path_buf()]);
        assert!(registry.is_empty());
        assert_eq!(a.status(), LifecycleStatus::Cancelled);
        assert_eq!(b.status(), LifecycleStatus::Cancelled);
        assert_eq!(a.ref_count(), 1);
        assert!(store.load().unwrap().unwrap().watched.is_empty());
    }

    #[test]
    fn test_drain_after_all_handles_released() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry();
        let reaper = RecordingReaper::default();
        let (root, _) = registry.create_or_get(temp_dir.path()).unwrap();
        root.release();

        let outcome = drain_on_exit(&registry, &reaper, &DrainConfig::default());

        assert_eq!(outcome, DrainOutcome::Drained);
        assert!(reaper.0.load(Ordering::SeqCst));
        assert_eq!(registry.live_roots().get(), 0);
    }

    #[test]
    #[traced_test]
    fn test_drain_gives_up_on_leaked_root() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry();
        let (leaked, _) = registry.create_or_get(temp_dir.path()).unwrap();
        let drain = DrainConfig::with_deadline(Duration::from_millis(50));

        let started = Instant::now();
        let outcome = drain_on_exit(&registry, &NoopReaper, &drain);

        assert_eq!(outcome, DrainOutcome::TimedOut { live: 1 });
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(leaked.is_cancelled());
        assert!(logs_contain("roots were still live at exit"));

        assert!(leaked.release());
        assert_eq!(registry.live_roots().get(), 0);
    }

    #[test]
    fn test_drain_waits_for_late_release() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry();
        let (held, _) = registry.create_or_get(temp_dir.path()).unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            held.release()
        });
        let drain = DrainConfig::with_deadline(Duration::from_secs(10));
        let outcome = drain_on_exit(&registry, &NoopReaper, &drain);

        assert_eq!(outcome, DrainOutcome::Drained);
        assert!(releaser.join().unwrap());
    }
}
