//! # Watch Roots
//!
//! This crate owns the lifecycle of watched directory trees ("roots") for
//! the Codex file watching service: creating them, sharing them between
//! clients, tearing them down, and saving the watched set across restarts.
//!
//! ## Features
//!
//! - **Counted Roots**: Roots are shared through handles and destroyed once
//! - **Registry**: One root per normalized path, with enclosing-root lookup
//! - **Rebuildable Sessions**: Tree view and watcher can be rebuilt in place
//! - **Triggers**: Per-root command definitions, persisted verbatim
//! - **Bounded Shutdown**: Cancel everything and wait with a deadline
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Watch Roots                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  RootRegistry ──► RootHandle ──► Root ──► Session              │
//! │       │                           │          │                  │
//! │       ▼                           ▼          ▼                  │
//! │  StateStore                  TriggerTable  WatcherBackend       │
//! │  (save / load)               IgnoreSet     PendingCollection    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod ignore;
pub mod pending;
pub mod registry;
pub mod root;
pub mod shutdown;
pub mod state;
pub mod trigger;

pub use backend::{NotifyBackend, NullBackend, WatcherBackend, WatcherHandle};
pub use config::{ConfigLoader, DrainConfig, FileConfigLoader, RootSettings, ServiceConfig};
pub use error::{Result, WatchError};
pub use ignore::IgnoreSet;
pub use pending::{ChangeKind, PendingChange, PendingCollection};
pub use registry::{EnclosingRoot, RootRegistry, RootResolver};
pub use root::{LifecycleStatus, LiveRootCounter, Root, RootHandle, RootIdentity};
pub use shutdown::{DrainOutcome, NoopReaper, ProcessReaper, drain_on_exit, stop_all_and_persist};
pub use state::{
    LoadSummary, PersistedState, RejectedEntry, StateStore, WatchedEntry, load_state, save_state,
};
pub use trigger::{StdinStyle, TriggerCommand, TriggerTable};
