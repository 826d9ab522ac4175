//! # Continuation-Local Storage
//!
//! One value per logical flow, carried across every asynchronous hop the
//! runtime makes. Each backend in this module implements [`ContextStorage`]
//! with a different propagation mechanism; exactly one is chosen at start-up
//! (see [`crate::lifecycle`]) and injected into [`crate::Scope`].
//!
//! | Backend | Mechanism | Crosses async hops |
//! |---------|-----------|--------------------|
//! | [`SyncStackStorage`] | thread-local push/pop | no |
//! | [`HookStorage`] | lifecycle hooks with copy-down on `init` | yes |
//! | [`NativeStorage`] | runtime continuation frame | yes |
//! | [`ZoneStorage`] | forked zone per activation, scheduler interception | yes |
//! | [`NoopStorage`] | nothing | n/a |
//!
//! ## Contract
//!
//! - `run(store, f)` makes `store` current for `f` and everything it schedules,
//!   and restores the previous store when `f` returns or panics.
//! - `enter_with(store)` makes `store` current for the rest of the current
//!   execution. Nothing restores it.
//! - After `disable()`, `get_store()` is `None` until `enable()`.

pub(crate) mod local;

pub mod hooks;
pub mod native;
pub mod noop;
pub mod sync_stack;
pub mod zone;

pub use hooks::HookStorage;
pub use native::NativeStorage;
pub use noop::NoopStorage;
pub use sync_stack::SyncStackStorage;
pub use zone::{Zone, ZoneStorage};

use crate::context::ActiveContext;
use crate::error::ScopeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The propagation strategy behind a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[serde(rename = "sync")]
    SyncStack,
    AsyncHooks,
    AsyncLocalStorage,
    Zone,
    Noop,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::SyncStack,
        BackendKind::AsyncHooks,
        BackendKind::AsyncLocalStorage,
        BackendKind::Zone,
        BackendKind::Noop,
    ];

    /// The configuration value naming this backend.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::SyncStack => "sync",
            BackendKind::AsyncHooks => "async_hooks",
            BackendKind::AsyncLocalStorage => "async_local_storage",
            BackendKind::Zone => "zone",
            BackendKind::Noop => "noop",
        }
    }

    /// Whether values survive asynchronous hops with this backend.
    pub fn propagates_async(self) -> bool {
        matches!(
            self,
            BackendKind::AsyncHooks | BackendKind::AsyncLocalStorage | BackendKind::Zone
        )
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ScopeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| ScopeError::UnknownBackend(value.to_string()))
    }
}

/// A continuation-local storage backend.
///
/// The trait is object safe; use [`StorageExt::run`] for the typed form of
/// [`ContextStorage::run_dyn`].
pub trait ContextStorage: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// The store of the flow executing on this thread.
    fn get_store(&self) -> Option<ActiveContext>;

    /// Runs `f` with `store` current, restoring the previous store afterwards.
    fn run_dyn(&self, store: Option<ActiveContext>, f: &mut dyn FnMut());

    /// Sets the store for the remainder of the current execution.
    fn enter_with(&self, store: Option<ActiveContext>);

    /// (Re)attaches to the runtime.
    fn enable(&self) -> Result<(), ScopeError>;

    /// Detaches from the runtime and releases all tracked state.
    fn disable(&self);

    fn is_enabled(&self) -> bool;
}

/// Typed entry point over [`ContextStorage::run_dyn`].
pub trait StorageExt {
    fn run<R>(&self, store: Option<ActiveContext>, f: impl FnOnce() -> R) -> R;
}

impl<S: ContextStorage + ?Sized> StorageExt for S {
    fn run<R>(&self, store: Option<ActiveContext>, f: impl FnOnce() -> R) -> R {
        let mut f = Some(f);
        let mut result = None;
        self.run_dyn(store, &mut || {
            if let Some(f) = f.take() {
                result = Some(f());
            }
        });
        match (result, f) {
            (Some(result), _) => result,
            // The backend returned without calling back; run unscoped.
            (None, Some(f)) => f(),
            (None, None) => unreachable!("closure consumed without producing a result"),
        }
    }
}
