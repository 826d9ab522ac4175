//! # Start-Up & Lifecycle
//!
//! Choosing a backend happens once, when the agent starts. This module turns a
//! [`ScopeConfig`] into a ready [`Scope`] and owns the optional process-wide
//! slot instrumentation can reach without having the scope passed around.
//!
//! ## Resolution
//!
//! 1. **Explicit override**: `DD_TRACE_SCOPE` or `ScopeConfig::backend`.
//! 2. **Probe**: the best backend the runtime supports (native, hooks, zone).
//! 3. **Default**: no-op.
//!
//! A backend that cannot be constructed is logged with `warn!` and replaced by
//! the no-op backend. Start-up never fails.
//!
//! ## Process-Wide Slot
//!
//! [`install_global`] stores a scope for the whole process. The first scope to
//! be installed wins; later calls get the existing one back.
//!
//! ```rust
//! use trace_scope::lifecycle::{global, install_global, init};
//! use trace_scope::ScopeConfig;
//!
//! let scope = init(ScopeConfig::default(), None);
//! let installed = install_global(scope);
//! assert!(std::ptr::eq(installed, global().unwrap()));
//! ```

mod scope_system;
pub mod tracing;

pub use scope_system::{build_backend, init, probe, ScopeSystem};

use crate::runtime::EventLoop;
use crate::scope::Scope;
use std::sync::OnceLock;

static GLOBAL: OnceLock<Scope> = OnceLock::new();

/// Installs `scope` process-wide unless one is already installed, and returns
/// the installed scope.
pub fn install_global(scope: Scope) -> &'static Scope {
    let mut installed = false;
    let winner = GLOBAL.get_or_init(|| {
        installed = true;
        scope
    });
    if installed {
        ::tracing::info!(backend = %winner.kind(), "Global scope installed");
    } else {
        ::tracing::debug!(backend = %winner.kind(), "Global scope already installed");
    }
    winner
}

/// Builds the process-wide scope from the environment on first use.
pub fn init_global(runtime: Option<&EventLoop>) -> &'static Scope {
    GLOBAL.get_or_init(|| ScopeSystem::from_env(runtime).into_scope())
}

/// The process-wide scope, if one was installed.
pub fn global() -> Option<&'static Scope> {
    GLOBAL.get()
}
