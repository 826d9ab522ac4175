//! # Observability & Logging
//!
//! The engine logs through the `tracing` crate with structured fields. This
//! module installs a subscriber for binaries and tests that want to see those
//! logs.
//!
//! ## Configuration
//!
//! Log levels come from `RUST_LOG`. The compact formatter hides module paths
//! (`with_target(false)`); the `backend`, `unit` and `event` fields carry the
//! context instead.
//!
//! ```bash
//! # Backend selection and fallbacks
//! RUST_LOG=info cargo run
//!
//! # Binder installs, storage enable/disable, loop idles
//! RUST_LOG=debug cargo run
//!
//! # Every unit created and run, every copy-down
//! RUST_LOG=trace cargo run
//!
//! # Only the storage backends
//! RUST_LOG=trace_scope::storage=trace cargo run
//! ```
//!
//! ## What Gets Logged
//!
//! | Level | Events |
//! |-------|--------|
//! | `info` | backend selected, global scope installed, shutdown |
//! | `warn` | backend unavailable (fallback to no-op), failed binder install, poisoned slots |
//! | `debug` | storage enabled/disabled, binders installed/removed, event loop idle |
//! | `trace` | unit creation and execution, store copy-down, promise settlement, emits |
//!
//! With `RUST_LOG=info` a start-up on a runtime without hooks looks like:
//!
//! ```text
//! WARN Scope backend unavailable, falling back to noop error=Runtime does not support async_hooks backend=async_hooks
//! ```

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Panics if one is already installed.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}

/// Installs the global subscriber unless one is already installed.
///
/// Safe to call from every test.
pub fn try_setup_tracing() -> Result<(), TryInitError> {
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_test_writer()
        .finish()
        .try_init()
}
