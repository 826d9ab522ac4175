use crate::config::ScopeConfig;
use crate::error::ScopeError;
use crate::runtime::EventLoop;
use crate::scope::Scope;
use crate::storage::{
    BackendKind, ContextStorage, HookStorage, NativeStorage, NoopStorage, SyncStackStorage,
    ZoneStorage,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Start-up orchestration for the context engine.
///
/// `ScopeSystem` is responsible for:
/// - **Backend Resolution**: explicit configuration first, then probing the runtime
/// - **Graceful Degradation**: any backend that cannot start is replaced by the no-op one
/// - **Teardown**: detaching hooks and interceptors on shutdown
///
/// # Example
///
/// ```rust
/// use trace_scope::lifecycle::ScopeSystem;
/// use trace_scope::runtime::EventLoop;
/// use trace_scope::{BackendKind, ScopeConfig};
///
/// let runtime = EventLoop::new();
/// let system = ScopeSystem::new(ScopeConfig::default(), Some(&runtime));
/// assert_eq!(system.scope().kind(), BackendKind::AsyncLocalStorage);
/// system.shutdown();
/// ```
#[derive(Debug)]
pub struct ScopeSystem {
    scope: Scope,
    requested: BackendKind,
}

impl ScopeSystem {
    /// Resolves and constructs the backend. Never fails.
    pub fn new(config: ScopeConfig, runtime: Option<&EventLoop>) -> Self {
        let requested = config.backend.unwrap_or_else(|| probe(runtime));
        let storage = match build_backend(requested, runtime) {
            Ok(storage) => {
                info!(backend = %requested, explicit = config.backend.is_some(), "Scope backend selected");
                storage
            }
            Err(error) => {
                warn!(%error, backend = %requested, "Scope backend unavailable, falling back to noop");
                Arc::new(NoopStorage::new())
            }
        };
        Self {
            scope: Scope::new(storage),
            requested,
        }
    }

    /// Like [`ScopeSystem::new`] with the configuration read from `DD_TRACE_SCOPE`.
    ///
    /// A malformed value is logged and treated as unset.
    pub fn from_env(runtime: Option<&EventLoop>) -> Self {
        let config = ScopeConfig::from_env().unwrap_or_else(|error| {
            warn!(%error, "Ignoring scope configuration");
            ScopeConfig::default()
        });
        Self::new(config, runtime)
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn into_scope(self) -> Scope {
        self.scope
    }

    /// The backend that was asked for, before any fallback.
    pub fn requested(&self) -> BackendKind {
        self.requested
    }

    /// Whether the requested backend could not start and no-op is in use.
    pub fn is_degraded(&self) -> bool {
        self.scope.kind() != self.requested
    }

    /// Detaches the backend from the runtime and releases its state.
    pub fn shutdown(self) {
        info!(backend = %self.scope.kind(), "Shutting down scope");
        self.scope.storage().disable();
    }
}

/// Picks the best backend the runtime supports: native, then hooks, then zone.
///
/// Without a runtime the native backend still works on plain threads and
/// futures, so it is chosen.
pub fn probe(runtime: Option<&EventLoop>) -> BackendKind {
    let Some(runtime) = runtime else {
        return BackendKind::AsyncLocalStorage;
    };
    let capabilities = runtime.capabilities();
    if capabilities.context_frames {
        BackendKind::AsyncLocalStorage
    } else if capabilities.async_hooks {
        BackendKind::AsyncHooks
    } else if capabilities.scheduler_patching {
        BackendKind::Zone
    } else {
        BackendKind::Noop
    }
}

/// Constructs the backend of `kind` against `runtime`.
pub fn build_backend(
    kind: BackendKind,
    runtime: Option<&EventLoop>,
) -> Result<Arc<dyn ContextStorage>, ScopeError> {
    let storage: Arc<dyn ContextStorage> = match kind {
        BackendKind::SyncStack => Arc::new(SyncStackStorage::new()),
        BackendKind::AsyncHooks => Arc::new(HookStorage::new(require(runtime, "async_hooks")?)?),
        BackendKind::AsyncLocalStorage => Arc::new(NativeStorage::new(runtime)?),
        BackendKind::Zone => Arc::new(ZoneStorage::new(require(runtime, "scheduler_patching")?)?),
        BackendKind::Noop => Arc::new(NoopStorage::new()),
    };
    Ok(storage)
}

fn require<'a>(
    runtime: Option<&'a EventLoop>,
    capability: &'static str,
) -> Result<&'a EventLoop, ScopeError> {
    runtime.ok_or(ScopeError::Unsupported { capability })
}

/// Builds a [`Scope`] from `config`, degrading to no-op when needed.
pub fn init(config: ScopeConfig, runtime: Option<&EventLoop>) -> Scope {
    ScopeSystem::new(config, runtime).into_scope()
}
