use trace_scope::lifecycle::tracing::try_setup_tracing;
use trace_scope::lifecycle::{global, init, init_global, install_global, ScopeSystem};
use trace_scope::mock::span;
use trace_scope::runtime::{EventLoop, RuntimeCapabilities};
use trace_scope::{BackendKind, ScopeConfig};

/// The process-wide slot keeps the first scope it is given.
#[test]
fn test_global_scope_is_first_wins() {
    let _ = try_setup_tracing();
    let runtime = EventLoop::new();

    let first = install_global(init(
        ScopeConfig::with_backend(BackendKind::SyncStack),
        Some(&runtime),
    ));
    let second = install_global(init(
        ScopeConfig::with_backend(BackendKind::Noop),
        Some(&runtime),
    ));
    let from_env = init_global(Some(&runtime));

    assert_eq!(first.kind(), BackendKind::SyncStack);
    assert!(std::ptr::eq(first, second));
    assert!(std::ptr::eq(first, from_env));
    assert!(global().is_some_and(|scope| std::ptr::eq(scope, first)));

    let (ctx, _) = span("request");
    assert_eq!(first.activate(ctx.clone(), || global().and_then(|s| s.active())), Some(ctx));
}

/// A runtime without any propagation primitive still yields a usable scope.
#[test]
fn test_bare_runtime_starts_with_the_noop_backend() {
    let _ = try_setup_tracing();
    let runtime = EventLoop::with_capabilities(RuntimeCapabilities::NONE);

    let system = ScopeSystem::new(ScopeConfig::default(), Some(&runtime));
    assert_eq!(system.requested(), BackendKind::Noop);
    assert!(!system.is_degraded());

    let forced = ScopeSystem::new(
        ScopeConfig::with_backend(BackendKind::AsyncLocalStorage),
        Some(&runtime),
    );
    assert!(forced.is_degraded());

    let (ctx, _) = span("request");
    assert_eq!(forced.scope().activate(ctx, || forced.scope().active()), None);
    forced.shutdown();
    system.shutdown();
}
