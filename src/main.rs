//! # Trace Scope Demo
//!
//! Runs two interleaved "requests" through the event loop and shows that each
//! callback, promise reaction and listener sees its own request.
//!
//! ```bash
//! RUST_LOG=info cargo run
//! DD_TRACE_SCOPE=sync RUST_LOG=info cargo run   # watch propagation break
//! ```

use std::sync::Arc;
use std::time::Duration;
use trace_scope::lifecycle::tracing::setup_tracing;
use trace_scope::lifecycle::ScopeSystem;
use trace_scope::mock::{name_of, span};
use trace_scope::runtime::{payload, Handler, Listener};
use trace_scope::{EventEmitter, EventLoop, Promise, Scope};
use tracing::{info, warn};

fn report(scope: &Scope, step: &'static str) {
    info!(step, request = ?name_of(scope.active().as_ref()), "Callback ran");
}

fn handle_request(scope: &Scope, runtime: &EventLoop, socket: &EventEmitter, name: &str, delay: u64) {
    let (ctx, _) = span(name);
    scope.activate(ctx, || {
        report(scope, "handler");

        let timer_scope = scope.clone();
        runtime.set_timeout(Duration::from_millis(delay), move || {
            report(&timer_scope, "timeout")
        });

        let query = Promise::new(runtime);
        let then_scope = scope.clone();
        query.then(
            Some(Handler::new(move |rows| {
                report(&then_scope, "query.then");
                rows
            })),
            None,
        );
        let resolver = query.clone();
        runtime.set_timeout(Duration::from_millis(delay * 2), move || {
            resolver.resolve(payload(vec!["alice", "bob"]));
        });

        let listener_scope = scope.clone();
        socket.once(
            "data",
            Listener::new(move |_| report(&listener_scope, "socket.data")),
        );
    });
}

#[tokio::main]
async fn main() -> Result<(), String> {
    setup_tracing();

    let runtime = EventLoop::new();
    let system = ScopeSystem::from_env(Some(&runtime));
    let scope = system.scope().clone();
    info!(backend = %scope.kind(), "Starting demo");
    if !scope.kind().propagates_async() {
        warn!(backend = %scope.kind(), "Backend does not cross async boundaries");
    }

    // Shared socket: listeners are bound to the request that registered them.
    let socket = EventEmitter::new();
    scope.bind_emitter(&socket, None);

    handle_request(&scope, &runtime, &socket, "GET /users", 20);
    handle_request(&scope, &runtime, &socket, "GET /orders", 10);

    let emitter = socket.clone();
    runtime.set_timeout(Duration::from_millis(50), move || {
        emitter.emit("data", payload("chunk"));
    });

    let ran = runtime.run_until_idle();
    info!(ran, elapsed = ?runtime.now(), "Event loop drained");

    // Futures carry the context across await points and worker threads.
    let (ctx, _) = span("background job");
    let probe = Arc::new(scope.clone());
    let handle = scope.activate(ctx, || {
        let probe = probe.clone();
        scope.spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            name_of(probe.active().as_ref())
        })
    });
    let seen = handle.await.map_err(|e| e.to_string())?;
    info!(request = ?seen, "Spawned task finished");

    system.shutdown();
    Ok(())
}
