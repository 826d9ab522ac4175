//! # Scope
//!
//! The façade instrumentation code talks to. A `Scope` wraps one
//! [`ContextStorage`] backend and adds the operations tracing needs on top of
//! raw storage:
//!
//! - [`Scope::active`] / [`Scope::activate`]: read and set the current context.
//! - [`Scope::bind`] / [`Scope::unbind`]: make callbacks, promises and emitters
//!   re-enter a context later, and undo that exactly.
//! - [`Scope::bind_future`] / [`Scope::spawn`]: the same for Rust futures.
//!
//! ## Binding
//!
//! `bind` dispatches on what the target is. Callbacks are wrapped. Objects are
//! probed through [`Bindable`] and every capability they report is bound, so a
//! value that is both a promise and an emitter gets both adapters. Anything
//! else comes back untouched.
//!
//! When no context is given, the active one is used: it is captured at bind
//! time for callbacks, each time `then` is called for promises, and each time
//! a listener is added for emitters.
//!
//! ```rust
//! use trace_scope::mock::span;
//! use trace_scope::storage::SyncStackStorage;
//! use trace_scope::{Callback, Scope};
//! use std::sync::Arc;
//!
//! let scope = Scope::new(Arc::new(SyncStackStorage::new()));
//! let (request, _) = span("request");
//!
//! let active = scope.activate(request.clone(), || scope.active());
//! assert_eq!(active, Some(request.clone()));
//!
//! let report = Callback::new({
//!     let scope = scope.clone();
//!     move |_: ()| scope.active()
//! });
//! let bound = scope.bind_callback(&report, Some(request.clone()));
//! assert_eq!(bound.call(()), Some(request));
//! assert!(scope.unbind_callback(&bound).ptr_eq(&report));
//! ```

use crate::binder::future::Bound;
use crate::binder::{emitter, promise};
use crate::context::{ActiveContext, Failure};
use crate::runtime::{panic_message, Callback, EventEmitter, Payload, Promise};
use crate::storage::{BackendKind, ContextStorage, StorageExt};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Capability probe for objects handed to [`Scope::bind`].
///
/// # Provided Methods
/// Both probes return `None` by default. Implement the ones your type supports.
pub trait Bindable: Send + Sync {
    /// The promise whose `then` should be bound.
    fn as_thenable(&self) -> Option<&Promise> {
        None
    }

    /// The emitter whose listener methods should be bound.
    fn as_emitter(&self) -> Option<&EventEmitter> {
        None
    }
}

impl Bindable for Promise {
    fn as_thenable(&self) -> Option<&Promise> {
        Some(self)
    }
}

impl Bindable for EventEmitter {
    fn as_emitter(&self) -> Option<&EventEmitter> {
        Some(self)
    }
}

/// Anything that can be passed to [`Scope::bind`].
pub enum Target<A = Payload, R = ()> {
    Callback(Callback<A, R>),
    Object(Arc<dyn Bindable>),
    /// A plain value. Binding leaves it as is.
    Value(Payload),
}

impl<A: 'static, R: 'static> Target<A, R> {
    pub fn as_callback(&self) -> Option<&Callback<A, R>> {
        match self {
            Target::Callback(callback) => Some(callback),
            _ => None,
        }
    }

    pub fn into_callback(self) -> Option<Callback<A, R>> {
        match self {
            Target::Callback(callback) => Some(callback),
            _ => None,
        }
    }
}

impl<A, R> fmt::Debug for Target<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Callback(callback) => f.debug_tuple("Callback").field(callback).finish(),
            Target::Object(_) => f.write_str("Object(..)"),
            Target::Value(_) => f.write_str("Value(..)"),
        }
    }
}

impl<A, R> From<Callback<A, R>> for Target<A, R> {
    fn from(callback: Callback<A, R>) -> Self {
        Target::Callback(callback)
    }
}

/// The context-propagation façade over one storage backend.
#[derive(Clone)]
pub struct Scope {
    storage: Arc<dyn ContextStorage>,
}

impl Scope {
    pub fn new(storage: Arc<dyn ContextStorage>) -> Self {
        Self { storage }
    }

    pub fn kind(&self) -> BackendKind {
        self.storage.kind()
    }

    pub fn storage(&self) -> &Arc<dyn ContextStorage> {
        &self.storage
    }

    // --- Activation ---

    /// The context of the current flow, `None` when nothing is active.
    pub fn active(&self) -> Option<ActiveContext> {
        self.storage.get_store()
    }

    /// Runs `f` with `ctx` active, restoring the previous context afterwards.
    ///
    /// If `f` panics, `ctx` is tagged with [`Failure::Panic`] once the previous
    /// context is back in place, and the panic continues unchanged.
    pub fn activate<R>(&self, ctx: impl Into<Option<ActiveContext>>, f: impl FnOnce() -> R) -> R {
        let ctx = ctx.into();
        let tagged = ctx.clone();
        match catch_unwind(AssertUnwindSafe(|| self.storage.run(ctx, f))) {
            Ok(result) => result,
            Err(panic) => {
                if let Some(ctx) = &tagged {
                    let message = panic_message(panic.as_ref());
                    ctx.tag_error(&Failure::Panic(&message));
                }
                resume_unwind(panic)
            }
        }
    }

    /// Like [`Scope::activate`] for fallible work: an `Err` tags `ctx` with
    /// [`Failure::Error`] and is returned unchanged.
    pub fn try_activate<T, E>(
        &self,
        ctx: impl Into<Option<ActiveContext>>,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: std::error::Error + 'static,
    {
        let ctx = ctx.into();
        let tagged = ctx.clone();
        let result = self.activate(ctx, f);
        if let (Err(error), Some(ctx)) = (&result, &tagged) {
            ctx.tag_error(&Failure::Error(error));
        }
        result
    }

    /// Makes `ctx` current for the rest of the current execution.
    pub fn enter_with(&self, ctx: impl Into<Option<ActiveContext>>) {
        self.storage.enter_with(ctx.into());
    }

    // --- Binding ---

    /// Binds `target` to `ctx`, or to the active context when `None`.
    pub fn bind<A: 'static, R: 'static>(
        &self,
        target: Target<A, R>,
        ctx: Option<ActiveContext>,
    ) -> Target<A, R> {
        match target {
            Target::Callback(callback) => Target::Callback(self.bind_callback(&callback, ctx)),
            Target::Object(object) => {
                if let Some(promise) = object.as_thenable() {
                    self.bind_promise(promise, ctx.clone());
                }
                if let Some(emitter) = object.as_emitter() {
                    self.bind_emitter(emitter, ctx);
                }
                Target::Object(object)
            }
            value @ Target::Value(_) => value,
        }
    }

    /// Reverses [`Scope::bind`]. Unbinding something that is not bound is a no-op.
    pub fn unbind<A: 'static, R: 'static>(&self, target: Target<A, R>) -> Target<A, R> {
        match target {
            Target::Callback(callback) => Target::Callback(self.unbind_callback(&callback)),
            Target::Object(object) => {
                if let Some(promise) = object.as_thenable() {
                    self.unbind_promise(promise);
                }
                if let Some(emitter) = object.as_emitter() {
                    self.unbind_emitter(emitter);
                }
                Target::Object(object)
            }
            value @ Target::Value(_) => value,
        }
    }

    /// Returns a callback that runs `callback` with `ctx` (or the context
    /// active now) active. Bound callbacks are returned as they are.
    pub fn bind_callback<A: 'static, R: 'static>(
        &self,
        callback: &Callback<A, R>,
        ctx: Option<ActiveContext>,
    ) -> Callback<A, R> {
        let captured = ctx.or_else(|| self.active());
        self.wrap_callback(callback, captured)
    }

    /// The callback a bound callback was made from, or `callback` itself.
    pub fn unbind_callback<A: 'static, R: 'static>(
        &self,
        callback: &Callback<A, R>,
    ) -> Callback<A, R> {
        callback
            .unbound()
            .cloned()
            .unwrap_or_else(|| callback.clone())
    }

    /// Binds `callback` to exactly `captured`, with no fallback to the active context.
    pub(crate) fn wrap_callback<A: 'static, R: 'static>(
        &self,
        callback: &Callback<A, R>,
        captured: Option<ActiveContext>,
    ) -> Callback<A, R> {
        if callback.is_bound() {
            return callback.clone();
        }
        let scope = self.clone();
        let original = callback.clone();
        Callback::wrapping(callback, move |args| {
            scope.activate(captured.clone(), || original.call(args))
        })
    }

    pub fn bind_promise(&self, target: &Promise, ctx: Option<ActiveContext>) {
        promise::bind_promise(self, target, ctx);
    }

    pub fn unbind_promise(&self, target: &Promise) {
        promise::unbind_promise(target);
    }

    pub fn bind_emitter(&self, target: &EventEmitter, ctx: Option<ActiveContext>) {
        emitter::bind_emitter(self, target, ctx);
    }

    pub fn unbind_emitter(&self, target: &EventEmitter) {
        emitter::unbind_emitter(target);
    }

    // --- Futures ---

    /// Wraps `future` so every poll runs with `ctx` (or the context active
    /// now) active.
    pub fn bind_future<F: Future>(&self, future: F, ctx: Option<ActiveContext>) -> Bound<F> {
        let captured = ctx.or_else(|| self.active());
        Bound::new(future, captured, self.storage.clone())
    }

    /// Spawns `future` on tokio, carrying the active context into the task.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(self.bind_future(future, None))
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("backend", &self.kind())
            .field("enabled", &self.storage.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{name_of, span, PlainContext};
    use crate::storage::{NoopStorage, SyncStackStorage};
    use std::panic::catch_unwind;

    fn scope() -> Scope {
        Scope::new(Arc::new(SyncStackStorage::new()))
    }

    #[derive(Debug, thiserror::Error)]
    #[error("query failed")]
    struct QueryFailed;

    #[test]
    fn activate_returns_the_closure_result() {
        let scope = scope();
        let (a, _) = span("a");

        assert_eq!(scope.activate(a.clone(), || scope.active()), Some(a));
        assert_eq!(scope.active(), None);
    }

    #[test]
    fn panics_tag_the_context_after_restoring() {
        let scope = scope();
        let (outer, outer_span) = span("outer");
        let (inner, inner_span) = span("inner");

        scope.activate(outer.clone(), || {
            let result = catch_unwind(AssertUnwindSafe(|| {
                scope.activate(inner.clone(), || panic!("db down"))
            }));
            assert!(result.is_err());
            assert_eq!(scope.active(), Some(outer.clone()));
        });

        assert_eq!(inner_span.errors(), vec!["panic: db down".to_string()]);
        assert!(outer_span.errors().is_empty());
    }

    #[test]
    fn errors_tag_the_context_and_pass_through() {
        let scope = scope();
        let (ctx, span) = span("query");

        let result: Result<(), QueryFailed> = scope.try_activate(ctx, || Err(QueryFailed));

        assert!(result.is_err());
        assert_eq!(span.errors(), vec!["query failed".to_string()]);
    }

    #[test]
    fn contexts_without_tagging_still_activate() {
        let scope = scope();
        let ctx = ActiveContext::new(PlainContext("plain"));
        let result = catch_unwind(AssertUnwindSafe(|| scope.activate(ctx, || panic!("x"))));
        assert!(result.is_err());
        assert_eq!(scope.active(), None);
    }

    #[test]
    fn bound_callbacks_reenter_their_context() {
        let scope = scope();
        let (a, _) = span("a");
        let (b, _) = span("b");
        let report = Callback::new({
            let scope = scope.clone();
            move |_: ()| name_of(scope.active().as_ref())
        });

        let bound = scope.activate(a, || scope.bind_callback(&report, None));
        let result = scope.activate(b, || bound.call(()));

        assert_eq!(result.as_deref(), Some("a"));
    }

    #[test]
    fn binding_is_idempotent_and_reversible() {
        let scope = scope();
        let (a, _) = span("a");
        let (b, _) = span("b");
        let f: Callback<(), ()> = Callback::new(|_| ());

        let bound = scope.bind_callback(&f, Some(a));
        let again = scope.bind_callback(&bound, Some(b));

        assert!(again.ptr_eq(&bound));
        assert!(scope.unbind_callback(&bound).ptr_eq(&f));
        assert!(scope.unbind_callback(&f).ptr_eq(&f));
    }

    #[test]
    fn plain_values_pass_through_bind() {
        let scope = scope();
        let value = crate::runtime::payload(42u32);
        let target: Target = scope.bind(Target::Value(value.clone()), None);

        match target {
            Target::Value(returned) => assert!(Arc::ptr_eq(&returned, &value)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn noop_scope_never_reports_a_context() {
        let scope = Scope::new(Arc::new(NoopStorage::new()));
        let (a, _) = span("a");

        assert_eq!(scope.activate(a.clone(), || scope.active()), None);
        scope.enter_with(a);
        assert_eq!(scope.active(), None);
    }
}
