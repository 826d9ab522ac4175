//! Promise binder.
//!
//! Replaces the promise's `then` with a wrapper that binds each handler before
//! delegating. With an explicit context every handler is bound to it;
//! otherwise each handler is bound to whatever is active when `then` is
//! called, so the settling flow never leaks into the handlers.

use crate::context::ActiveContext;
use crate::error::ScopeError;
use crate::runtime::{Handler, Marker, Promise, ThenMethod};
use crate::scope::Scope;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub(crate) fn bind_promise(scope: &Scope, promise: &Promise, ctx: Option<ActiveContext>) {
    let scope = scope.clone();
    let installed = promise
        .then_slot()
        .wrap(Marker::PromiseBinder, move |original: ThenMethod| -> ThenMethod {
            Arc::new(
                move |promise: &Promise,
                      on_fulfilled: Option<Handler>,
                      on_rejected: Option<Handler>| {
                    let captured = ctx.clone().or_else(|| scope.active());
                    let bind = |handler: Option<Handler>| {
                        handler.map(|handler| scope.wrap_callback(&handler, captured.clone()))
                    };
                    original(promise, bind(on_fulfilled), bind(on_rejected))
                },
            )
        });

    match installed {
        Ok(()) => debug!("Promise bound"),
        Err(ScopeError::AlreadyInstalled) => trace!("Promise already bound"),
        Err(error) => warn!(%error, "Promise binding failed"),
    }
}

pub(crate) fn unbind_promise(promise: &Promise) {
    match promise.then_slot().restore(Marker::PromiseBinder) {
        Ok(true) => debug!("Promise unbound"),
        Ok(false) => trace!("Promise was not bound"),
        Err(error) => warn!(%error, "Promise unbinding failed"),
    }
}
