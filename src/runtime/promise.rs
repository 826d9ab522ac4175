//! # Callback Promises
//!
//! A settle-once value with callback continuations, scheduled on the
//! [`EventLoop`]. Reactions are execution units created when `then` is called
//! (so their trigger is the flow that attached them) and queued as microtasks
//! when the promise settles.
//!
//! `then` dispatches through a [`MethodSlot`]. That slot is the seam the
//! promise binder wraps; nothing else about the promise changes when it is
//! bound.
//!
//! Handlers receive and return a type-erased [`Payload`]. A handler that
//! returns another `Promise` makes the derived promise follow it. A handler
//! that panics rejects the derived promise with the panic message.

use super::callback::Callback;
use super::slot::MethodSlot;
use super::{lock, panic_message, EventLoop, Task, UnitKind};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::{trace, warn};

/// A type-erased settlement value.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Wraps `value` as a [`Payload`].
pub fn payload<T: Any + Send + Sync>(value: T) -> Payload {
    Arc::new(value)
}

/// A fulfillment or rejection handler.
pub type Handler = Callback<Payload, Payload>;

/// Signature of the replaceable `then` method.
pub type ThenMethod =
    Arc<dyn Fn(&Promise, Option<Handler>, Option<Handler>) -> Promise + Send + Sync>;

/// How a promise settled.
#[derive(Clone)]
pub enum Outcome {
    Fulfilled(Payload),
    Rejected(Payload),
}

impl Outcome {
    pub fn value(&self) -> &Payload {
        match self {
            Outcome::Fulfilled(value) | Outcome::Rejected(value) => value,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Outcome::Fulfilled(_))
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Fulfilled(_) => f.write_str("Fulfilled(..)"),
            Outcome::Rejected(_) => f.write_str("Rejected(..)"),
        }
    }
}

struct Reaction {
    task: Task,
    outcome: Arc<Mutex<Option<Outcome>>>,
}

enum PromiseState {
    Pending(Vec<Reaction>),
    Settled(Outcome),
}

struct PromiseInner {
    runtime: EventLoop,
    state: Mutex<PromiseState>,
    then: MethodSlot<ThenMethod>,
}

/// A shared handle to one promise.
#[derive(Clone)]
pub struct Promise {
    inner: Arc<PromiseInner>,
}

impl Promise {
    /// Creates a pending promise scheduled on `runtime`.
    pub fn new(runtime: &EventLoop) -> Self {
        let native: ThenMethod = Arc::new(
            |promise: &Promise, on_fulfilled: Option<Handler>, on_rejected: Option<Handler>| {
                promise.attach(on_fulfilled, on_rejected)
            },
        );
        Self {
            inner: Arc::new(PromiseInner {
                runtime: runtime.clone(),
                state: Mutex::new(PromiseState::Pending(Vec::new())),
                then: MethodSlot::new("then", native),
            }),
        }
    }

    pub fn resolved(runtime: &EventLoop, value: Payload) -> Self {
        let promise = Self::new(runtime);
        promise.resolve(value);
        promise
    }

    pub fn rejected(runtime: &EventLoop, reason: Payload) -> Self {
        let promise = Self::new(runtime);
        promise.reject(reason);
        promise
    }

    /// Fulfills the promise, or follows `value` if it is itself a promise.
    ///
    /// Returns `false` if the promise had already settled.
    pub fn resolve(&self, value: Payload) -> bool {
        if self.is_settled() {
            return false;
        }
        if let Some(other) = value.downcast_ref::<Promise>() {
            if other.ptr_eq(self) {
                return self.settle(Outcome::Rejected(payload(
                    "promise resolved with itself".to_string(),
                )));
            }
            let (fulfil, reject) = (self.clone(), self.clone());
            other.attach(
                Some(Handler::new(move |value| {
                    fulfil.resolve(value.clone());
                    value
                })),
                Some(Handler::new(move |reason| {
                    reject.reject(reason.clone());
                    reason
                })),
            );
            return true;
        }
        self.settle(Outcome::Fulfilled(value))
    }

    pub fn reject(&self, reason: Payload) -> bool {
        self.settle(Outcome::Rejected(reason))
    }

    /// Attaches continuations through the (possibly wrapped) `then` method.
    pub fn then(&self, on_fulfilled: Option<Handler>, on_rejected: Option<Handler>) -> Promise {
        match self.inner.then.current() {
            Ok(method) => method(self, on_fulfilled, on_rejected),
            Err(error) => {
                warn!(%error, "Promise then slot unavailable, attaching natively");
                self.attach(on_fulfilled, on_rejected)
            }
        }
    }

    pub fn catch(&self, on_rejected: Handler) -> Promise {
        self.then(None, Some(on_rejected))
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match &*lock(&self.inner.state) {
            PromiseState::Settled(outcome) => Some(outcome.clone()),
            PromiseState::Pending(_) => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.outcome().is_some()
    }

    /// The replaceable `then` method.
    pub fn then_slot(&self) -> &MethodSlot<ThenMethod> {
        &self.inner.then
    }

    pub fn runtime(&self) -> &EventLoop {
        &self.inner.runtime
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The native `then`: creates the reaction unit now, runs it on settlement.
    fn attach(&self, on_fulfilled: Option<Handler>, on_rejected: Option<Handler>) -> Promise {
        let derived = Promise::new(&self.inner.runtime);
        let outcome: Arc<Mutex<Option<Outcome>>> = Arc::new(Mutex::new(None));

        let job = {
            let outcome = outcome.clone();
            let derived = derived.clone();
            move || {
                let Some(outcome) = lock(&outcome).take() else {
                    return;
                };
                let handler = match &outcome {
                    Outcome::Fulfilled(_) => on_fulfilled,
                    Outcome::Rejected(_) => on_rejected,
                };
                let Some(handler) = handler else {
                    // No handler for this branch: pass the outcome through.
                    derived.settle(outcome);
                    return;
                };
                let value = outcome.value().clone();
                match catch_unwind(AssertUnwindSafe(|| handler.call(value))) {
                    Ok(result) => {
                        derived.resolve(result);
                    }
                    Err(panic) => {
                        derived.reject(payload(panic_message(panic.as_ref())));
                    }
                }
            }
        };

        let task = self
            .inner
            .runtime
            .prepare(UnitKind::PromiseReaction, Box::new(job));
        let reaction = Reaction { task, outcome };

        let ready = {
            let mut state = lock(&self.inner.state);
            match &mut *state {
                PromiseState::Pending(reactions) => {
                    reactions.push(reaction);
                    None
                }
                PromiseState::Settled(settled) => Some((reaction, settled.clone())),
            }
        };
        if let Some((reaction, settled)) = ready {
            self.fire(reaction, settled);
        }
        derived
    }

    fn settle(&self, outcome: Outcome) -> bool {
        let reactions = {
            let mut state = lock(&self.inner.state);
            match &mut *state {
                PromiseState::Settled(_) => return false,
                PromiseState::Pending(reactions) => {
                    let reactions = std::mem::take(reactions);
                    *state = PromiseState::Settled(outcome.clone());
                    reactions
                }
            }
        };
        trace!(
            fulfilled = outcome.is_fulfilled(),
            reactions = reactions.len(),
            "Promise settled"
        );
        for reaction in reactions {
            self.fire(reaction, outcome.clone());
        }
        true
    }

    fn fire(&self, reaction: Reaction, outcome: Outcome) {
        *lock(&reaction.outcome) = Some(outcome);
        self.inner.runtime.enqueue_microtask(reaction.task);
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("outcome", &self.outcome())
            .field("then", &self.inner.then.wrapped_by())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read<T: Clone + 'static>(value: &Payload) -> T {
        value.downcast_ref::<T>().cloned().expect("payload type")
    }

    #[test]
    fn then_runs_after_resolution_as_a_microtask() {
        let runtime = EventLoop::new();
        let promise = Promise::new(&runtime);
        let seen = Arc::new(Mutex::new(None));

        let s = seen.clone();
        promise.then(
            Some(Handler::new(move |value| {
                *lock(&s) = Some(read::<u32>(&value));
                value
            })),
            None,
        );

        assert_eq!(runtime.run_until_idle(), 0);
        promise.resolve(payload(7u32));
        assert_eq!(runtime.run_until_idle(), 1);
        assert_eq!(*lock(&seen), Some(7));
    }

    #[test]
    fn chained_handlers_transform_values() {
        let runtime = EventLoop::new();
        let derived = Promise::resolved(&runtime, payload(2u32))
            .then(
                Some(Handler::new(|value| payload(read::<u32>(&value) * 10))),
                None,
            )
            .then(
                Some(Handler::new(|value| payload(read::<u32>(&value) + 1))),
                None,
            );

        runtime.run_until_idle();
        let outcome = derived.outcome().expect("settled");
        assert!(outcome.is_fulfilled());
        assert_eq!(read::<u32>(outcome.value()), 21);
    }

    #[test]
    fn rejection_skips_fulfillment_handlers_until_caught() {
        let runtime = EventLoop::new();
        let caught = Promise::rejected(&runtime, payload("nope".to_string()))
            .then(Some(Handler::new(|_| panic!("must not run"))), None)
            .catch(Handler::new(|reason| {
                payload(format!("handled {}", read::<String>(&reason)))
            }));

        runtime.run_until_idle();
        let outcome = caught.outcome().expect("settled");
        assert!(outcome.is_fulfilled());
        assert_eq!(read::<String>(outcome.value()), "handled nope");
    }

    #[test]
    fn panicking_handler_rejects_the_derived_promise() {
        let runtime = EventLoop::new();
        let derived = Promise::resolved(&runtime, payload(()))
            .then(Some(Handler::new(|_| panic!("handler failed"))), None);

        runtime.run_until_idle();
        let outcome = derived.outcome().expect("settled");
        assert!(!outcome.is_fulfilled());
        assert_eq!(read::<String>(outcome.value()), "handler failed");
    }

    #[test]
    fn returning_a_promise_adopts_its_outcome() {
        let runtime = EventLoop::new();
        let inner = Promise::new(&runtime);
        let returned = inner.clone();
        let outer = Promise::resolved(&runtime, payload(()))
            .then(Some(Handler::new(move |_| payload(returned.clone()))), None);

        runtime.run_until_idle();
        assert!(!outer.is_settled());

        inner.resolve(payload(5u32));
        runtime.run_until_idle();
        assert_eq!(read::<u32>(outer.outcome().expect("settled").value()), 5);
    }

    #[test]
    fn settles_only_once() {
        let runtime = EventLoop::new();
        let promise = Promise::new(&runtime);

        assert!(promise.resolve(payload(1u32)));
        assert!(!promise.reject(payload(2u32)));
        assert!(promise.outcome().expect("settled").is_fulfilled());
    }
}
