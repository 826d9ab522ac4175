//! # Emitter Binder
//!
//! Wraps an emitter's three registration methods:
//!
//! | Method | Wrapped behaviour |
//! |--------|-------------------|
//! | add (`on`, `once`, `prepend_*`) | bind the listener to the registration-time context, remember original → wrapper, register the wrapper |
//! | remove (`off`, `remove_listener`) | remove every wrapper made from the listener, forget them |
//! | remove all | forget the event's associations, then delegate |
//!
//! Listeners that are already bound are registered as they are, so binding an
//! emitter never double-wraps. The [`ListenerRegistry`] only holds weak
//! references; once the emitter lets go of a wrapper its entry is purged.
//!
//! Installation touches three slots. If any of them fails, the ones already
//! wrapped are restored and the failure is logged; the host never sees it.

use crate::context::ActiveContext;
use crate::error::ScopeError;
use crate::runtime::{
    lock, AddListenerMethod, AddMode, EventEmitter, Listener, Marker, RemoveAllListenersMethod,
    RemoveListenerMethod, WeakCallback,
};
use crate::scope::Scope;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

struct Association {
    original: WeakCallback<crate::runtime::Payload, ()>,
    wrappers: Vec<WeakCallback<crate::runtime::Payload, ()>>,
}

impl Association {
    fn is_live(&self) -> bool {
        self.wrappers.iter().any(|wrapper| !wrapper.is_dead())
    }
}

/// Weak association from original listeners to the wrappers registered for them.
#[derive(Default)]
pub struct ListenerRegistry {
    events: Mutex<HashMap<String, Vec<Association>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers that `wrapper` was registered for `original` on `event`.
    pub fn record(&self, event: &str, original: &Listener, wrapper: &Listener) {
        let mut events = lock(&self.events);
        let associations = events.entry(event.to_string()).or_default();
        associations.retain(Association::is_live);
        match associations
            .iter_mut()
            .find(|association| association.original.refers_to(original))
        {
            Some(association) => association.wrappers.push(wrapper.downgrade()),
            None => associations.push(Association {
                original: original.downgrade(),
                wrappers: vec![wrapper.downgrade()],
            }),
        }
    }

    /// Removes the association for `original` and returns its live wrappers.
    pub fn take(&self, event: &str, original: &Listener) -> Vec<Listener> {
        let mut events = lock(&self.events);
        let Some(associations) = events.get_mut(event) else {
            return Vec::new();
        };
        let mut taken = Vec::new();
        associations.retain(|association| {
            if association.original.refers_to(original) {
                taken.extend(association.wrappers.iter().filter_map(WeakCallback::upgrade));
                false
            } else {
                association.is_live()
            }
        });
        if associations.is_empty() {
            events.remove(event);
        }
        taken
    }

    /// Forgets the associations of `event`, or of every event when `None`.
    pub fn clear(&self, event: Option<&str>) {
        let mut events = lock(&self.events);
        match event {
            Some(event) => {
                events.remove(event);
            }
            None => events.clear(),
        }
    }

    /// Number of original listeners on `event` with at least one live wrapper.
    pub fn associations(&self, event: &str) -> usize {
        lock(&self.events)
            .get(event)
            .map_or(0, |associations| {
                associations.iter().filter(|a| a.is_live()).count()
            })
    }
}

/// What happened when an emitter was bound.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BindOutcome {
    Installed,
    AlreadyBound,
    Failed(ScopeError),
}

pub(crate) fn bind_emitter(
    scope: &Scope,
    emitter: &EventEmitter,
    ctx: Option<ActiveContext>,
) -> BindOutcome {
    let ours = emitter.methods().add_listener.wrapped_by() == Some(Marker::EmitterBinder);
    match install(scope, emitter, ctx) {
        Ok(()) => {
            debug!("Emitter bound");
            BindOutcome::Installed
        }
        Err(ScopeError::AlreadyInstalled) if ours => {
            trace!("Emitter already bound");
            BindOutcome::AlreadyBound
        }
        Err(error) => {
            warn!(%error, "Emitter binding failed, methods restored");
            BindOutcome::Failed(error)
        }
    }
}

pub(crate) fn unbind_emitter(emitter: &EventEmitter) {
    let methods = emitter.methods();
    let restored = [
        methods.add_listener.restore(Marker::EmitterBinder),
        methods.remove_listener.restore(Marker::EmitterBinder),
        methods.remove_all_listeners.restore(Marker::EmitterBinder),
    ];
    for result in restored {
        if let Err(error) = result {
            warn!(%error, "Emitter unbinding failed");
        }
    }
}

fn install(
    scope: &Scope,
    emitter: &EventEmitter,
    ctx: Option<ActiveContext>,
) -> Result<(), ScopeError> {
    let methods = emitter.methods();
    let registry = Arc::new(ListenerRegistry::new());

    methods.add_listener.wrap(Marker::EmitterBinder, {
        let (scope, registry) = (scope.clone(), registry.clone());
        move |original: AddListenerMethod| -> AddListenerMethod {
            Arc::new(
                move |emitter: &EventEmitter, event: &str, listener: Listener, mode: AddMode| {
                    if listener.is_bound() {
                        return original(emitter, event, listener, mode);
                    }
                    let captured = ctx.clone().or_else(|| scope.active());
                    let wrapper = scope.wrap_callback(&listener, captured);
                    registry.record(event, &listener, &wrapper);
                    original(emitter, event, wrapper, mode)
                },
            )
        }
    })?;

    let removed = methods.remove_listener.wrap(Marker::EmitterBinder, {
        let registry = registry.clone();
        move |original: RemoveListenerMethod| -> RemoveListenerMethod {
            Arc::new(
                move |emitter: &EventEmitter, event: &str, listener: &Listener| {
                    let wrappers = registry.take(event, listener);
                    if wrappers.is_empty() {
                        return original(emitter, event, listener);
                    }
                    wrappers
                        .iter()
                        .fold(false, |removed, wrapper| {
                            original(emitter, event, wrapper) || removed
                        })
                },
            )
        }
    });
    if let Err(error) = removed {
        rollback(emitter);
        return Err(error);
    }

    let cleared = methods.remove_all_listeners.wrap(Marker::EmitterBinder, {
        move |original: RemoveAllListenersMethod| -> RemoveAllListenersMethod {
            Arc::new(move |emitter: &EventEmitter, event: Option<&str>| {
                registry.clear(event);
                original(emitter, event)
            })
        }
    });
    if let Err(error) = cleared {
        rollback(emitter);
        return Err(error);
    }
    Ok(())
}

fn rollback(emitter: &EventEmitter) {
    let methods = emitter.methods();
    // Restore is marker-checked, so slots this install never reached stay as they are.
    let restored = [
        (methods.add_listener.name(), methods.add_listener.restore(Marker::EmitterBinder)),
        (methods.remove_listener.name(), methods.remove_listener.restore(Marker::EmitterBinder)),
    ];
    for (method, result) in restored {
        if let Err(error) = result {
            warn!(%error, method, "Emitter rollback could not restore method");
        }
    }
}
