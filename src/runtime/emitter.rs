//! # Event Emitter
//!
//! Named events with synchronous delivery. Listener registration and removal
//! dispatch through three [`MethodSlot`]s so the emitter binder can interpose
//! on them; `emit` itself is never wrapped.
//!
//! Registration order follows the usual emitter rules: `on` appends,
//! `prepend_listener` inserts at the front, `once` variants are dropped before
//! their first delivery. Removing a listener removes its most recent
//! registration only.

use super::callback::Callback;
use super::lock;
use super::promise::Payload;
use super::slot::MethodSlot;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{trace, warn};

/// An event listener.
pub type Listener = Callback<Payload, ()>;

/// How a listener is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    Append,
    Prepend,
    Once,
    PrependOnce,
}

impl AddMode {
    fn is_once(self) -> bool {
        matches!(self, AddMode::Once | AddMode::PrependOnce)
    }

    fn is_prepend(self) -> bool {
        matches!(self, AddMode::Prepend | AddMode::PrependOnce)
    }
}

pub type AddListenerMethod = Arc<dyn Fn(&EventEmitter, &str, Listener, AddMode) + Send + Sync>;
pub type RemoveListenerMethod = Arc<dyn Fn(&EventEmitter, &str, &Listener) -> bool + Send + Sync>;
pub type RemoveAllListenersMethod = Arc<dyn Fn(&EventEmitter, Option<&str>) + Send + Sync>;

/// The replaceable registration methods of one emitter.
pub struct EmitterMethods {
    pub add_listener: MethodSlot<AddListenerMethod>,
    pub remove_listener: MethodSlot<RemoveListenerMethod>,
    pub remove_all_listeners: MethodSlot<RemoveAllListenersMethod>,
}

impl EmitterMethods {
    fn native() -> Self {
        let add: AddListenerMethod = Arc::new(
            |emitter: &EventEmitter, event: &str, listener: Listener, mode: AddMode| {
                emitter.native_add(event, listener, mode)
            },
        );
        let remove: RemoveListenerMethod =
            Arc::new(|emitter: &EventEmitter, event: &str, listener: &Listener| {
                emitter.native_remove(event, listener)
            });
        let remove_all: RemoveAllListenersMethod =
            Arc::new(|emitter: &EventEmitter, event: Option<&str>| {
                emitter.native_remove_all(event)
            });
        Self {
            add_listener: MethodSlot::new("add_listener", add),
            remove_listener: MethodSlot::new("remove_listener", remove),
            remove_all_listeners: MethodSlot::new("remove_all_listeners", remove_all),
        }
    }
}

#[derive(Clone)]
struct Registered {
    listener: Listener,
    once: bool,
    // Distinguishes two registrations of the same listener.
    token: u64,
}

struct EmitterInner {
    listeners: Mutex<HashMap<String, Vec<Registered>>>,
    next_token: Mutex<u64>,
    methods: EmitterMethods,
}

/// A shared handle to one emitter.
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                listeners: Mutex::new(HashMap::new()),
                next_token: Mutex::new(0),
                methods: EmitterMethods::native(),
            }),
        }
    }

    // --- Registration ---

    pub fn on(&self, event: &str, listener: Listener) -> &Self {
        self.add_listener(event, listener)
    }

    pub fn add_listener(&self, event: &str, listener: Listener) -> &Self {
        self.dispatch_add(event, listener, AddMode::Append);
        self
    }

    pub fn prepend_listener(&self, event: &str, listener: Listener) -> &Self {
        self.dispatch_add(event, listener, AddMode::Prepend);
        self
    }

    pub fn once(&self, event: &str, listener: Listener) -> &Self {
        self.dispatch_add(event, listener, AddMode::Once);
        self
    }

    pub fn prepend_once_listener(&self, event: &str, listener: Listener) -> &Self {
        self.dispatch_add(event, listener, AddMode::PrependOnce);
        self
    }

    pub fn off(&self, event: &str, listener: &Listener) -> bool {
        self.remove_listener(event, listener)
    }

    /// Removes the most recent registration of `listener` for `event`.
    pub fn remove_listener(&self, event: &str, listener: &Listener) -> bool {
        match self.inner.methods.remove_listener.current() {
            Ok(method) => method(self, event, listener),
            Err(error) => {
                warn!(%error, event, "Emitter remove slot unavailable, removing natively");
                self.native_remove(event, listener)
            }
        }
    }

    /// Removes every listener for `event`, or for all events when `None`.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        match self.inner.methods.remove_all_listeners.current() {
            Ok(method) => method(self, event),
            Err(error) => {
                warn!(%error, ?event, "Emitter remove-all slot unavailable, removing natively");
                self.native_remove_all(event)
            }
        }
    }

    // --- Delivery ---

    /// Calls every listener for `event` synchronously, in registration order.
    ///
    /// Returns `true` if the event had listeners.
    pub fn emit(&self, event: &str, value: Payload) -> bool {
        let snapshot = {
            let mut listeners = lock(&self.inner.listeners);
            let Some(registered) = listeners.get_mut(event) else {
                return false;
            };
            let snapshot = registered.clone();
            registered.retain(|entry| !entry.once);
            if registered.is_empty() {
                listeners.remove(event);
            }
            snapshot
        };
        trace!(event, listeners = snapshot.len(), "Emitting");
        for entry in &snapshot {
            entry.listener.call(value.clone());
        }
        !snapshot.is_empty()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.inner.listeners)
            .get(event)
            .map_or(0, |registered| registered.len())
    }

    /// The registered listeners for `event`, as they were actually installed.
    pub fn listeners(&self, event: &str) -> Vec<Listener> {
        lock(&self.inner.listeners)
            .get(event)
            .map(|registered| registered.iter().map(|entry| entry.listener.clone()).collect())
            .unwrap_or_default()
    }

    pub fn methods(&self) -> &EmitterMethods {
        &self.inner.methods
    }

    pub fn ptr_eq(&self, other: &EventEmitter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // --- Native methods ---

    fn dispatch_add(&self, event: &str, listener: Listener, mode: AddMode) {
        match self.inner.methods.add_listener.current() {
            Ok(method) => method(self, event, listener, mode),
            Err(error) => {
                warn!(%error, event, "Emitter add slot unavailable, adding natively");
                self.native_add(event, listener, mode)
            }
        }
    }

    fn native_add(&self, event: &str, listener: Listener, mode: AddMode) {
        let token = {
            let mut next = lock(&self.inner.next_token);
            *next += 1;
            *next
        };
        let entry = Registered {
            listener,
            once: mode.is_once(),
            token,
        };
        let mut listeners = lock(&self.inner.listeners);
        let registered = listeners.entry(event.to_string()).or_default();
        if mode.is_prepend() {
            registered.insert(0, entry);
        } else {
            registered.push(entry);
        }
    }

    fn native_remove(&self, event: &str, listener: &Listener) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let Some(registered) = listeners.get_mut(event) else {
            return false;
        };
        let Some(token) = registered
            .iter()
            .rev()
            .find(|entry| entry.listener.ptr_eq(listener))
            .map(|entry| entry.token)
        else {
            return false;
        };
        registered.retain(|entry| entry.token != token);
        if registered.is_empty() {
            listeners.remove(event);
        }
        true
    }

    fn native_remove_all(&self, event: Option<&str>) {
        let mut listeners = lock(&self.inner.listeners);
        match event {
            Some(event) => {
                listeners.remove(event);
            }
            None => listeners.clear(),
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let events: Vec<(String, usize)> = lock(&self.inner.listeners)
            .iter()
            .map(|(event, registered)| (event.clone(), registered.len()))
            .collect();
        f.debug_struct("EventEmitter")
            .field("events", &events)
            .field("wrapped", &self.inner.methods.add_listener.wrapped_by())
            .finish()
    }
}
