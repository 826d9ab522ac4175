//! # Hook-Based Backend
//!
//! Tracks a store per execution unit by listening to the runtime's lifecycle
//! hooks:
//!
//! - `init(unit, trigger)` copies the trigger's store into the new unit's entry.
//!   The copy is taken at creation time, so later changes in the trigger do
//!   not reach the child.
//! - `before` / `after` maintain the stack of units executing on this thread.
//! - `destroy` removes the unit's entry.
//!
//! `run` temporarily overwrites the entry of the executing unit. Code running
//! outside any unit keeps its store in a thread-local root slot, so threads
//! that never enter the loop stay isolated from each other.

use super::local::LocalHandle;
use super::{BackendKind, ContextStorage};
use crate::context::ActiveContext;
use crate::error::ScopeError;
use crate::runtime::{lock, AsyncHook, EventLoop, HookId, UnitId, UnitKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

#[derive(Default)]
struct HookLocal {
    executing: Vec<UnitId>,
    root: Option<ActiveContext>,
}

struct HookState {
    enabled: AtomicBool,
    units: Mutex<HashMap<UnitId, ActiveContext>>,
    local: LocalHandle,
}

impl HookState {
    fn current_unit(&self) -> UnitId {
        self.local
            .with(|local: &mut HookLocal| local.executing.last().copied())
            .unwrap_or(UnitId::ROOT)
    }

    fn store_of(&self, unit: UnitId) -> Option<ActiveContext> {
        if unit == UnitId::ROOT {
            self.local.with(|local: &mut HookLocal| local.root.clone())
        } else {
            lock(&self.units).get(&unit).cloned()
        }
    }

    /// Replaces the store of `unit`. The displaced store is dropped only after
    /// every lock is released, since its drop may read the storage.
    fn set_store(&self, unit: UnitId, store: Option<ActiveContext>) {
        let displaced = if unit == UnitId::ROOT {
            self.local
                .with(|local: &mut HookLocal| std::mem::replace(&mut local.root, store))
        } else {
            let mut units = lock(&self.units);
            match store {
                Some(store) => units.insert(unit, store),
                None => units.remove(&unit),
            }
        };
        drop(displaced);
    }
}

impl AsyncHook for HookState {
    fn init(&self, unit: UnitId, kind: UnitKind, trigger: UnitId) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        if let Some(store) = self.store_of(trigger) {
            trace!(unit = %unit, trigger = %trigger, ?kind, "Copying store to child unit");
            let displaced = lock(&self.units).insert(unit, store);
            drop(displaced);
        }
    }

    fn before(&self, unit: UnitId) {
        self.local
            .with(|local: &mut HookLocal| local.executing.push(unit));
    }

    fn after(&self, unit: UnitId) {
        self.local.with(|local: &mut HookLocal| {
            if local.executing.last() == Some(&unit) {
                local.executing.pop();
            }
        });
    }

    fn destroy(&self, unit: UnitId) {
        let released = lock(&self.units).remove(&unit);
        drop(released);
    }
}

/// Restores a unit's previous store when an activation ends.
struct RestoreGuard<'a> {
    state: &'a HookState,
    generation: u64,
    unit: UnitId,
    previous: Option<ActiveContext>,
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if self.state.local.generation() == self.generation {
            self.state.set_store(self.unit, self.previous.take());
        }
    }
}

/// Storage driven by the runtime's async lifecycle hooks.
pub struct HookStorage {
    runtime: EventLoop,
    state: Arc<HookState>,
    hook: Mutex<Option<HookId>>,
}

impl HookStorage {
    /// Creates the storage and installs its hook on `runtime`.
    pub fn new(runtime: &EventLoop) -> Result<Self, ScopeError> {
        let storage = Self {
            runtime: runtime.clone(),
            state: Arc::new(HookState {
                enabled: AtomicBool::new(false),
                units: Mutex::new(HashMap::new()),
                local: LocalHandle::new(),
            }),
            hook: Mutex::new(None),
        };
        storage.enable()?;
        Ok(storage)
    }

    /// Number of units with a tracked store.
    pub fn tracked_units(&self) -> usize {
        lock(&self.state.units).len()
    }
}

impl ContextStorage for HookStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::AsyncHooks
    }

    fn get_store(&self) -> Option<ActiveContext> {
        if !self.is_enabled() {
            return None;
        }
        self.state.store_of(self.state.current_unit())
    }

    fn run_dyn(&self, store: Option<ActiveContext>, f: &mut dyn FnMut()) {
        if !self.is_enabled() {
            return f();
        }
        let unit = self.state.current_unit();
        let previous = self.state.store_of(unit);
        self.state.set_store(unit, store);
        let _guard = RestoreGuard {
            state: &self.state,
            generation: self.state.local.generation(),
            unit,
            previous,
        };
        f();
    }

    fn enter_with(&self, store: Option<ActiveContext>) {
        if !self.is_enabled() {
            return;
        }
        self.state.set_store(self.state.current_unit(), store);
    }

    fn enable(&self) -> Result<(), ScopeError> {
        let mut hook = lock(&self.hook);
        if hook.is_some() {
            return Ok(());
        }
        let id = self.runtime.add_hook(self.state.clone())?;
        *hook = Some(id);
        self.state.enabled.store(true, Ordering::Release);
        debug!(backend = %self.kind(), "Storage enabled");
        Ok(())
    }

    fn disable(&self) {
        let mut hook = lock(&self.hook);
        if let Some(id) = hook.take() {
            self.runtime.remove_hook(id);
        }
        self.state.enabled.store(false, Ordering::Release);
        let released = std::mem::take(&mut *lock(&self.state.units));
        drop(released);
        self.state.local.reset();
        debug!(backend = %self.kind(), "Storage disabled");
    }

    fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::Acquire)
    }
}

impl Drop for HookStorage {
    fn drop(&mut self) {
        if let Some(id) = lock(&self.hook).take() {
            self.runtime.remove_hook(id);
        }
    }
}
