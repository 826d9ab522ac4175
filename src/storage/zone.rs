//! # Zone Backend
//!
//! Every activation forks a child [`Zone`] of the current one carrying the
//! store. The backend installs a [`TaskInterceptor`] on the runtime that
//! captures the current zone whenever a job is scheduled and wraps the job so
//! it runs inside that zone.
//!
//! Zones are immutable once forked. `enter_with` swaps the current zone for a
//! sibling carrying the new store, so repeated calls never deepen the tree.

use super::local::LocalHandle;
use super::{BackendKind, ContextStorage};
use crate::context::ActiveContext;
use crate::error::ScopeError;
use crate::runtime::{lock, EventLoop, HookId, Job, TaskInterceptor, UnitKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One node in the zone tree.
#[derive(Debug)]
pub struct Zone {
    parent: Option<Arc<Zone>>,
    store: Option<ActiveContext>,
    depth: usize,
}

impl Zone {
    fn fork(parent: Option<Arc<Zone>>, store: Option<ActiveContext>) -> Arc<Zone> {
        let depth = parent.as_ref().map_or(1, |parent| parent.depth + 1);
        Arc::new(Zone {
            parent,
            store,
            depth,
        })
    }

    pub fn parent(&self) -> Option<&Arc<Zone>> {
        self.parent.as_ref()
    }

    pub fn store(&self) -> Option<&ActiveContext> {
        self.store.as_ref()
    }

    /// Distance from the root zone; the first fork has depth 1.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        // Unlink ancestors one at a time so long chains do not recurse.
        let mut parent = self.parent.take();
        while let Some(zone) = parent {
            parent = match Arc::try_unwrap(zone) {
                Ok(mut zone) => zone.parent.take(),
                Err(_) => None,
            };
        }
    }
}

type CurrentZone = Option<Arc<Zone>>;

struct ZoneState {
    enabled: AtomicBool,
    local: LocalHandle,
}

impl ZoneState {
    fn current(&self) -> CurrentZone {
        self.local.with(|zone: &mut CurrentZone| zone.clone())
    }

    fn replace(&self, next: CurrentZone) -> CurrentZone {
        self.local
            .with(|zone: &mut CurrentZone| std::mem::replace(zone, next))
    }

    /// Runs `f` inside `zone`, restoring the previous zone afterwards.
    fn run_in(&self, zone: CurrentZone, f: impl FnOnce()) {
        let _guard = ZoneGuard {
            state: self,
            generation: self.local.generation(),
            previous: Some(self.replace(zone)),
        };
        f();
    }
}

struct ZoneGuard<'a> {
    state: &'a ZoneState,
    generation: u64,
    previous: Option<CurrentZone>,
}

impl Drop for ZoneGuard<'_> {
    fn drop(&mut self) {
        if self.state.local.generation() != self.generation {
            return;
        }
        if let Some(previous) = self.previous.take() {
            self.state.replace(previous);
        }
    }
}

struct ZoneInterceptor {
    state: Arc<ZoneState>,
}

impl TaskInterceptor for ZoneInterceptor {
    fn intercept(&self, _kind: UnitKind, job: Job) -> Job {
        if !self.state.enabled.load(Ordering::Acquire) {
            return job;
        }
        let captured = self.state.current();
        let state = self.state.clone();
        Box::new(move || state.run_in(captured, job))
    }
}

/// Storage carried by forked zones.
pub struct ZoneStorage {
    runtime: EventLoop,
    state: Arc<ZoneState>,
    interceptor: Mutex<Option<HookId>>,
}

impl ZoneStorage {
    /// Creates the storage and patches `runtime`'s scheduler.
    pub fn new(runtime: &EventLoop) -> Result<Self, ScopeError> {
        let storage = Self {
            runtime: runtime.clone(),
            state: Arc::new(ZoneState {
                enabled: AtomicBool::new(false),
                local: LocalHandle::new(),
            }),
            interceptor: Mutex::new(None),
        };
        storage.enable()?;
        Ok(storage)
    }

    /// The zone executing on this thread, `None` at the root.
    pub fn current_zone(&self) -> Option<Arc<Zone>> {
        self.state.current()
    }
}

impl ContextStorage for ZoneStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::Zone
    }

    fn get_store(&self) -> Option<ActiveContext> {
        if !self.is_enabled() {
            return None;
        }
        self.state.current().and_then(|zone| zone.store.clone())
    }

    fn run_dyn(&self, store: Option<ActiveContext>, f: &mut dyn FnMut()) {
        if !self.is_enabled() {
            return f();
        }
        let child = Zone::fork(self.state.current(), store);
        self.state.run_in(Some(child), f);
    }

    fn enter_with(&self, store: Option<ActiveContext>) {
        if !self.is_enabled() {
            return;
        }
        let parent = self
            .state
            .current()
            .and_then(|zone| zone.parent.clone());
        let displaced = self.state.replace(Some(Zone::fork(parent, store)));
        drop(displaced);
    }

    fn enable(&self) -> Result<(), ScopeError> {
        let mut interceptor = lock(&self.interceptor);
        if interceptor.is_some() {
            return Ok(());
        }
        let id = self.runtime.add_interceptor(Arc::new(ZoneInterceptor {
            state: self.state.clone(),
        }))?;
        *interceptor = Some(id);
        self.state.enabled.store(true, Ordering::Release);
        debug!(backend = %self.kind(), "Storage enabled");
        Ok(())
    }

    fn disable(&self) {
        if let Some(id) = lock(&self.interceptor).take() {
            self.runtime.remove_interceptor(id);
        }
        self.state.enabled.store(false, Ordering::Release);
        self.state.local.reset();
        debug!(backend = %self.kind(), "Storage disabled");
    }

    fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::Acquire)
    }
}

impl Drop for ZoneStorage {
    fn drop(&mut self) {
        if let Some(id) = lock(&self.interceptor).take() {
            self.runtime.remove_interceptor(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::span;
    use crate::runtime::RuntimeCapabilities;
    use crate::storage::StorageExt;
    use std::time::Duration;

    #[test]
    fn activations_fork_nested_zones() {
        let runtime = EventLoop::new();
        let storage = ZoneStorage::new(&runtime).unwrap();
        let (a, _) = span("a");
        let (b, _) = span("b");

        storage.run(Some(a.clone()), || {
            storage.run(Some(b.clone()), || {
                let zone = storage.current_zone().expect("forked");
                assert_eq!(zone.depth(), 2);
                assert_eq!(zone.store(), Some(&b));
                assert_eq!(zone.parent().and_then(|p| p.store()), Some(&a));
            });
        });
        assert!(storage.current_zone().is_none());
    }

    #[test]
    fn scheduled_jobs_run_in_their_zone() {
        let runtime = EventLoop::new();
        let storage = Arc::new(ZoneStorage::new(&runtime).unwrap());
        let (a, _) = span("a");
        let (b, _) = span("b");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for ctx in [a.clone(), b.clone()] {
            storage.run(Some(ctx), || {
                let (s, seen) = (storage.clone(), seen.clone());
                runtime.set_timeout(Duration::from_millis(10), move || {
                    lock(&seen).push(s.get_store());
                });
            });
        }

        runtime.run_until_idle();
        assert_eq!(*lock(&seen), vec![Some(a), Some(b)]);
    }

    #[test]
    fn disable_removes_the_interceptor() {
        let runtime = EventLoop::new();
        let storage = Arc::new(ZoneStorage::new(&runtime).unwrap());
        let (a, _) = span("a");
        storage.disable();
        storage.enable().unwrap();
        storage.disable();

        let seen = Arc::new(Mutex::new(Some(a.clone())));
        storage.run(Some(a), || {
            let (s, seen) = (storage.clone(), seen.clone());
            runtime.set_immediate(move || *lock(&seen) = s.get_store());
        });
        runtime.run_until_idle();
        assert_eq!(*lock(&seen), None);
    }

    #[test]
    fn repeated_enter_with_keeps_the_depth_constant() {
        let runtime = EventLoop::new();
        let storage = ZoneStorage::new(&runtime).unwrap();

        for _ in 0..100_000 {
            let (ctx, _) = span("entered");
            storage.enter_with(Some(ctx));
        }
        assert_eq!(storage.current_zone().map(|zone| zone.depth()), Some(1));

        storage.run(None, || {
            let (ctx, _) = span("inner");
            storage.enter_with(Some(ctx.clone()));
            storage.enter_with(Some(ctx));
            assert_eq!(storage.current_zone().map(|zone| zone.depth()), Some(2));
        });

        storage.disable();
        assert!(storage.current_zone().is_none());
    }

    #[test]
    fn long_zone_chains_drop_without_recursing() {
        let mut zone = None;
        for _ in 0..200_000 {
            zone = Some(Zone::fork(zone, None));
        }
        assert_eq!(zone.as_ref().map(|zone| zone.depth()), Some(200_000));
        drop(zone);
    }

    #[test]
    fn requires_scheduler_patching() {
        let runtime = EventLoop::with_capabilities(RuntimeCapabilities::NONE);
        assert!(ZoneStorage::new(&runtime).is_err());
    }
}
