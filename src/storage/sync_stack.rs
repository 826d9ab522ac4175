//! Synchronous stack backend.
//!
//! Activations push onto a per-thread stack and pop when they end. Nothing is
//! carried across asynchronous hops: a deferred callback sees whatever happens
//! to be on the stack when it runs, which outside any activation is nothing.

use super::local::LocalHandle;
use super::{BackendKind, ContextStorage};
use crate::context::ActiveContext;
use crate::error::ScopeError;
use std::sync::atomic::{AtomicBool, Ordering};

type Stack = Vec<Option<ActiveContext>>;

#[derive(Debug)]
pub struct SyncStackStorage {
    local: LocalHandle,
    enabled: AtomicBool,
}

impl SyncStackStorage {
    pub fn new() -> Self {
        Self {
            local: LocalHandle::new(),
            enabled: AtomicBool::new(true),
        }
    }

    /// Number of activations currently open on this thread.
    pub fn depth(&self) -> usize {
        self.local.with(|stack: &mut Stack| stack.len())
    }
}

impl Default for SyncStackStorage {
    fn default() -> Self {
        Self::new()
    }
}

struct PopGuard<'a> {
    local: &'a LocalHandle,
    generation: u64,
    depth: usize,
}

impl Drop for PopGuard<'_> {
    fn drop(&mut self) {
        if self.local.generation() != self.generation {
            return;
        }
        let popped = self.local.with(|stack: &mut Stack| {
            let depth = self.depth.min(stack.len());
            stack.split_off(depth)
        });
        drop(popped);
    }
}

impl ContextStorage for SyncStackStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::SyncStack
    }

    fn get_store(&self) -> Option<ActiveContext> {
        if !self.is_enabled() {
            return None;
        }
        self.local
            .with(|stack: &mut Stack| stack.last().cloned().flatten())
    }

    fn run_dyn(&self, store: Option<ActiveContext>, f: &mut dyn FnMut()) {
        if !self.is_enabled() {
            return f();
        }
        let generation = self.local.generation();
        let depth = self.local.with(|stack: &mut Stack| {
            stack.push(store);
            stack.len() - 1
        });
        let _guard = PopGuard {
            local: &self.local,
            generation,
            depth,
        };
        f();
    }

    fn enter_with(&self, store: Option<ActiveContext>) {
        if !self.is_enabled() {
            return;
        }
        let displaced = self.local.with(|stack: &mut Stack| match stack.last_mut() {
            Some(top) => std::mem::replace(top, store),
            None => {
                stack.push(store);
                None
            }
        });
        drop(displaced);
    }

    fn enable(&self) -> Result<(), ScopeError> {
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.local.reset();
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{name_of, span};
    use crate::storage::StorageExt;

    #[test]
    fn nested_runs_restore_in_stack_order() {
        let storage = SyncStackStorage::new();
        let (a, _) = span("a");
        let (b, _) = span("b");

        storage.run(Some(a.clone()), || {
            assert_eq!(storage.get_store(), Some(a.clone()));
            storage.run(Some(b.clone()), || {
                assert_eq!(name_of(storage.get_store().as_ref()).as_deref(), Some("b"));
            });
            storage.run(None, || assert_eq!(storage.get_store(), None));
            assert_eq!(storage.get_store(), Some(a.clone()));
        });
        assert_eq!(storage.get_store(), None);
        assert_eq!(storage.depth(), 0);
    }

    #[test]
    fn panics_unwind_the_stack() {
        let storage = SyncStackStorage::new();
        let (a, _) = span("a");

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            storage.run(Some(a), || panic!("boom"))
        }));

        assert!(result.is_err());
        assert_eq!(storage.get_store(), None);
        assert_eq!(storage.depth(), 0);
    }

    #[test]
    fn enter_with_replaces_the_current_frame_only() {
        let storage = SyncStackStorage::new();
        let (a, _) = span("a");
        let (b, _) = span("b");

        storage.run(Some(a.clone()), || {
            storage.enter_with(Some(b.clone()));
            assert_eq!(storage.get_store(), Some(b.clone()));
        });
        assert_eq!(storage.get_store(), None);

        storage.enter_with(Some(a.clone()));
        assert_eq!(storage.get_store(), Some(a));
        storage.disable();
    }

    #[test]
    fn disabled_storage_reports_nothing() {
        let storage = SyncStackStorage::new();
        let (a, _) = span("a");
        storage.enter_with(Some(a.clone()));

        storage.disable();
        assert_eq!(storage.get_store(), None);
        storage.run(Some(a), || assert_eq!(storage.get_store(), None));

        storage.enable().unwrap();
        assert_eq!(storage.get_store(), None);
    }
}
