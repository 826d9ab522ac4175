//! Native continuation-local backend.
//!
//! Stores live in the runtime's continuation frame ([`crate::runtime::frame`]),
//! which the event loop captures whenever work is scheduled and reinstates
//! when it runs. The backend only reads and rewrites the frame; it needs no
//! hooks and tracks no per-unit state.
//!
//! Disabling bumps the key's generation, so values written earlier become
//! unreachable even inside frames that were captured before the call.

use super::local::LocalHandle;
use super::{BackendKind, ContextStorage};
use crate::context::ActiveContext;
use crate::error::ScopeError;
use crate::runtime::frame::{self, FrameGuard, FrameKey};
use crate::runtime::EventLoop;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[derive(Debug)]
pub struct NativeStorage {
    handle: LocalHandle,
    enabled: AtomicBool,
}

impl NativeStorage {
    /// Creates the storage for `runtime`, or for plain threads when `None`.
    pub fn new(runtime: Option<&EventLoop>) -> Result<Self, ScopeError> {
        if let Some(runtime) = runtime {
            if !runtime.capabilities().context_frames {
                return Err(ScopeError::Unsupported {
                    capability: "context_frames",
                });
            }
        }
        Ok(Self {
            handle: LocalHandle::new(),
            enabled: AtomicBool::new(true),
        })
    }

    fn key(&self) -> FrameKey {
        FrameKey {
            id: self.handle.id(),
            generation: self.handle.generation(),
        }
    }
}

impl ContextStorage for NativeStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::AsyncLocalStorage
    }

    fn get_store(&self) -> Option<ActiveContext> {
        if !self.is_enabled() {
            return None;
        }
        frame::current().get(self.key())
    }

    fn run_dyn(&self, store: Option<ActiveContext>, f: &mut dyn FnMut()) {
        if !self.is_enabled() {
            return f();
        }
        let _guard = FrameGuard::enter(frame::current().with(self.key(), store));
        f();
    }

    fn enter_with(&self, store: Option<ActiveContext>) {
        if !self.is_enabled() {
            return;
        }
        frame::replace(frame::current().with(self.key(), store));
    }

    fn enable(&self) -> Result<(), ScopeError> {
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.handle.reset();
        frame::replace(frame::current().without(self.handle.id()));
        debug!(backend = %self.kind(), "Storage disabled");
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::span;
    use crate::runtime::{lock, Promise, RuntimeCapabilities};
    use crate::storage::StorageExt;
    use std::sync::{Arc, Mutex};

    #[test]
    fn frames_follow_scheduled_work() {
        let runtime = EventLoop::new();
        let storage = Arc::new(NativeStorage::new(Some(&runtime)).unwrap());
        let (a, _) = span("a");
        let seen = Arc::new(Mutex::new(Vec::new()));

        storage.run(Some(a.clone()), || {
            let (s, seen, inner) = (storage.clone(), seen.clone(), runtime.clone());
            runtime.set_immediate(move || {
                lock(&seen).push(s.get_store());
                let (s, seen) = (s.clone(), seen.clone());
                inner.queue_microtask(move || lock(&seen).push(s.get_store()));
            });
        });
        assert_eq!(storage.get_store(), None);

        runtime.run_until_idle();
        assert_eq!(*lock(&seen), vec![Some(a.clone()), Some(a)]);
    }

    #[test]
    fn disable_invalidates_captured_frames() {
        let runtime = EventLoop::new();
        let storage = Arc::new(NativeStorage::new(Some(&runtime)).unwrap());
        let (a, _) = span("a");
        let seen = Arc::new(Mutex::new(Some(a.clone())));

        storage.run(Some(a), || {
            let (s, seen) = (storage.clone(), seen.clone());
            runtime.set_immediate(move || *lock(&seen) = s.get_store());
        });
        storage.disable();
        storage.enable().unwrap();

        runtime.run_until_idle();
        assert_eq!(*lock(&seen), None);
    }

    #[test]
    fn enter_with_persists_until_the_frame_is_replaced() {
        let storage = NativeStorage::new(None).unwrap();
        let (a, _) = span("a");

        storage.enter_with(Some(a.clone()));
        assert_eq!(storage.get_store(), Some(a.clone()));
        storage.run(None, || assert_eq!(storage.get_store(), None));
        assert_eq!(storage.get_store(), Some(a));

        storage.disable();
        assert!(frame::current().is_empty());
    }

    #[test]
    fn promise_reactions_see_the_attaching_flow() {
        let runtime = EventLoop::new();
        let storage = Arc::new(NativeStorage::new(Some(&runtime)).unwrap());
        let (a, _) = span("a");
        let promise = Promise::new(&runtime);
        let seen = Arc::new(Mutex::new(None));

        storage.run(Some(a.clone()), || {
            let (s, seen) = (storage.clone(), seen.clone());
            promise.then(
                Some(crate::runtime::Handler::new(move |value| {
                    *lock(&seen) = s.get_store();
                    value
                })),
                None,
            );
        });
        promise.resolve(crate::runtime::payload(()));

        runtime.run_until_idle();
        assert_eq!(*lock(&seen), Some(a));
    }

    #[test]
    fn requires_frame_capability() {
        let runtime = EventLoop::with_capabilities(RuntimeCapabilities::NONE);
        assert_eq!(
            NativeStorage::new(Some(&runtime)).err(),
            Some(ScopeError::Unsupported {
                capability: "context_frames"
            })
        );
    }
}
