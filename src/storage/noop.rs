//! No-op backend: nothing is ever active.
//!
//! Used when propagation is switched off or no other backend is available.
//! Every operation succeeds and `get_store()` is always `None`.

use super::{BackendKind, ContextStorage};
use crate::context::ActiveContext;
use crate::error::ScopeError;

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

impl NoopStorage {
    pub fn new() -> Self {
        Self
    }
}

impl ContextStorage for NoopStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::Noop
    }

    fn get_store(&self) -> Option<ActiveContext> {
        None
    }

    fn run_dyn(&self, _store: Option<ActiveContext>, f: &mut dyn FnMut()) {
        f();
    }

    fn enter_with(&self, _store: Option<ActiveContext>) {}

    fn enable(&self) -> Result<(), ScopeError> {
        Ok(())
    }

    fn disable(&self) {}

    fn is_enabled(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::span;
    use crate::storage::StorageExt;

    #[test]
    fn nothing_is_ever_stored() {
        let storage = NoopStorage::new();
        let (a, _) = span("a");

        storage.enter_with(Some(a.clone()));
        assert_eq!(storage.run(Some(a), || storage.get_store()), None);
        assert_eq!(storage.get_store(), None);
    }
}
