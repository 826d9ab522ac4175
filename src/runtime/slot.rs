//! Replaceable method slots.
//!
//! Promises and emitters dispatch their continuation-attachment methods through
//! a [`MethodSlot`] so a binder can install a wrapper in place without the
//! caller noticing. The slot state is a tagged enum: the marker naming the
//! binder that wrapped it is what makes installation idempotent, and the kept
//! original is what makes uninstallation exact.

use crate::error::ScopeError;
use std::sync::RwLock;

/// Identifies which adapter installed a wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    PromiseBinder,
    EmitterBinder,
}

#[derive(Debug, Clone)]
enum SlotState<M> {
    Native(M),
    Wrapped { original: M, wrapper: M, marker: Marker },
}

/// A method that can be wrapped once and restored exactly.
#[derive(Debug)]
pub struct MethodSlot<M> {
    name: &'static str,
    state: RwLock<SlotState<M>>,
}

impl<M: Clone> MethodSlot<M> {
    pub fn new(name: &'static str, method: M) -> Self {
        Self {
            name,
            state: RwLock::new(SlotState::Native(method)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The method callers currently dispatch to.
    pub fn current(&self) -> Result<M, ScopeError> {
        let state = self
            .state
            .read()
            .map_err(|_| ScopeError::SlotPoisoned(self.name))?;
        Ok(match &*state {
            SlotState::Native(method) => method.clone(),
            SlotState::Wrapped { wrapper, .. } => wrapper.clone(),
        })
    }

    /// The method installed before any wrapper.
    pub fn original(&self) -> Result<M, ScopeError> {
        let state = self
            .state
            .read()
            .map_err(|_| ScopeError::SlotPoisoned(self.name))?;
        Ok(match &*state {
            SlotState::Native(method) => method.clone(),
            SlotState::Wrapped { original, .. } => original.clone(),
        })
    }

    pub fn wrapped_by(&self) -> Option<Marker> {
        match self.state.read().ok().as_deref() {
            Some(SlotState::Wrapped { marker, .. }) => Some(*marker),
            _ => None,
        }
    }

    /// Installs `make(original)` as the dispatched method.
    ///
    /// Fails with [`ScopeError::AlreadyInstalled`] if the slot is already wrapped.
    pub fn wrap(&self, marker: Marker, make: impl FnOnce(M) -> M) -> Result<(), ScopeError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| ScopeError::SlotPoisoned(self.name))?;
        let original = match &*state {
            SlotState::Native(method) => method.clone(),
            SlotState::Wrapped { .. } => return Err(ScopeError::AlreadyInstalled),
        };
        let wrapper = make(original.clone());
        *state = SlotState::Wrapped {
            original,
            wrapper,
            marker,
        };
        Ok(())
    }

    /// Restores the original method if `marker` installed the current wrapper.
    ///
    /// Returns `Ok(false)` when there was nothing of `marker`'s to remove.
    pub fn restore(&self, marker: Marker) -> Result<bool, ScopeError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| ScopeError::SlotPoisoned(self.name))?;
        let original = match &*state {
            SlotState::Wrapped {
                original,
                marker: installed,
                ..
            } if *installed == marker => original.clone(),
            _ => return Ok(false),
        };
        *state = SlotState::Native(original);
        Ok(true)
    }
}
