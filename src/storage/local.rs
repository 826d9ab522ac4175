//! Thread-local slots keyed by an opaque per-backend handle.
//!
//! Every backend that keeps per-thread state (the synchronous stack, the hook
//! backend's execution stack, the current zone) stores it here instead of in a
//! `thread_local!` of its own. The handle is only ever a map key; nothing is
//! attached to user objects.
//!
//! Resetting a handle bumps its generation. Slots written under an older
//! generation are discarded lazily the next time any thread touches them, which
//! is how `disable()` releases state held by threads it cannot reach.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

struct Slot {
    generation: u64,
    value: Box<dyn Any>,
}

thread_local! {
    static SLOTS: RefCell<HashMap<u64, Slot>> = RefCell::new(HashMap::new());
}

/// Opaque key into the per-thread slot table.
#[derive(Debug)]
pub(crate) struct LocalHandle {
    id: u64,
    generation: AtomicU64,
}

impl LocalHandle {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Runs `f` against this thread's slot, creating it with `T::default()` if
    /// it is missing or stale.
    ///
    /// `f` must not call back into user code and must not drop user values:
    /// the slot table stays borrowed for the duration of the call. Return
    /// displaced values from `f` and drop them afterwards. When the table is
    /// already borrowed or torn down, `f` sees a fresh default instead.
    pub(crate) fn with<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Default + 'static,
    {
        let available = SLOTS
            .try_with(|slots| slots.try_borrow_mut().is_ok())
            .unwrap_or(false);
        if !available {
            return f(&mut T::default());
        }
        let generation = self.generation();
        let (result, stale) = SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            let slot = slots.entry(self.id).or_insert_with(|| Slot {
                generation,
                value: Box::new(T::default()),
            });
            let mut stale = None;
            if slot.generation != generation || !slot.value.is::<T>() {
                stale = Some(std::mem::replace(
                    slot,
                    Slot {
                        generation,
                        value: Box::new(T::default()),
                    },
                ));
            }
            let result = match slot.value.downcast_mut::<T>() {
                Some(value) => f(value),
                None => f(&mut T::default()),
            };
            (result, stale)
        });
        drop(stale);
        result
    }

    /// Invalidates the slot on every thread and drops the calling thread's copy.
    pub(crate) fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.release();
    }

    fn release(&self) {
        let removed = SLOTS.try_with(|slots| {
            slots
                .try_borrow_mut()
                .ok()
                .and_then(|mut slots| slots.remove(&self.id))
        });
        drop(removed);
    }
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_do_not_share_slots() {
        let a = LocalHandle::new();
        let b = LocalHandle::new();

        a.with(|v: &mut Vec<u32>| v.push(1));
        b.with(|v: &mut Vec<u32>| v.push(2));

        assert_eq!(a.with(|v: &mut Vec<u32>| v.clone()), vec![1]);
        assert_eq!(b.with(|v: &mut Vec<u32>| v.clone()), vec![2]);
    }

    #[test]
    fn reentrant_access_sees_a_fresh_default() {
        let handle = LocalHandle::new();
        handle.with(|v: &mut Vec<u32>| v.push(1));

        let inner = handle.with(|_: &mut Vec<u32>| handle.with(|v: &mut Vec<u32>| v.len()));

        assert_eq!(inner, 0);
        assert_eq!(handle.with(|v: &mut Vec<u32>| v.len()), 1);
    }

    #[test]
    fn reset_discards_state_on_other_threads() {
        let handle = std::sync::Arc::new(LocalHandle::new());

        let writer = handle.clone();
        let (written_tx, written_rx) = std::sync::mpsc::channel::<()>();
        let (reset_tx, reset_rx) = std::sync::mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            writer.with(|v: &mut Vec<u32>| v.push(7));
            written_tx.send(()).ok();
            reset_rx.recv().ok();
            writer.with(|v: &mut Vec<u32>| v.len())
        });

        written_rx.recv().unwrap();
        handle.reset();
        reset_tx.send(()).unwrap();

        assert_eq!(thread.join().unwrap(), 0);
    }

    #[test]
    fn slots_are_per_thread() {
        let handle = std::sync::Arc::new(LocalHandle::new());
        handle.with(|v: &mut Vec<u32>| v.push(1));

        let other = handle.clone();
        let seen = std::thread::spawn(move || other.with(|v: &mut Vec<u32>| v.len()))
            .join()
            .unwrap();

        assert_eq!(seen, 0);
        assert_eq!(handle.with(|v: &mut Vec<u32>| v.len()), 1);
    }
}
