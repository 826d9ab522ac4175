//! Native continuation frames.
//!
//! A [`ContextFrame`] is an immutable map from storage key to context. The
//! current frame lives in a thread-local; the event loop snapshots it whenever
//! work is scheduled and reinstates the snapshot around the work when it runs.
//! This is the runtime-provided primitive the native backend builds on:
//! propagation costs one `Arc` clone per scheduled unit and needs no hooks.

use crate::context::ActiveContext;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

/// Key of one storage instance inside a frame: handle id plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub id: u64,
    pub generation: u64,
}

/// Immutable snapshot of every native store on a flow.
#[derive(Debug, Clone, Default)]
pub struct ContextFrame {
    entries: Option<Arc<HashMap<FrameKey, ActiveContext>>>,
}

impl ContextFrame {
    pub fn get(&self, key: FrameKey) -> Option<ActiveContext> {
        self.entries.as_ref().and_then(|entries| entries.get(&key).cloned())
    }

    /// Returns a new frame with `key` set to `value` (or removed for `None`).
    pub fn with(&self, key: FrameKey, value: Option<ActiveContext>) -> ContextFrame {
        let mut entries = self
            .entries
            .as_ref()
            .map(|entries| entries.as_ref().clone())
            .unwrap_or_default();
        match value {
            Some(value) => {
                entries.insert(key, value);
            }
            None => {
                entries.remove(&key);
            }
        }
        if entries.is_empty() {
            ContextFrame::default()
        } else {
            ContextFrame {
                entries: Some(Arc::new(entries)),
            }
        }
    }

    /// Drops every entry whose id matches `id`, whatever its generation.
    pub fn without(&self, id: u64) -> ContextFrame {
        let Some(entries) = &self.entries else {
            return ContextFrame::default();
        };
        let kept: HashMap<FrameKey, ActiveContext> = entries
            .iter()
            .filter(|(key, _)| key.id != id)
            .map(|(key, value)| (*key, value.clone()))
            .collect();
        if kept.is_empty() {
            ContextFrame::default()
        } else {
            ContextFrame {
                entries: Some(Arc::new(kept)),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_none()
    }
}

thread_local! {
    static CURRENT: RefCell<ContextFrame> = RefCell::new(ContextFrame::default());
}

/// The frame of the flow executing on this thread.
///
/// Empty while the thread-local is being torn down.
pub fn current() -> ContextFrame {
    CURRENT
        .try_with(|current| {
            current
                .try_borrow()
                .map(|current| current.clone())
                .unwrap_or_default()
        })
        .unwrap_or_default()
}

/// Installs `frame` as current and returns the one it replaced.
pub fn replace(frame: ContextFrame) -> ContextFrame {
    CURRENT
        .try_with(|current| match current.try_borrow_mut() {
            Ok(mut current) => std::mem::replace(&mut *current, frame),
            Err(_) => frame,
        })
        .unwrap_or_default()
}

/// Restores a previous frame when dropped, including during unwinding.
pub(crate) struct FrameGuard {
    previous: Option<ContextFrame>,
}

impl FrameGuard {
    pub(crate) fn enter(frame: ContextFrame) -> Self {
        Self {
            previous: Some(replace(frame)),
        }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            // The frame we leave may hold the last handle to a context.
            let displaced = replace(previous);
            drop(displaced);
        }
    }
}
