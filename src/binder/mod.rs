//! # Binders
//!
//! Adapters that make continuations re-enter the context they were registered
//! under, whatever context happens to be active when they finally run.
//!
//! - [`promise`]: wraps a promise's `then` so each handler is bound.
//! - [`emitter`]: wraps an emitter's listener methods so each listener is bound,
//!   and keeps removal working with the original listener.
//! - [`future`]: the same idea for Rust futures, re-entering on every poll.
//!
//! Promise and emitter adapters patch a [`MethodSlot`](crate::runtime::MethodSlot)
//! and tag it with a [`Marker`](crate::runtime::Marker). Installing twice is a
//! no-op; removing restores the exact original method.

pub mod emitter;
pub mod future;
pub mod promise;

pub use emitter::ListenerRegistry;
pub use future::Bound;
