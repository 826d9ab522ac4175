//! # Active Context
//!
//! The engine never looks inside the value it propagates. Callers hand it an
//! [`ActiveContext`], a shared handle around anything implementing
//! [`ContextValue`] (conceptually a span), and read the same handle back with
//! `Scope::active()`.
//!
//! Two handles are equal only when they point at the same allocation. Cloning a
//! handle keeps its identity; wrapping an equal-looking value in a new handle
//! does not.

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Why an activation ended abnormally.
#[derive(Debug, Clone, Copy)]
pub enum Failure<'a> {
    /// The activated closure panicked. Carries the panic message when it was a string.
    Panic(&'a str),
    /// The activated closure returned an `Err`.
    Error(&'a (dyn std::error::Error + 'static)),
}

impl fmt::Display for Failure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Panic(message) => write!(f, "panic: {}", message),
            Failure::Error(error) => write!(f, "{}", error),
        }
    }
}

/// Helper trait giving `dyn ContextValue` access to `Any`.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A value that can be made current by the engine.
///
/// # Provided Methods
/// - [`ContextValue::tag_error`] is called when an activation of this value
///   panics or returns an error. The default does nothing.
pub trait ContextValue: AsAny + Debug + Send + Sync + 'static {
    /// Records that work running under this context failed.
    fn tag_error(&self, _failure: &Failure<'_>) {}
}

/// Reference-identity handle to a caller-supplied context value.
#[derive(Clone)]
pub struct ActiveContext {
    value: Arc<dyn ContextValue>,
}

impl ActiveContext {
    pub fn new<V: ContextValue>(value: V) -> Self {
        Self {
            value: Arc::new(value),
        }
    }

    /// Wraps an existing allocation without copying it, so callers that keep
    /// their own `Arc` can compare against the handle later.
    pub fn from_arc<V: ContextValue>(value: Arc<V>) -> Self {
        Self { value }
    }

    /// Returns `true` if both handles point at the same value.
    pub fn ptr_eq(&self, other: &ActiveContext) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.value) as *const (),
            Arc::as_ptr(&other.value) as *const (),
        )
    }

    pub fn downcast_ref<V: ContextValue>(&self) -> Option<&V> {
        self.value.as_ref().as_any().downcast_ref::<V>()
    }

    pub fn tag_error(&self, failure: &Failure<'_>) {
        self.value.tag_error(failure);
    }
}

impl PartialEq for ActiveContext {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ActiveContext {}

impl Debug for ActiveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ActiveContext").field(&self.value).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSpan;

    #[test]
    fn identity_is_by_reference() {
        let a = ActiveContext::new(MockSpan::new("a"));
        let same = a.clone();
        let lookalike = ActiveContext::new(MockSpan::new("a"));

        assert_eq!(a, same);
        assert_ne!(a, lookalike);
    }

    #[test]
    fn downcast_recovers_the_value() {
        let span = Arc::new(MockSpan::new("request"));
        let ctx = ActiveContext::from_arc(span.clone());

        let recovered = ctx.downcast_ref::<MockSpan>().expect("MockSpan");
        assert!(std::ptr::eq(recovered, span.as_ref()));
    }

    #[test]
    fn tag_error_reaches_the_value() {
        let span = Arc::new(MockSpan::new("request"));
        let ctx = ActiveContext::from_arc(span.clone());

        ctx.tag_error(&Failure::Panic("boom"));

        assert_eq!(span.errors(), vec!["panic: boom".to_string()]);
    }
}
