//! # Mock Contexts
//!
//! Test doubles for the values the engine propagates. The tracer core is out of
//! scope for this crate, so tests use [`MockSpan`] wherever a real span would
//! be activated.
//!
//! ```rust
//! use trace_scope::mock::MockSpan;
//! use trace_scope::{ActiveContext, Failure};
//! use std::sync::Arc;
//!
//! let span = Arc::new(MockSpan::new("db.query"));
//! let ctx = ActiveContext::from_arc(span.clone());
//!
//! ctx.tag_error(&Failure::Panic("connection reset"));
//! assert_eq!(span.errors().len(), 1);
//! ```

use crate::context::{ActiveContext, ContextValue, Failure};
use std::sync::{Arc, Mutex};

/// A span stand-in that records every error it is tagged with.
#[derive(Debug)]
pub struct MockSpan {
    name: String,
    errors: Mutex<Vec<String>>,
}

impl MockSpan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the rendered failures in the order they were tagged.
    pub fn errors(&self) -> Vec<String> {
        match self.errors.lock() {
            Ok(errors) => errors.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ContextValue for MockSpan {
    fn tag_error(&self, failure: &Failure<'_>) {
        let mut errors = match self.errors.lock() {
            Ok(errors) => errors,
            Err(poisoned) => poisoned.into_inner(),
        };
        errors.push(failure.to_string());
    }
}

/// A context value without the error-tagging capability.
#[derive(Debug)]
pub struct PlainContext(pub &'static str);

impl ContextValue for PlainContext {}

/// Creates a context around a fresh `MockSpan`, returning both handles.
pub fn span(name: &str) -> (ActiveContext, Arc<MockSpan>) {
    let span = Arc::new(MockSpan::new(name));
    (ActiveContext::from_arc(span.clone()), span)
}

/// Returns the name of the `MockSpan` behind `ctx`, if any.
pub fn name_of(ctx: Option<&ActiveContext>) -> Option<String> {
    ctx.and_then(|ctx| ctx.downcast_ref::<MockSpan>())
        .map(|span| span.name().to_string())
}
