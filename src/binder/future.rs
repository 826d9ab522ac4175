//! Future binder.
//!
//! [`Bound`] re-enters its captured context around every `poll`, so the
//! context follows the future across await points and executor threads.

use crate::context::ActiveContext;
use crate::storage::{ContextStorage, StorageExt};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// A future that polls its inner future with a context active.
pub struct Bound<F> {
    inner: Pin<Box<F>>,
    store: Option<ActiveContext>,
    storage: Arc<dyn ContextStorage>,
}

impl<F: Future> Bound<F> {
    pub(crate) fn new(
        future: F,
        store: Option<ActiveContext>,
        storage: Arc<dyn ContextStorage>,
    ) -> Self {
        Self {
            inner: Box::pin(future),
            store,
            storage,
        }
    }

    pub fn context(&self) -> Option<&ActiveContext> {
        self.store.as_ref()
    }
}

impl<F: Future> Future for Bound<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let inner = &mut this.inner;
        this.storage
            .run(this.store.clone(), || inner.as_mut().poll(cx))
    }
}

impl<F> fmt::Debug for Bound<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bound").field("store", &self.store).finish()
    }
}
