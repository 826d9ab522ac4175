//! Shared, identity-carrying callables.
//!
//! A [`Callback`] is the Rust stand-in for a function object: cheap to clone,
//! comparable by identity, and able to remember the callback it wraps so that
//! binding can be undone exactly.

use std::fmt;
use std::sync::{Arc, Weak};

struct CallbackInner<A, R> {
    func: Box<dyn Fn(A) -> R + Send + Sync>,
    unbound: Option<Callback<A, R>>,
}

/// A shared callable taking `A` and returning `R`.
pub struct Callback<A = (), R = ()> {
    inner: Arc<CallbackInner<A, R>>,
}

impl<A: 'static, R: 'static> Callback<A, R> {
    pub fn new(func: impl Fn(A) -> R + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(CallbackInner {
                func: Box::new(func),
                unbound: None,
            }),
        }
    }

    /// Creates a wrapper that remembers `original` as the callback it stands for.
    pub(crate) fn wrapping(
        original: &Callback<A, R>,
        func: impl Fn(A) -> R + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(CallbackInner {
                func: Box::new(func),
                unbound: Some(original.clone()),
            }),
        }
    }

    pub fn call(&self, args: A) -> R {
        (self.inner.func)(args)
    }

    /// The callback this one wraps, if it was produced by binding.
    pub fn unbound(&self) -> Option<&Callback<A, R>> {
        self.inner.unbound.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.inner.unbound.is_some()
    }

    pub fn ptr_eq(&self, other: &Callback<A, R>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakCallback<A, R> {
        WeakCallback {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<A, R> Clone for Callback<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A, R> fmt::Debug for Callback<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("addr", &Arc::as_ptr(&self.inner))
            .field("bound", &self.inner.unbound.is_some())
            .finish()
    }
}

/// A non-owning reference to a [`Callback`].
pub struct WeakCallback<A = (), R = ()> {
    inner: Weak<CallbackInner<A, R>>,
}

impl<A, R> WeakCallback<A, R> {
    pub fn upgrade(&self) -> Option<Callback<A, R>> {
        self.inner.upgrade().map(|inner| Callback { inner })
    }

    /// Returns `true` if this points at the same allocation as `callback`.
    pub fn refers_to(&self, callback: &Callback<A, R>) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&callback.inner))
    }

    pub fn is_dead(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl<A, R> Clone for WeakCallback<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
