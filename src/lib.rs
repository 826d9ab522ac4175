#![doc(html_logo_url = "https://www.rust-lang.org/logos/rust-logo-128x128.png")]
#![doc(html_favicon_url = "https://www.rust-lang.org/favicon.ico")]
//! # Trace Scope
//!
//! > **Asynchronous context propagation for a tracing agent.**
//!
//! A tracer needs to know which operation is running *right now*, even though
//! a single request hops across callbacks, timers, promise reactions and event
//! deliveries, interleaved with every other request in flight. This crate is
//! the engine that answers that question. It does not decide what to trace and
//! knows nothing about spans beyond "a value that can be made current".
//!
//! ## 🏗️ Design Philosophy
//!
//! ### One Contract, Several Mechanisms
//!
//! Every propagation strategy implements the same [`ContextStorage`] trait:
//! - **Stack**: push/pop on the current thread. Synchronous code only.
//! - **Hooks**: listen to unit `init`/`destroy` and copy the store down.
//! - **Native**: ride on the runtime's own continuation frame.
//! - **Zone**: fork a zone per activation and intercept the scheduler.
//! - **No-op**: propagation switched off.
//!
//! The backend is picked once at start-up and injected into [`Scope`], so the
//! rest of the agent never knows which one is running.
//!
//! ### Binding Instead of Hoping
//!
//! Some continuations escape every mechanism (a listener registered under one
//! request and fired under another). [`Scope::bind`] wraps them so they
//! re-enter the context they were registered under, and [`Scope::unbind`]
//! hands back the exact original.
//!
//! ## 🗺️ Module Tour
//!
//! ### 1. The Façade ([`scope`])
//! What instrumentation calls: [`Scope::active`], [`Scope::activate`],
//! [`Scope::bind`], [`Scope::spawn`].
//!
//! ### 2. The Backends ([`storage`])
//! [`ContextStorage`] and its five implementations, plus [`BackendKind`].
//!
//! ### 3. The Adapters ([`binder`])
//! Promise, emitter and future binding.
//!
//! ### 4. The Host Runtime ([`runtime`])
//! A deterministic event loop with the hooks, frames and interception points
//! the backends react to.
//!
//! ### 5. Start-Up ([`lifecycle`], [`config`])
//! Backend resolution from `DD_TRACE_SCOPE`, no-op fallback, the process-wide
//! slot and logging setup.
//!
//! ## 🚀 Quick Start
//!
//! ```rust
//! use trace_scope::lifecycle::init;
//! use trace_scope::mock::span;
//! use trace_scope::runtime::EventLoop;
//! use trace_scope::ScopeConfig;
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//!
//! let runtime = EventLoop::new();
//! let scope = init(ScopeConfig::default(), Some(&runtime));
//! let (request, _) = span("GET /users");
//!
//! let seen = Arc::new(Mutex::new(None));
//! scope.activate(request.clone(), || {
//!     let (scope, seen) = (scope.clone(), seen.clone());
//!     runtime.set_timeout(Duration::from_millis(10), move || {
//!         *seen.lock().unwrap() = scope.active();
//!     });
//! });
//!
//! runtime.run_until_idle();
//! assert_eq!(*seen.lock().unwrap(), Some(request));
//! ```
//!
//! ### Running the Demo
//!
//! ```bash
//! RUST_LOG=debug cargo run
//! DD_TRACE_SCOPE=async_hooks RUST_LOG=debug cargo run
//! ```
//!
//! ### Running Tests
//!
//! ```bash
//! cargo test
//! ```

pub mod binder;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod mock;
pub mod runtime;
pub mod scope;
pub mod storage;

pub use binder::Bound;
pub use config::ScopeConfig;
pub use context::{ActiveContext, ContextValue, Failure};
pub use error::ScopeError;
pub use runtime::{Callback, EventEmitter, EventLoop, Promise};
pub use scope::{Bindable, Scope, Target};
pub use storage::{BackendKind, ContextStorage, StorageExt};
