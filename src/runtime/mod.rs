//! # Host Runtime
//!
//! A deterministic, single-threaded, cooperatively scheduled event loop. It is
//! the runtime the context engine reacts to: flows hop between timers,
//! immediates, microtasks and promise reactions, and the loop reports every hop
//! through the narrow interfaces the storage backends consume.
//!
//! ## Downward interfaces
//!
//! | Interface | Used by | What it reports |
//! |-----------|---------|-----------------|
//! | [`AsyncHook`] | hook backend | `init` / `before` / `after` / `destroy` of every unit |
//! | [`frame`] | native backend | the continuation frame captured at scheduling time |
//! | [`TaskInterceptor`] | zone backend | every job, at scheduling time, for wrapping |
//!
//! Each interface can be switched off through [`RuntimeCapabilities`], which is
//! how backend selection probes for what is available.
//!
//! ## Units
//!
//! Every scheduled piece of work is an execution unit with a fresh [`UnitId`].
//! `init` fires when the unit is created, with the unit that was executing at
//! the time as the trigger. `destroy` fires exactly once, after the unit ran,
//! when it is cancelled, or when it is dropped without running (for example a
//! reaction on a promise that never settles).
//!
//! ## Time
//!
//! Timers run on a virtual clock. `run_until_idle` jumps the clock straight to
//! the next deadline, so tests never sleep.

pub mod callback;
pub mod emitter;
pub mod frame;
pub mod promise;
pub mod slot;

pub use callback::{Callback, WeakCallback};
pub use emitter::{
    AddListenerMethod, AddMode, EmitterMethods, EventEmitter, Listener, RemoveAllListenersMethod,
    RemoveListenerMethod,
};
pub use frame::{ContextFrame, FrameKey};
pub use promise::{payload, Handler, Outcome, Payload, Promise, ThenMethod};
pub use slot::{Marker, MethodSlot};

use crate::error::ScopeError;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Identity of one execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

impl UnitId {
    /// The top-level flow: code running outside any scheduled unit.
    pub const ROOT: UnitId = UnitId(1);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of work a unit represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Timeout,
    Immediate,
    Microtask,
    PromiseReaction,
}

/// Handle for a pending timeout, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(UnitId);

impl TimerId {
    pub fn unit(self) -> UnitId {
        self.0
    }
}

/// Registration handle for hooks and interceptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Async lifecycle notifications.
///
/// All methods are called synchronously on the loop thread. `init` runs inside
/// the scheduling call, so the scheduling flow is still current.
pub trait AsyncHook: Send + Sync {
    fn init(&self, unit: UnitId, kind: UnitKind, trigger: UnitId);
    fn before(&self, _unit: UnitId) {}
    fn after(&self, _unit: UnitId) {}
    fn destroy(&self, _unit: UnitId) {}
}

/// Scheduler patching: sees every job when it is scheduled and may wrap it.
pub trait TaskInterceptor: Send + Sync {
    fn intercept(&self, kind: UnitKind, job: Job) -> Job;
}

/// Which propagation primitives the runtime offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeCapabilities {
    pub async_hooks: bool,
    pub context_frames: bool,
    pub scheduler_patching: bool,
}

impl RuntimeCapabilities {
    /// A runtime that offers none of the primitives.
    pub const NONE: RuntimeCapabilities = RuntimeCapabilities {
        async_hooks: false,
        context_frames: false,
        scheduler_patching: false,
    };
}

impl Default for RuntimeCapabilities {
    fn default() -> Self {
        Self {
            async_hooks: true,
            context_frames: true,
            scheduler_patching: true,
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Renders a panic payload the way the standard panic hook does.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

struct DestroyOnDrop {
    unit: UnitId,
    runtime: Weak<LoopInner>,
}

impl Drop for DestroyOnDrop {
    fn drop(&mut self) {
        if let Some(inner) = self.runtime.upgrade() {
            for hook in inner.hooks() {
                hook.destroy(self.unit);
            }
        }
    }
}

/// A prepared unit: its id is allocated and `init` has fired.
pub(crate) struct Task {
    unit: UnitId,
    kind: UnitKind,
    job: Job,
    frame: Option<ContextFrame>,
    destroy: DestroyOnDrop,
}

#[derive(Default)]
struct Queues {
    microtasks: VecDeque<Task>,
    immediates: VecDeque<Task>,
    timers: BTreeMap<(u64, UnitId), Task>,
}

struct LoopInner {
    capabilities: RuntimeCapabilities,
    next_unit: AtomicU64,
    next_hook: AtomicU64,
    now_ms: AtomicU64,
    queues: Mutex<Queues>,
    executing: Mutex<Vec<UnitId>>,
    hooks: RwLock<Vec<(HookId, Arc<dyn AsyncHook>)>>,
    interceptors: RwLock<Vec<(HookId, Arc<dyn TaskInterceptor>)>>,
}

impl LoopInner {
    fn hooks(&self) -> Vec<Arc<dyn AsyncHook>> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, hook)| hook.clone())
            .collect()
    }

    fn interceptors(&self) -> Vec<Arc<dyn TaskInterceptor>> {
        self.interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, interceptor)| interceptor.clone())
            .collect()
    }
}

/// Pops the executing stack and fires `after`, including during unwinding.
struct ExecutionGuard<'a> {
    inner: &'a LoopInner,
    unit: UnitId,
}

impl<'a> ExecutionGuard<'a> {
    fn enter(inner: &'a LoopInner, unit: UnitId) -> Self {
        lock(&inner.executing).push(unit);
        for hook in inner.hooks() {
            hook.before(unit);
        }
        Self { inner, unit }
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        for hook in self.inner.hooks() {
            hook.after(self.unit);
        }
        let mut executing = lock(&self.inner.executing);
        if executing.last() == Some(&self.unit) {
            executing.pop();
        }
    }
}

/// The single-threaded cooperative scheduler.
///
/// Cloning yields another handle to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_capabilities(RuntimeCapabilities::default())
    }

    pub fn with_capabilities(capabilities: RuntimeCapabilities) -> Self {
        Self {
            inner: Arc::new(LoopInner {
                capabilities,
                next_unit: AtomicU64::new(UnitId::ROOT.0 + 1),
                next_hook: AtomicU64::new(1),
                now_ms: AtomicU64::new(0),
                queues: Mutex::new(Queues::default()),
                executing: Mutex::new(Vec::new()),
                hooks: RwLock::new(Vec::new()),
                interceptors: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn capabilities(&self) -> RuntimeCapabilities {
        self.inner.capabilities
    }

    /// Virtual time elapsed since the loop was created.
    pub fn now(&self) -> Duration {
        Duration::from_millis(self.inner.now_ms.load(Ordering::Acquire))
    }

    /// The unit currently executing, or [`UnitId::ROOT`] outside any callback.
    pub fn current_unit(&self) -> UnitId {
        lock(&self.inner.executing)
            .last()
            .copied()
            .unwrap_or(UnitId::ROOT)
    }

    // --- Hooks & Interceptors ---

    pub fn add_hook(&self, hook: Arc<dyn AsyncHook>) -> Result<HookId, ScopeError> {
        if !self.inner.capabilities.async_hooks {
            return Err(ScopeError::Unsupported {
                capability: "async_hooks",
            });
        }
        let id = HookId(self.inner.next_hook.fetch_add(1, Ordering::Relaxed));
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, hook));
        debug!(hook = id.0, "Async hook installed");
        Ok(id)
    }

    pub fn remove_hook(&self, id: HookId) -> bool {
        let mut hooks = self
            .inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        before != hooks.len()
    }

    pub fn add_interceptor(
        &self,
        interceptor: Arc<dyn TaskInterceptor>,
    ) -> Result<HookId, ScopeError> {
        if !self.inner.capabilities.scheduler_patching {
            return Err(ScopeError::Unsupported {
                capability: "scheduler_patching",
            });
        }
        let id = HookId(self.inner.next_hook.fetch_add(1, Ordering::Relaxed));
        self.inner
            .interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, interceptor));
        debug!(interceptor = id.0, "Scheduler interceptor installed");
        Ok(id)
    }

    pub fn remove_interceptor(&self, id: HookId) -> bool {
        let mut interceptors = self
            .inner
            .interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = interceptors.len();
        interceptors.retain(|(interceptor_id, _)| *interceptor_id != id);
        before != interceptors.len()
    }

    // --- Scheduling ---

    pub fn set_timeout(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerId {
        let task = self.prepare(UnitKind::Timeout, Box::new(f));
        let unit = task.unit;
        // Oversized delays saturate at the end of virtual time.
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let deadline = self
            .inner
            .now_ms
            .load(Ordering::Acquire)
            .saturating_add(delay_ms);
        lock(&self.inner.queues)
            .timers
            .insert((deadline, unit), task);
        TimerId(unit)
    }

    /// Cancels a pending timeout. Its unit is destroyed without running.
    pub fn clear_timeout(&self, id: TimerId) -> bool {
        let removed = {
            let mut queues = lock(&self.inner.queues);
            let key = queues.timers.keys().find(|(_, unit)| *unit == id.0).copied();
            key.and_then(|key| queues.timers.remove(&key))
        };
        removed.is_some()
    }

    pub fn set_immediate(&self, f: impl FnOnce() + Send + 'static) -> UnitId {
        let task = self.prepare(UnitKind::Immediate, Box::new(f));
        let unit = task.unit;
        lock(&self.inner.queues).immediates.push_back(task);
        unit
    }

    pub fn queue_microtask(&self, f: impl FnOnce() + Send + 'static) -> UnitId {
        let task = self.prepare(UnitKind::Microtask, Box::new(f));
        let unit = task.unit;
        self.enqueue_microtask(task);
        unit
    }

    /// Allocates a unit for `job`, firing `init` and applying interceptors.
    pub(crate) fn prepare(&self, kind: UnitKind, job: Job) -> Task {
        let unit = UnitId(self.inner.next_unit.fetch_add(1, Ordering::Relaxed));
        let trigger = self.current_unit();
        for hook in self.inner.hooks() {
            hook.init(unit, kind, trigger);
        }
        let job = self
            .inner
            .interceptors()
            .into_iter()
            .fold(job, |job, interceptor| interceptor.intercept(kind, job));
        let frame = self
            .inner
            .capabilities
            .context_frames
            .then(frame::current);
        trace!(unit = %unit, trigger = %trigger, ?kind, "Unit created");
        Task {
            unit,
            kind,
            job,
            frame,
            destroy: DestroyOnDrop {
                unit,
                runtime: Arc::downgrade(&self.inner),
            },
        }
    }

    pub(crate) fn enqueue_microtask(&self, task: Task) {
        lock(&self.inner.queues).microtasks.push_back(task);
    }

    /// Number of units waiting to run.
    pub fn pending(&self) -> usize {
        let queues = lock(&self.inner.queues);
        queues.microtasks.len() + queues.immediates.len() + queues.timers.len()
    }

    // --- Execution ---

    /// Runs work until every queue is empty. Returns the number of units run.
    ///
    /// Microtasks always drain first; timers that are due run before
    /// immediates; otherwise the clock jumps to the next deadline.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.next_task() {
            self.execute(task);
            ran += 1;
        }
        debug!(ran, now_ms = self.inner.now_ms.load(Ordering::Acquire), "Event loop idle");
        ran
    }

    fn next_task(&self) -> Option<Task> {
        let mut queues = lock(&self.inner.queues);
        if let Some(task) = queues.microtasks.pop_front() {
            return Some(task);
        }
        let now = self.inner.now_ms.load(Ordering::Acquire);
        let next_timer = queues.timers.keys().next().copied();
        if let Some(key) = next_timer.filter(|(deadline, _)| *deadline <= now) {
            return queues.timers.remove(&key);
        }
        if let Some(task) = queues.immediates.pop_front() {
            return Some(task);
        }
        let key = next_timer?;
        self.inner.now_ms.fetch_max(key.0, Ordering::AcqRel);
        queues.timers.remove(&key)
    }

    fn execute(&self, task: Task) {
        let Task {
            unit,
            kind,
            job,
            frame,
            destroy: _destroy,
        } = task;
        trace!(unit = %unit, ?kind, "Unit running");
        let _frame = frame.map(frame::FrameGuard::enter);
        let _execution = ExecutionGuard::enter(&self.inner, unit);
        job();
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("capabilities", &self.inner.capabilities)
            .field("now", &self.now())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            lock(&self.events).clone()
        }
    }

    impl AsyncHook for Recorder {
        fn init(&self, unit: UnitId, _kind: UnitKind, trigger: UnitId) {
            lock(&self.events).push(format!("init {} from {}", unit, trigger));
        }
        fn before(&self, unit: UnitId) {
            lock(&self.events).push(format!("before {}", unit));
        }
        fn after(&self, unit: UnitId) {
            lock(&self.events).push(format!("after {}", unit));
        }
        fn destroy(&self, unit: UnitId) {
            lock(&self.events).push(format!("destroy {}", unit));
        }
    }

    #[test]
    fn timers_run_in_deadline_order_on_virtual_time() {
        let runtime = EventLoop::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay, label) in [(30, "c"), (10, "a"), (20, "b")] {
            let order = order.clone();
            runtime.set_timeout(Duration::from_millis(delay), move || {
                lock(&order).push(label);
            });
        }

        assert_eq!(runtime.run_until_idle(), 3);
        assert_eq!(*lock(&order), vec!["a", "b", "c"]);
        assert_eq!(runtime.now(), Duration::from_millis(30));
    }

    #[test]
    fn oversized_delays_run_after_short_ones() {
        let runtime = EventLoop::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        runtime.set_timeout(Duration::from_secs(1 << 62), move || lock(&o).push("huge"));
        let o = order.clone();
        runtime.set_timeout(Duration::from_millis(10), move || lock(&o).push("short"));

        assert_eq!(runtime.run_until_idle(), 2);
        assert_eq!(*lock(&order), vec!["short", "huge"]);
        assert_eq!(runtime.now(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn maximal_delay_after_the_clock_advanced_does_not_overflow() {
        let runtime = EventLoop::new();
        runtime.set_timeout(Duration::from_millis(1), || {});
        runtime.run_until_idle();
        assert_eq!(runtime.now(), Duration::from_millis(1));

        let ran = Arc::new(Mutex::new(false));
        let r = ran.clone();
        runtime.set_timeout(Duration::MAX, move || *lock(&r) = true);

        assert_eq!(runtime.run_until_idle(), 1);
        assert!(*lock(&ran));
    }

    #[test]
    fn microtasks_drain_before_macrotasks() {
        let runtime = EventLoop::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        runtime.set_immediate(move || lock(&o).push("immediate"));
        let o = order.clone();
        runtime.queue_microtask(move || lock(&o).push("microtask"));

        runtime.run_until_idle();
        assert_eq!(*lock(&order), vec!["microtask", "immediate"]);
    }

    #[test]
    fn hooks_see_full_unit_lifecycle_with_triggers() {
        let runtime = EventLoop::new();
        let recorder = Arc::new(Recorder::default());
        runtime.add_hook(recorder.clone()).unwrap();

        let inner = runtime.clone();
        let outer = runtime.set_immediate(move || {
            inner.queue_microtask(|| {});
        });

        runtime.run_until_idle();

        let child = UnitId(outer.0 + 1);
        assert_eq!(
            recorder.events(),
            vec![
                format!("init {} from {}", outer, UnitId::ROOT),
                format!("before {}", outer),
                format!("init {} from {}", child, outer),
                format!("after {}", outer),
                format!("destroy {}", outer),
                format!("before {}", child),
                format!("after {}", child),
                format!("destroy {}", child),
            ]
        );
    }

    #[test]
    fn cleared_timers_are_destroyed_without_running() {
        let runtime = EventLoop::new();
        let recorder = Arc::new(Recorder::default());
        runtime.add_hook(recorder.clone()).unwrap();

        let timer = runtime.set_timeout(Duration::from_millis(5), || panic!("must not run"));
        assert!(runtime.clear_timeout(timer));

        assert_eq!(runtime.run_until_idle(), 0);
        assert!(recorder
            .events()
            .contains(&format!("destroy {}", timer.unit())));
    }

    #[test]
    fn hooks_require_the_capability() {
        let runtime = EventLoop::with_capabilities(RuntimeCapabilities::NONE);
        let result = runtime.add_hook(Arc::new(Recorder::default()));
        assert_eq!(
            result.err(),
            Some(ScopeError::Unsupported {
                capability: "async_hooks"
            })
        );
    }

    #[test]
    fn current_unit_tracks_execution() {
        let runtime = EventLoop::new();
        assert_eq!(runtime.current_unit(), UnitId::ROOT);

        let seen = Arc::new(Mutex::new(None));
        let (handle, s) = (runtime.clone(), seen.clone());
        let unit = runtime.set_immediate(move || {
            *lock(&s) = Some(handle.current_unit());
        });
        runtime.run_until_idle();

        assert_eq!(*lock(&seen), Some(unit));
        assert_eq!(runtime.current_unit(), UnitId::ROOT);
    }
}
