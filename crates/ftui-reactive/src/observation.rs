#![forbid(unsafe_code)]

//! Computed observations with automatic dependency tracking.
//!
//! An [`Observation`] wraps a compute function. Each evaluation runs inside a
//! recording frame, and the reads it captures become the observation's
//! dependency edges. Edges are diffed on every evaluation: reads that
//! persist keep their subscription, new reads subscribe, reads that
//! disappeared unsubscribe.
//!
//! # Lifecycle
//!
//! Unbound observations hold nothing. [`get`](Observation::get) evaluates the
//! function on every call. The first subscriber binds the observation (one
//! evaluation establishes value and edges), the last subscriber leaving
//! unbinds it (edges dropped, value discarded). The cycle can repeat any
//! number of times.
//!
//! While bound, a dependency change marks the observation dirty with the
//! scheduler at rank `(priority, depth - 1)`. The scheduler recomputes it
//! when the batch drains, and subscribers are told only if the new value
//! differs from the old one.
//!
//! # Invariants
//!
//! 1. While bound, the edge set equals the reads of the last evaluation.
//! 2. `depth = 1 + max(depth of dependencies)`; cached and invalidated only
//!    when this observation's own edges change.
//! 3. A bound read never returns a value whose recomputation is already
//!    scheduled: dirty dependencies are settled first.
//!
//! # Failure Modes
//!
//! - **Compute function panics during bind**: the panic reaches the caller
//!   that subscribed. No handler is registered and the observation stays
//!   unbound.
//! - **Compute function panics during recomputation**: the panic leaves the
//!   call that closed the batch. The previous value and edges remain.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::handlers::{self, HandlerKind, Handlers};
use crate::observable::{
    BatchNum, Change, Handler, HandlerId, Notification, Observable, ObservableId, Subscription,
};
use crate::recorder::Dependencies;
use crate::runtime::Runtime;
use crate::scheduler::Recompute;

/// Per-observation scheduling and visibility options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationOptions {
    /// Primary depth: coarse rank, lower drains first.
    /// Default: 0.
    pub priority: u32,
    /// Whether reads of this observation register it with an enclosing
    /// recording.
    /// Default: `true`.
    pub observable: bool,
}

impl Default for ObservationOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            observable: true,
        }
    }
}

impl ObservationOptions {
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_observable(mut self, observable: bool) -> Self {
        self.observable = observable;
        self
    }
}

type EdgeKey = (ObservableId, Option<Rc<str>>);

struct State<T> {
    value: Option<T>,
    bound: bool,
    edges: BTreeMap<EdgeKey, Subscription>,
    dependencies: Dependencies,
    depth: Option<u32>,
    last_batch: Option<BatchNum>,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            value: None,
            bound: false,
            edges: BTreeMap::new(),
            dependencies: Dependencies::default(),
            depth: None,
            last_batch: None,
        }
    }
}

struct ObservationInner<T> {
    this: Weak<ObservationInner<T>>,
    id: ObservableId,
    runtime: Runtime,
    compute: Box<dyn Fn() -> T>,
    priority: Cell<u32>,
    observable: bool,
    state: RefCell<State<T>>,
    handlers: RefCell<Handlers<T>>,
}

/// A computed value that tracks what it reads.
///
/// Cloning yields another handle to the same observation.
pub struct Observation<T> {
    inner: Rc<ObservationInner<T>>,
}

impl<T> Clone for Observation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Observation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Observation")
            .field("id", &self.inner.id)
            .field("bound", &state.bound)
            .field("value", &state.value)
            .field("priority", &self.inner.priority.get())
            .field("edges", &state.edges.len())
            .field("handlers", &self.inner.handlers.borrow().len())
            .finish()
    }
}

impl<T: Clone + PartialEq + 'static> Observation<T> {
    /// Create an observation on the thread's default runtime.
    pub fn new(compute: impl Fn() -> T + 'static) -> Self {
        Self::new_in(&Runtime::current(), compute, ObservationOptions::default())
    }

    /// Create an observation whose function receives `context` on every call.
    pub fn with_context<C: 'static>(context: C, compute: impl Fn(&C) -> T + 'static) -> Self {
        Self::new(move || compute(&context))
    }

    pub fn with_options(compute: impl Fn() -> T + 'static, options: ObservationOptions) -> Self {
        Self::new_in(&Runtime::current(), compute, options)
    }

    /// Create an observation on an explicit runtime.
    pub fn new_in(
        runtime: &Runtime,
        compute: impl Fn() -> T + 'static,
        options: ObservationOptions,
    ) -> Self {
        let inner = Rc::new_cyclic(|this| ObservationInner {
            this: this.clone(),
            id: ObservableId::next(),
            runtime: runtime.clone(),
            compute: Box::new(compute),
            priority: Cell::new(options.priority),
            observable: options.observable,
            state: RefCell::new(State::default()),
            handlers: RefCell::new(Handlers::default()),
        });
        Self { inner }
    }

    /// Current value.
    ///
    /// Inside a recording the read is reported to the enclosing evaluation
    /// (and an unbound observation is temporarily bound). A bound
    /// observation settles dirty dependencies and returns its cached value;
    /// an unbound one evaluates its function directly.
    pub fn get(&self) -> T {
        let inner = &self.inner;
        let runtime = &inner.runtime;
        let recording = runtime.is_recording();
        if !recording {
            runtime.release_expired_temporaries();
        }
        if recording && inner.observable {
            let source = self.as_observable();
            runtime.recorder().record_read(&source, None);
            if !inner.is_bound() {
                runtime.temporarily_bind(source);
            }
        }

        if inner.is_bound() {
            if runtime.scheduler().has_dirty() {
                inner.settle_self();
            }
            if let Some(value) = inner.state.borrow().value.clone() {
                return value;
            }
        }
        (inner.compute)()
    }

    /// Bind: evaluate, record dependencies and subscribe to them. On a bound
    /// observation this re-evaluates and rediffs edges.
    pub fn start(&self) {
        self.inner.start();
    }

    /// Unbind: drop every edge and the cached value.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Subscribe to change notifications. The first subscriber binds.
    pub fn subscribe(&self, handler: impl Fn(&Notification) + 'static) -> Subscription {
        let id = self.inner.add_handler(HandlerKind::notify(handler));
        Subscription::adopt(self.as_observable(), None, id)
    }

    /// Subscribe to typed `(new, old)` changes. The first subscriber binds.
    pub fn on_change(&self, handler: impl Fn(&Change<'_, T>) + 'static) -> Subscription {
        let id = self.inner.add_handler(HandlerKind::change(handler));
        Subscription::adopt(self.as_observable(), None, id)
    }

    #[deprecated(note = "use `start`")]
    pub fn get_value_and_bind(&self) {
        tracing::warn!(
            message = "observation.deprecated",
            method = "get_value_and_bind",
            replacement = "start",
            id = self.inner.id.get()
        );
        self.start();
    }

    #[deprecated(note = "use `stop`")]
    pub fn teardown(&self) {
        tracing::warn!(
            message = "observation.deprecated",
            method = "teardown",
            replacement = "stop",
            id = self.inner.id.get()
        );
        self.stop();
    }

    #[must_use]
    pub fn as_observable(&self) -> Rc<dyn Observable> {
        Rc::clone(&self.inner) as Rc<dyn Observable>
    }

    #[must_use]
    pub fn id(&self) -> ObservableId {
        self.inner.id
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.inner.is_bound()
    }

    /// Dependencies of the last evaluation, or `None` while unbound.
    #[must_use]
    pub fn dependencies(&self) -> Option<Dependencies> {
        let state = self.inner.state.borrow();
        state.bound.then(|| state.dependencies.clone())
    }

    /// Whether the last evaluation read anything, or `None` while unbound.
    #[must_use]
    pub fn has_dependencies(&self) -> Option<bool> {
        let state = self.inner.state.borrow();
        state.bound.then(|| !state.dependencies.is_empty())
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.inner.depth()
    }

    #[must_use]
    pub fn priority(&self) -> u32 {
        self.inner.priority.get()
    }

    /// Takes effect the next time this observation is marked dirty.
    pub fn set_priority(&self, priority: u32) {
        self.inner.priority.set(priority);
    }

    /// Batch of the last dependency change that dirtied this observation.
    #[must_use]
    pub fn last_batch(&self) -> Option<BatchNum> {
        self.inner.state.borrow().last_batch
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.borrow().len()
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

impl<T: Clone + PartialEq + 'static> ObservationInner<T> {
    fn is_bound(&self) -> bool {
        self.state.borrow().bound
    }

    fn add_handler(&self, kind: HandlerKind<T>) -> HandlerId {
        if self.handlers.borrow().is_empty() && !self.is_bound() {
            self.start();
            tracing::debug!(message = "observation.bind", id = self.id.get());
        }
        self.handlers.borrow_mut().push(kind)
    }

    fn remove_handler(&self, id: HandlerId) -> bool {
        let (removed, empty) = {
            let mut handlers = self.handlers.borrow_mut();
            (handlers.remove(id), handlers.is_empty())
        };
        if removed && empty && self.is_bound() {
            self.stop();
            tracing::debug!(message = "observation.unbind", id = self.id.get());
        }
        removed
    }

    fn start(&self) {
        let (value, dependencies) = self.runtime.recorder().record(|| (self.compute)());

        let mut previous = std::mem::take(&mut self.state.borrow_mut().edges);
        let mut edges = BTreeMap::new();
        let mut attached = 0usize;
        for read in dependencies.reads() {
            let key: EdgeKey = (read.id(), read.key.clone());
            if let Some(existing) = previous.remove(&key) {
                edges.insert(key, existing);
                continue;
            }
            let this = self.this.clone();
            let handler: Handler = Rc::new(move |notification: &Notification| {
                if let Some(this) = this.upgrade() {
                    this.on_dependency_changed(notification);
                }
            });
            let subscription = Subscription::attach(read.source, read.key.as_deref(), handler);
            edges.insert(key, subscription);
            attached += 1;
        }
        let detached = previous.len();

        {
            let mut state = self.state.borrow_mut();
            state.value = Some(value);
            state.edges = edges;
            state.dependencies = dependencies;
            state.bound = true;
            if attached > 0 || detached > 0 {
                state.depth = None;
            }
        }
        // Released after the new edges are attached so that shared upstream
        // observations are not unbound and rebound.
        drop(previous);

        if attached > 0 || detached > 0 {
            tracing::trace!(
                message = "observation.edges",
                id = self.id.get(),
                attached,
                detached
            );
        }
    }

    fn stop(&self) {
        let edges = {
            let mut state = self.state.borrow_mut();
            state.bound = false;
            state.value = None;
            state.dependencies = Dependencies::default();
            state.depth = None;
            std::mem::take(&mut state.edges)
        };
        let queued = self.runtime.scheduler().take_dirty(self.id);
        drop(queued);
        drop(edges);
    }

    fn on_dependency_changed(&self, notification: &Notification) {
        if !self.is_bound() {
            return;
        }
        let scheduler = self.runtime.scheduler();
        if scheduler.is_dirty(self.id) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.state.borrow_mut().last_batch = Some(notification.batch);
        let depth = self.depth();
        scheduler.register_dirty(this, self.priority.get(), depth.saturating_sub(1));
    }

    /// Recompute and notify on change. Returns whether the value changed.
    fn update(&self) -> bool {
        let old = {
            let state = self.state.borrow();
            if !state.bound {
                return false;
            }
            state.value.clone()
        };
        self.start();
        let new = self.state.borrow().value.clone();
        let (Some(old), Some(new)) = (old, new) else {
            return false;
        };
        if old == new {
            return false;
        }

        let scheduler = self.runtime.scheduler();
        let notification = Notification {
            source: self.id,
            key: None,
            batch: scheduler
                .current_batch()
                .unwrap_or_else(|| scheduler.last_batch()),
        };
        let snapshot = self.handlers.borrow().snapshot();
        handlers::dispatch(&snapshot, &notification, &new, &old);
        true
    }

    /// Recompute now if already scheduled; otherwise settle dirty
    /// dependencies and pick up any recomputation that produced.
    fn settle_self(&self) -> bool {
        if self.take_and_update() {
            return true;
        }
        let upstream: Vec<Rc<dyn Observable>> = {
            let state = self.state.borrow();
            state
                .dependencies
                .values()
                .cloned()
                .chain(state.dependencies.keyed().map(|k| Rc::clone(&k.source)))
                .collect()
        };
        let mut settled = false;
        for source in upstream {
            settled |= source.settle();
        }
        if settled {
            self.take_and_update();
        }
        settled
    }

    fn take_and_update(&self) -> bool {
        match self.runtime.scheduler().take_dirty(self.id) {
            Some(queued) => {
                drop(queued);
                self.update();
                true
            }
            None => false,
        }
    }

    fn depth(&self) -> u32 {
        if let Some(depth) = self.state.borrow().depth {
            return depth;
        }
        let upstream: Vec<Rc<dyn Observable>> = {
            let state = self.state.borrow();
            state
                .dependencies
                .values()
                .cloned()
                .chain(state.dependencies.keyed().map(|k| Rc::clone(&k.source)))
                .collect()
        };
        let depth = 1 + upstream.iter().map(|d| d.depth()).max().unwrap_or(0);
        self.state.borrow_mut().depth = Some(depth);
        depth
    }
}

impl<T: Clone + PartialEq + 'static> Observable for ObservationInner<T> {
    fn observable_id(&self) -> ObservableId {
        self.id
    }

    fn subscribe(&self, _key: Option<&str>, handler: Handler) -> HandlerId {
        self.add_handler(HandlerKind::Notify(handler))
    }

    fn unsubscribe(&self, _key: Option<&str>, handler: HandlerId) -> bool {
        self.remove_handler(handler)
    }

    fn depth(&self) -> u32 {
        ObservationInner::depth(self)
    }

    fn settle(&self) -> bool {
        self.is_bound() && self.settle_self()
    }
}

impl<T: Clone + PartialEq + 'static> Recompute for ObservationInner<T> {
    fn node_id(&self) -> ObservableId {
        self.id
    }

    fn recompute(&self) -> bool {
        self.update()
    }
}
