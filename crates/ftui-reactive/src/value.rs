#![forbid(unsafe_code)]

//! Whole-value leaf cells.
//!
//! # Invariants
//!
//! 1. `set` with a value equal to the current one is a no-op: no version
//!    bump, no notification.
//! 2. The stored value changes immediately; notifications go through the
//!    runtime's batch machinery, so inside a batch they are delivered when the
//!    batch closes.
//! 3. Handlers are snapshotted at delivery time. A handler removed before
//!    delivery is not called.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::handlers::{self, HandlerKind, Handlers};
use crate::observable::{
    Change, Handler, HandlerId, Notification, Observable, ObservableId, Subscription,
};
use crate::runtime::Runtime;

struct ValueInner<T> {
    this: Weak<ValueInner<T>>,
    id: ObservableId,
    runtime: Runtime,
    value: RefCell<T>,
    version: Cell<u64>,
    handlers: RefCell<Handlers<T>>,
}

/// A shared, observable value.
///
/// Cloning yields another handle to the same cell.
pub struct ObservableValue<T> {
    inner: Rc<ValueInner<T>>,
}

impl<T> Clone for ObservableValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ObservableValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableValue")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.borrow())
            .field("version", &self.inner.version.get())
            .field("subscribers", &self.inner.handlers.borrow().len())
            .finish()
    }
}

impl<T: Clone + PartialEq + 'static> ObservableValue<T> {
    /// Create a cell on the thread's default runtime.
    pub fn new(value: T) -> Self {
        Self::new_in(&Runtime::current(), value)
    }

    pub fn new_in(runtime: &Runtime, value: T) -> Self {
        let inner = Rc::new_cyclic(|this| ValueInner {
            this: this.clone(),
            id: ObservableId::next(),
            runtime: runtime.clone(),
            value: RefCell::new(value),
            version: Cell::new(0),
            handlers: RefCell::new(Handlers::default()),
        });
        Self { inner }
    }

    /// Current value. Recorded as a whole-value read.
    pub fn get(&self) -> T {
        self.track();
        self.inner.value.borrow().clone()
    }

    /// Current value, not recorded.
    #[must_use]
    pub fn get_untracked(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Borrow the value without cloning. Recorded as a whole-value read.
    ///
    /// # Panics
    ///
    /// Panics if `f` mutates this cell through [`set`](Self::set) or
    /// [`update`](Self::update) (re-entrant borrow), including indirectly
    /// through a drain that `f` triggers. Reads inside `f` are fine.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track();
        f(&self.inner.value.borrow())
    }

    /// Replace the value and notify if it changed.
    pub fn set(&self, value: T) {
        let old = {
            let mut current = self.inner.value.borrow_mut();
            if *current == value {
                return;
            }
            std::mem::replace(&mut *current, value)
        };
        let new = self.inner.value.borrow().clone();
        self.inner.version.set(self.inner.version.get() + 1);
        self.inner.notify(new, old);
    }

    /// Modify the value in place and notify if it changed.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut next = self.inner.value.borrow().clone();
        f(&mut next);
        self.set(next);
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self, handler: impl Fn(&Notification) + 'static) -> Subscription {
        let id = self.inner.handlers.borrow_mut().push(HandlerKind::notify(handler));
        Subscription::adopt(self.as_observable(), None, id)
    }

    /// Subscribe to typed `(new, old)` changes.
    pub fn on_change(&self, handler: impl Fn(&Change<'_, T>) + 'static) -> Subscription {
        let id = self.inner.handlers.borrow_mut().push(HandlerKind::change(handler));
        Subscription::adopt(self.as_observable(), None, id)
    }

    #[must_use]
    pub fn as_observable(&self) -> Rc<dyn Observable> {
        Rc::clone(&self.inner) as Rc<dyn Observable>
    }

    #[must_use]
    pub fn id(&self) -> ObservableId {
        self.inner.id
    }

    /// Number of value changes so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.borrow().len()
    }

    fn track(&self) {
        let recorder = self.inner.runtime.recorder();
        if recorder.is_recording() {
            recorder.record_read(&self.as_observable(), None);
        }
    }
}

impl<T: Clone + PartialEq + 'static> ValueInner<T> {
    fn notify(&self, new: T, old: T) {
        let this = self.this.clone();
        let source = self.id;
        let dispatched = self.runtime.dispatch(move |batch| {
            let Some(this) = this.upgrade() else {
                return;
            };
            let snapshot = this.handlers.borrow().snapshot();
            let notification = Notification {
                source,
                key: None,
                batch,
            };
            handlers::dispatch(&snapshot, &notification, &new, &old);
        });
        if let Err(err) = dispatched {
            tracing::error!(message = "value.set.failed", source = source.get(), error = %err);
        }
    }
}

impl<T: Clone + PartialEq + 'static> Observable for ValueInner<T> {
    fn observable_id(&self) -> ObservableId {
        self.id
    }

    fn subscribe(&self, _key: Option<&str>, handler: Handler) -> HandlerId {
        self.handlers.borrow_mut().push(HandlerKind::Notify(handler))
    }

    fn unsubscribe(&self, _key: Option<&str>, handler: HandlerId) -> bool {
        self.handlers.borrow_mut().remove(handler)
    }
}
