#![forbid(unsafe_code)]

//! Adapter for add/remove-listener style event sources.
//!
//! Types that only know how to register named listeners implement
//! [`EventTarget`]; wrapping them in [`EventTargetObservable`] makes them
//! [`Observable`], with event names as keys. Each subscribed key installs
//! exactly one listener on the target, removed again when the last handler
//! for that key leaves.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashMap;

use crate::handlers::{self, HandlerKind, Handlers};
use crate::observable::{Handler, HandlerId, Notification, Observable, ObservableId, Subscription};
use crate::runtime::Runtime;

/// Event name used for subscriptions that do not name one.
pub const DEFAULT_EVENT: &str = "change";

pub type Listener = Rc<dyn Fn()>;

/// An event source with named listeners.
pub trait EventTarget {
    fn add_event_listener(&self, event: &str, listener: Listener);

    /// Remove a listener previously added for `event`, matched by pointer.
    fn remove_event_listener(&self, event: &str, listener: &Listener) -> bool;
}

struct Installed {
    listener: Listener,
    handlers: Handlers<()>,
}

struct AdapterInner<E> {
    this: Weak<AdapterInner<E>>,
    id: ObservableId,
    runtime: Runtime,
    target: E,
    installed: RefCell<AHashMap<Rc<str>, Installed>>,
}

/// [`Observable`] view of an [`EventTarget`].
pub struct EventTargetObservable<E> {
    inner: Rc<AdapterInner<E>>,
}

impl<E> Clone for EventTargetObservable<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E> fmt::Debug for EventTargetObservable<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let installed = self.inner.installed.borrow();
        let mut events: Vec<&str> = installed.keys().map(|k| k.as_ref()).collect();
        events.sort_unstable();
        f.debug_struct("EventTargetObservable")
            .field("id", &self.inner.id)
            .field("events", &events)
            .finish()
    }
}

impl<E: EventTarget + 'static> EventTargetObservable<E> {
    pub fn new(target: E) -> Self {
        Self::new_in(&Runtime::current(), target)
    }

    pub fn new_in(runtime: &Runtime, target: E) -> Self {
        let inner = Rc::new_cyclic(|this| AdapterInner {
            this: this.clone(),
            id: ObservableId::next(),
            runtime: runtime.clone(),
            target,
            installed: RefCell::new(AHashMap::new()),
        });
        Self { inner }
    }

    #[must_use]
    pub fn target(&self) -> &E {
        &self.inner.target
    }

    /// Record a dependency on `event` in the current recording.
    pub fn track(&self, event: &str) {
        let recorder = self.inner.runtime.recorder();
        if recorder.is_recording() {
            recorder.record_read(&self.as_observable(), Some(event));
        }
    }

    pub fn subscribe(
        &self,
        event: &str,
        handler: impl Fn(&Notification) + 'static,
    ) -> Subscription {
        let id = self.inner.subscribe(Some(event), Rc::new(handler));
        Subscription::adopt(self.as_observable(), Some(event), id)
    }

    #[must_use]
    pub fn as_observable(&self) -> Rc<dyn Observable> {
        Rc::clone(&self.inner) as Rc<dyn Observable>
    }

    #[must_use]
    pub fn id(&self) -> ObservableId {
        self.inner.id
    }

    /// Number of events with a listener installed on the target.
    #[must_use]
    pub fn installed_count(&self) -> usize {
        self.inner.installed.borrow().len()
    }
}

impl<E: EventTarget + 'static> AdapterInner<E> {
    fn fire(&self, event: &Rc<str>) {
        let this = self.this.clone();
        let source = self.id;
        let event = Rc::clone(event);
        let dispatched = self.runtime.dispatch(move |batch| {
            let Some(this) = this.upgrade() else {
                return;
            };
            let snapshot = this
                .installed
                .borrow()
                .get(&event)
                .map(|i| i.handlers.snapshot())
                .unwrap_or_default();
            let notification = Notification {
                source,
                key: Some(event),
                batch,
            };
            handlers::dispatch(&snapshot, &notification, &(), &());
        });
        if let Err(err) = dispatched {
            tracing::error!(message = "legacy.fire.failed", source = source.get(), error = %err);
        }
    }
}

impl<E: EventTarget + 'static> Observable for AdapterInner<E> {
    fn observable_id(&self) -> ObservableId {
        self.id
    }

    fn subscribe(&self, key: Option<&str>, handler: Handler) -> HandlerId {
        let event: Rc<str> = Rc::from(key.unwrap_or(DEFAULT_EVENT));
        let mut installed = self.installed.borrow_mut();
        if let Some(entry) = installed.get_mut(&event) {
            return entry.handlers.push(HandlerKind::Notify(handler));
        }

        let this = self.this.clone();
        let name = Rc::clone(&event);
        let listener: Listener = Rc::new(move || {
            if let Some(this) = this.upgrade() {
                this.fire(&name);
            }
        });
        let mut handlers = Handlers::default();
        let id = handlers.push(HandlerKind::Notify(handler));
        installed.insert(
            Rc::clone(&event),
            Installed {
                listener: Rc::clone(&listener),
                handlers,
            },
        );
        drop(installed);
        self.target.add_event_listener(&event, listener);
        tracing::trace!(message = "legacy.listen", source = self.id.get(), event = %event);
        id
    }

    fn unsubscribe(&self, key: Option<&str>, handler: HandlerId) -> bool {
        let event = key.unwrap_or(DEFAULT_EVENT);
        let released = {
            let mut installed = self.installed.borrow_mut();
            let Some(entry) = installed.get_mut(event) else {
                return false;
            };
            if !entry.handlers.remove(handler) {
                return false;
            }
            if entry.handlers.is_empty() {
                installed.remove(event)
            } else {
                None
            }
        };
        if let Some(entry) = released {
            self.target.remove_event_listener(event, &entry.listener);
            tracing::trace!(message = "legacy.unlisten", source = self.id.get(), event);
        }
        true
    }
}
