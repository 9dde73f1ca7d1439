#![forbid(unsafe_code)]

//! Keyed leaf cells.
//!
//! [`ObservableMap`] records reads per key, so an observation that read
//! `map.get("width")` recomputes only when `width` changes. Whole-map reads
//! ([`keys`](ObservableMap::keys), [`len`](ObservableMap::len)) record a
//! whole-value dependency and are notified on every change.
//!
//! Typed handlers receive `Option<V>` on both sides: `None` stands for an
//! absent key.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashMap;

use crate::handlers::{self, HandlerKind, Handlers};
use crate::observable::{
    Change, Handler, HandlerId, Notification, Observable, ObservableId, Subscription,
};
use crate::runtime::Runtime;

struct MapInner<V> {
    this: Weak<MapInner<V>>,
    id: ObservableId,
    runtime: Runtime,
    entries: RefCell<BTreeMap<Rc<str>, V>>,
    any: RefCell<Handlers<Option<V>>>,
    keyed: RefCell<AHashMap<Rc<str>, Handlers<Option<V>>>>,
}

/// A string-keyed observable map.
pub struct ObservableMap<V> {
    inner: Rc<MapInner<V>>,
}

impl<V> Clone for ObservableMap<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for ObservableMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableMap")
            .field("id", &self.inner.id)
            .field("entries", &*self.inner.entries.borrow())
            .finish()
    }
}

impl<V: Clone + PartialEq + 'static> Default for ObservableMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + PartialEq + 'static> ObservableMap<V> {
    pub fn new() -> Self {
        Self::new_in(&Runtime::current())
    }

    pub fn new_in(runtime: &Runtime) -> Self {
        let inner = Rc::new_cyclic(|this| MapInner {
            this: this.clone(),
            id: ObservableId::next(),
            runtime: runtime.clone(),
            entries: RefCell::new(BTreeMap::new()),
            any: RefCell::new(Handlers::default()),
            keyed: RefCell::new(AHashMap::new()),
        });
        Self { inner }
    }

    /// Value at `key`. Recorded as a read of that key.
    pub fn get(&self, key: &str) -> Option<V> {
        self.track(Some(key));
        self.inner.entries.borrow().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.track(Some(key));
        self.inner.entries.borrow().contains_key(key)
    }

    /// Insert or replace. Returns the previous value. Equal values are a
    /// no-op.
    pub fn set(&self, key: &str, value: V) -> Option<V> {
        let old = {
            let mut entries = self.inner.entries.borrow_mut();
            if entries.get(key) == Some(&value) {
                return Some(value);
            }
            entries.insert(Rc::from(key), value.clone())
        };
        self.inner.notify(Rc::from(key), Some(value), old.clone());
        old
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let old = self.inner.entries.borrow_mut().remove(key)?;
        self.inner.notify(Rc::from(key), None, Some(old.clone()));
        Some(old)
    }

    /// Keys in sorted order. Recorded as a whole-map read.
    pub fn keys(&self) -> Vec<Rc<str>> {
        self.track(None);
        self.inner.entries.borrow().keys().cloned().collect()
    }

    /// Recorded as a whole-map read.
    pub fn len(&self) -> usize {
        self.track(None);
        self.inner.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to changes of any key.
    pub fn subscribe(&self, handler: impl Fn(&Notification) + 'static) -> Subscription {
        let id = self.inner.any.borrow_mut().push(HandlerKind::notify(handler));
        Subscription::adopt(self.as_observable(), None, id)
    }

    /// Subscribe to changes of one key.
    pub fn subscribe_key(
        &self,
        key: &str,
        handler: impl Fn(&Notification) + 'static,
    ) -> Subscription {
        let id = self.inner.push_keyed(key, HandlerKind::notify(handler));
        Subscription::adopt(self.as_observable(), Some(key), id)
    }

    /// Subscribe to typed changes of one key.
    pub fn on_key_change(
        &self,
        key: &str,
        handler: impl Fn(&Change<'_, Option<V>>) + 'static,
    ) -> Subscription {
        let id = self.inner.push_keyed(key, HandlerKind::change(handler));
        Subscription::adopt(self.as_observable(), Some(key), id)
    }

    #[must_use]
    pub fn as_observable(&self) -> Rc<dyn Observable> {
        Rc::clone(&self.inner) as Rc<dyn Observable>
    }

    #[must_use]
    pub fn id(&self) -> ObservableId {
        self.inner.id
    }

    /// Handlers registered for `key`, or for any key when `None`.
    #[must_use]
    pub fn subscriber_count(&self, key: Option<&str>) -> usize {
        match key {
            None => self.inner.any.borrow().len(),
            Some(key) => self.inner.keyed.borrow().get(key).map_or(0, Handlers::len),
        }
    }

    fn track(&self, key: Option<&str>) {
        let recorder = self.inner.runtime.recorder();
        if recorder.is_recording() {
            recorder.record_read(&self.as_observable(), key);
        }
    }
}

impl<V: Clone + PartialEq + 'static> MapInner<V> {
    fn push_keyed(&self, key: &str, kind: HandlerKind<Option<V>>) -> HandlerId {
        let mut keyed = self.keyed.borrow_mut();
        match keyed.get_mut(key) {
            Some(handlers) => handlers.push(kind),
            None => {
                let mut handlers = Handlers::default();
                let id = handlers.push(kind);
                keyed.insert(Rc::from(key), handlers);
                id
            }
        }
    }

    fn notify(&self, key: Rc<str>, new: Option<V>, old: Option<V>) {
        let this = self.this.clone();
        let source = self.id;
        let dispatched = self.runtime.dispatch(move |batch| {
            let Some(this) = this.upgrade() else {
                return;
            };
            let per_key = this
                .keyed
                .borrow()
                .get(&key)
                .map(Handlers::snapshot)
                .unwrap_or_default();
            let any = this.any.borrow().snapshot();
            let notification = Notification {
                source,
                key: Some(key),
                batch,
            };
            handlers::dispatch(&per_key, &notification, &new, &old);
            handlers::dispatch(&any, &notification, &new, &old);
        });
        if let Err(err) = dispatched {
            tracing::error!(message = "map.set.failed", source = source.get(), error = %err);
        }
    }
}

impl<V: Clone + PartialEq + 'static> Observable for MapInner<V> {
    fn observable_id(&self) -> ObservableId {
        self.id
    }

    fn subscribe(&self, key: Option<&str>, handler: Handler) -> HandlerId {
        match key {
            None => self.any.borrow_mut().push(HandlerKind::Notify(handler)),
            Some(key) => self.push_keyed(key, HandlerKind::Notify(handler)),
        }
    }

    fn unsubscribe(&self, key: Option<&str>, handler: HandlerId) -> bool {
        match key {
            None => self.any.borrow_mut().remove(handler),
            Some(key) => {
                let mut keyed = self.keyed.borrow_mut();
                let Some(handlers) = keyed.get_mut(key) else {
                    return false;
                };
                let removed = handlers.remove(handler);
                if handlers.is_empty() {
                    keyed.remove(key);
                }
                removed
            }
        }
    }
}
