#![forbid(unsafe_code)]

//! The observable capability contract.
//!
//! Anything that can be depended upon implements [`Observable`]: leaf cells
//! ([`ObservableValue`](crate::ObservableValue),
//! [`ObservableMap`](crate::ObservableMap)), adapted legacy event targets,
//! and [`Observation`](crate::Observation) itself, which is what lets
//! observations compose into graphs.
//!
//! # Invariants
//!
//! 1. `observable_id()` is stable for the lifetime of the source and unique
//!    across the process.
//! 2. A handler registered under `key = None` fires on every change; a handler
//!    registered under `Some(key)` fires only for changes to that key.
//! 3. `unsubscribe` of an unknown handler is a silent no-op returning `false`.
//! 4. Dropping a [`Subscription`] unsubscribes its handler exactly once.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identity of an observable source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObservableId(u64);

impl ObservableId {
    /// Allocate a fresh id.
    #[must_use]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObservableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle identifying one registered handler, returned at subscribe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    #[must_use]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Sequence number of a batch. Strictly increasing per runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BatchNum(u64);

impl BatchNum {
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub(crate) const fn succ(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BatchNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Untyped change notification delivered to [`Handler`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The source that changed.
    pub source: ObservableId,
    /// The key that changed, for keyed sources.
    pub key: Option<Rc<str>>,
    /// Batch the change belongs to. Lets a handler skip repeats within one batch.
    pub batch: BatchNum,
}

/// Typed change notification: `(new_value, old_value, batch)`.
#[derive(Debug)]
pub struct Change<'a, T> {
    pub new_value: &'a T,
    pub old_value: &'a T,
    pub batch: BatchNum,
}

/// Untyped change callback.
pub type Handler = Rc<dyn Fn(&Notification)>;

/// A value source that dependency recording can attach to.
pub trait Observable {
    fn observable_id(&self) -> ObservableId;

    /// Register `handler` for changes to `key` (or any change when `None`).
    fn subscribe(&self, key: Option<&str>, handler: Handler) -> HandlerId;

    /// Remove a handler. Returns whether it was registered.
    fn unsubscribe(&self, key: Option<&str>, handler: HandlerId) -> bool;

    /// Topological height used for update ordering. Plain sources are 0.
    fn depth(&self) -> u32 {
        0
    }

    /// Run any recomputation of this source, or of its dirty dependencies,
    /// that is already scheduled. Returns whether anything was recomputed.
    fn settle(&self) -> bool {
        false
    }
}

impl fmt::Debug for dyn Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Observable({})", self.observable_id())
    }
}

/// RAII guard for a registered handler. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    source: Option<Rc<dyn Observable>>,
    key: Option<Rc<str>>,
    handler: HandlerId,
}

impl Subscription {
    /// Subscribe `handler` to `source` and guard the registration.
    pub fn attach(source: Rc<dyn Observable>, key: Option<&str>, handler: Handler) -> Self {
        let id = source.subscribe(key, handler);
        Self {
            source: Some(source),
            key: key.map(Rc::from),
            handler: id,
        }
    }

    /// Guard a handler that was registered on `source` by other means.
    pub(crate) fn adopt(source: Rc<dyn Observable>, key: Option<&str>, handler: HandlerId) -> Self {
        Self {
            source: Some(source),
            key: key.map(Rc::from),
            handler,
        }
    }

    #[must_use]
    pub fn handler_id(&self) -> HandlerId {
        self.handler
    }

    #[must_use]
    pub fn source_id(&self) -> Option<ObservableId> {
        self.source.as_ref().map(|s| s.observable_id())
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(source) = self.source.take() {
            source.unsubscribe(self.key.as_deref(), self.handler);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("source", &self.source_id())
            .field("key", &self.key)
            .field("handler", &self.handler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct LogSource {
        id: Option<ObservableId>,
        log: RefCell<Vec<String>>,
    }

    impl Observable for LogSource {
        fn observable_id(&self) -> ObservableId {
            self.id.unwrap_or(ObservableId(0))
        }

        fn subscribe(&self, key: Option<&str>, _handler: Handler) -> HandlerId {
            self.log.borrow_mut().push(format!("on {key:?}"));
            HandlerId::next()
        }

        fn unsubscribe(&self, key: Option<&str>, _handler: HandlerId) -> bool {
            self.log.borrow_mut().push(format!("off {key:?}"));
            true
        }
    }

    #[test]
    fn ids_are_unique() {
        let a = ObservableId::next();
        let b = ObservableId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn subscription_unsubscribes_once_on_drop() {
        let source = Rc::new(LogSource::default());
        let sub = Subscription::attach(source.clone(), Some("width"), Rc::new(|_: &Notification| {}));
        assert_eq!(source.log.borrow().len(), 1);
        drop(sub);
        assert_eq!(
            *source.log.borrow(),
            vec!["on Some(\"width\")".to_string(), "off Some(\"width\")".to_string()]
        );
    }

    #[test]
    fn explicit_unsubscribe_does_not_double_release() {
        let source = Rc::new(LogSource::default());
        let sub = Subscription::attach(source.clone(), None, Rc::new(|_: &Notification| {}));
        sub.unsubscribe();
        assert_eq!(source.log.borrow().len(), 2);
    }

    #[test]
    fn batch_num_ordering() {
        assert!(BatchNum::new(1).succ() > BatchNum::new(1));
        assert_eq!(BatchNum::new(3).to_string(), "3");
    }
}
