#![forbid(unsafe_code)]

//! Short-lived bindings for observations read inside a recording.
//!
//! When an unbound observation is read by another evaluation it gets a no-op
//! subscriber so that repeated reads reuse one cached evaluation. The
//! subscriptions are held here until the window armed by the first of them
//! elapses and the runtime is idle.

use std::cell::{Cell, RefCell};
use std::time::Duration;

use web_time::Instant;

use crate::observable::Subscription;

pub(crate) struct TemporaryBindings {
    window: Duration,
    held: RefCell<Vec<Subscription>>,
    deadline: Cell<Option<Instant>>,
}

impl TemporaryBindings {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            held: RefCell::new(Vec::new()),
            deadline: Cell::new(None),
        }
    }

    /// Keep `subscription` alive until the current window closes.
    pub(crate) fn hold(&self, subscription: Subscription) {
        self.held.borrow_mut().push(subscription);
        if self.deadline.get().is_none() {
            self.deadline.set(Some(Instant::now() + self.window));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.held.borrow().len()
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.get().is_some_and(|deadline| now >= deadline)
    }

    /// Release everything if the window has elapsed.
    pub(crate) fn release_expired(&self) -> usize {
        if self.is_expired(Instant::now()) {
            self.release_all()
        } else {
            0
        }
    }

    /// Release everything now. Returns how many bindings were dropped.
    pub(crate) fn release_all(&self) -> usize {
        self.deadline.set(None);
        // Unbinding can re-enter the runtime; drop outside the borrow.
        let released = std::mem::take(&mut *self.held.borrow_mut());
        let count = released.len();
        drop(released);
        if count > 0 {
            tracing::trace!(message = "reactive.temporary.release", count);
        }
        count
    }
}
