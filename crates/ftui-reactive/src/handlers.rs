#![forbid(unsafe_code)]

//! Ordered handler registry shared by every observable type.
//!
//! Handlers are called in registration order. Dispatch works on a snapshot,
//! so a handler may subscribe or unsubscribe (itself included) while a
//! notification is in flight without invalidating the iteration.

use std::rc::Rc;

use crate::observable::{Change, Handler, HandlerId, Notification};

/// Typed change callback.
pub(crate) type ChangeHandler<T> = Rc<dyn Fn(&Change<'_, T>)>;

pub(crate) enum HandlerKind<T> {
    Notify(Handler),
    Change(ChangeHandler<T>),
}

impl<T> HandlerKind<T> {
    pub(crate) fn notify(f: impl Fn(&Notification) + 'static) -> Self {
        Self::Notify(Rc::new(f))
    }

    pub(crate) fn change(f: impl Fn(&Change<'_, T>) + 'static) -> Self {
        Self::Change(Rc::new(f))
    }
}

impl<T> Clone for HandlerKind<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Notify(h) => Self::Notify(Rc::clone(h)),
            Self::Change(h) => Self::Change(Rc::clone(h)),
        }
    }
}

pub(crate) struct Handlers<T> {
    entries: Vec<(HandlerId, HandlerKind<T>)>,
}

impl<T> Default for Handlers<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> Handlers<T> {
    pub(crate) fn push(&mut self, kind: HandlerKind<T>) -> HandlerId {
        let id = HandlerId::next();
        self.entries.push((id, kind));
        id
    }

    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        match self.entries.iter().position(|(h, _)| *h == id) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<HandlerKind<T>> {
        self.entries.iter().map(|(_, k)| k.clone()).collect()
    }
}

/// Deliver one change to a handler snapshot.
pub(crate) fn dispatch<T>(
    handlers: &[HandlerKind<T>],
    notification: &Notification,
    new_value: &T,
    old_value: &T,
) {
    for handler in handlers {
        match handler {
            HandlerKind::Notify(h) => h(notification),
            HandlerKind::Change(h) => h(&Change {
                new_value,
                old_value,
                batch: notification.batch,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::{BatchNum, ObservableId};
    use std::cell::RefCell;

    #[test]
    fn dispatch_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut handlers: Handlers<i32> = Handlers::default();

        let l1 = Rc::clone(&log);
        handlers.push(HandlerKind::notify(move |n| {
            l1.borrow_mut().push(format!("notify {}", n.batch));
        }));
        let l2 = Rc::clone(&log);
        handlers.push(HandlerKind::change(move |c| {
            l2.borrow_mut()
                .push(format!("change {} -> {}", c.old_value, c.new_value));
        }));

        let n = Notification {
            source: ObservableId::next(),
            key: None,
            batch: BatchNum::new(4),
        };
        dispatch(&handlers.snapshot(), &n, &2, &1);
        assert_eq!(
            *log.borrow(),
            vec!["notify 4".to_string(), "change 1 -> 2".to_string()]
        );
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut handlers: Handlers<()> = Handlers::default();
        let id = handlers.push(HandlerKind::notify(|_| {}));
        assert!(handlers.remove(id));
        assert!(!handlers.remove(id));
        assert!(handlers.is_empty());
        assert_eq!(handlers.len(), 0);
    }
}
