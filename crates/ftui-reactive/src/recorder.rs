#![forbid(unsafe_code)]

//! Dependency recording.
//!
//! [`RecordingContext`] keeps a stack of capture frames. Each in-flight
//! evaluation owns the top frame; every observable read performed while that
//! frame is on top is reported through [`RecordingContext::record_read`] and
//! lands in the frame's [`Dependencies`].
//!
//! # Frames
//!
//! A frame holds the deduplicated set of reads, an ignore counter raised by
//! [`untracked`](RecordingContext::untracked) scopes, and an optional trap
//! list that temporarily redirects reads (see [`Trap`]).
//!
//! # Invariants
//!
//! 1. Exactly one frame is current at any synchronous point: the top of the
//!    stack.
//! 2. A frame is popped exactly once, by the push that created it.
//!    [`record`](RecordingContext::record) pops on every exit path,
//!    including unwinding.
//! 3. Reads are deduplicated by `(ObservableId, key)`. Trap lists keep read
//!    order and duplicates; deduplication happens when they are replayed.
//! 4. Reads with no frame on the stack are silently dropped.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use crate::error::{ReactiveError, Result};
use crate::observable::{Observable, ObservableId};

/// One observed read: a source and, for keyed sources, the key.
#[derive(Clone)]
pub struct Read {
    pub source: Rc<dyn Observable>,
    pub key: Option<Rc<str>>,
}

impl Read {
    #[must_use]
    pub fn new(source: Rc<dyn Observable>, key: Option<&str>) -> Self {
        Self {
            source,
            key: key.map(Rc::from),
        }
    }

    #[must_use]
    pub fn id(&self) -> ObservableId {
        self.source.observable_id()
    }
}

impl fmt::Debug for Read {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Read")
            .field("source", &self.id())
            .field("key", &self.key)
            .finish()
    }
}

/// Keys read from one keyed source.
#[derive(Clone)]
pub struct KeyedDependency {
    pub source: Rc<dyn Observable>,
    pub keys: BTreeSet<Rc<str>>,
}

/// The set of reads captured by one evaluation, split into keyed reads and
/// whole-value reads.
#[derive(Clone, Default)]
pub struct Dependencies {
    keyed: BTreeMap<ObservableId, KeyedDependency>,
    values: BTreeMap<ObservableId, Rc<dyn Observable>>,
}

impl Dependencies {
    /// Add a read. Returns `false` when it was already present.
    pub fn insert(&mut self, source: &Rc<dyn Observable>, key: Option<&str>) -> bool {
        let id = source.observable_id();
        match key {
            None => {
                if self.values.contains_key(&id) {
                    return false;
                }
                self.values.insert(id, Rc::clone(source));
                true
            }
            Some(key) => {
                let entry = self.keyed.entry(id).or_insert_with(|| KeyedDependency {
                    source: Rc::clone(source),
                    keys: BTreeSet::new(),
                });
                if entry.keys.contains(key) {
                    return false;
                }
                entry.keys.insert(Rc::from(key));
                true
            }
        }
    }

    fn insert_read(&mut self, read: &Read) -> bool {
        self.insert(&read.source, read.key.as_deref())
    }

    #[must_use]
    pub fn contains(&self, id: ObservableId, key: Option<&str>) -> bool {
        match key {
            None => self.values.contains_key(&id),
            Some(key) => self.keyed.get(&id).is_some_and(|k| k.keys.contains(key)),
        }
    }

    /// Whether any read, keyed or not, targets `id`.
    #[must_use]
    pub fn contains_source(&self, id: ObservableId) -> bool {
        self.values.contains_key(&id) || self.keyed.contains_key(&id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.keyed.is_empty()
    }

    /// Number of distinct `(source, key)` edges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len() + self.keyed.values().map(|k| k.keys.len()).sum::<usize>()
    }

    /// Keyed dependencies: source to the set of keys read from it.
    pub fn keyed(&self) -> impl Iterator<Item = &KeyedDependency> {
        self.keyed.values()
    }

    /// Keys read from `id`, if any.
    #[must_use]
    pub fn keys_of(&self, id: ObservableId) -> Option<&BTreeSet<Rc<str>>> {
        self.keyed.get(&id).map(|k| &k.keys)
    }

    /// Whole-value dependencies.
    pub fn values(&self) -> impl Iterator<Item = &Rc<dyn Observable>> {
        self.values.values()
    }

    /// Every edge as a [`Read`], whole-value reads first.
    #[must_use]
    pub fn reads(&self) -> Vec<Read> {
        let mut out = Vec::with_capacity(self.len());
        for source in self.values.values() {
            out.push(Read {
                source: Rc::clone(source),
                key: None,
            });
        }
        for dep in self.keyed.values() {
            for key in &dep.keys {
                out.push(Read {
                    source: Rc::clone(&dep.source),
                    key: Some(Rc::clone(key)),
                });
            }
        }
        out
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyed: BTreeMap<_, _> = self
            .keyed
            .iter()
            .map(|(id, k)| (*id, k.keys.iter().map(|s| s.as_ref()).collect::<Vec<_>>()))
            .collect();
        f.debug_struct("Dependencies")
            .field("keyed", &keyed)
            .field("values", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Default)]
struct Frame {
    deps: Dependencies,
    ignore: u32,
    trap: Option<Vec<Read>>,
}

/// Stack of in-flight dependency captures.
#[derive(Default)]
pub struct RecordingContext {
    stack: RefCell<Vec<Frame>>,
}

impl fmt::Debug for RecordingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingContext")
            .field("frames", &self.stack.borrow().len())
            .finish()
    }
}

impl RecordingContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a capture frame. Pair with [`stop_recording`](Self::stop_recording).
    pub fn start_recording(&self) {
        self.stack.borrow_mut().push(Frame::default());
    }

    /// Pop the top frame and return what it captured.
    pub fn stop_recording(&self) -> Result<Dependencies> {
        self.stack
            .borrow_mut()
            .pop()
            .map(|frame| frame.deps)
            .ok_or(ReactiveError::UnbalancedRecording)
    }

    /// Run `f` inside a fresh frame and return its result together with the
    /// reads it performed. The frame is popped even if `f` unwinds.
    pub fn record<R>(&self, f: impl FnOnce() -> R) -> (R, Dependencies) {
        self.start_recording();
        let mut guard = FrameGuard {
            ctx: self,
            depth: self.frames(),
            armed: true,
        };
        let value = f();
        guard.armed = false;
        let deps = {
            let mut stack = self.stack.borrow_mut();
            stack.truncate(guard.depth);
            stack.pop().map(|frame| frame.deps).unwrap_or_default()
        };
        (value, deps)
    }

    /// Report a read to the current frame. No-op without a frame or while
    /// ignoring.
    pub fn record_read(&self, source: &Rc<dyn Observable>, key: Option<&str>) {
        let mut stack = self.stack.borrow_mut();
        let Some(top) = stack.last_mut() else {
            return;
        };
        if top.ignore > 0 {
            return;
        }
        match top.trap.as_mut() {
            Some(trap) => trap.push(Read::new(Rc::clone(source), key)),
            None => {
                top.deps.insert(source, key);
            }
        }
    }

    /// Replay a list of reads, typically one returned by [`Trap::restore`].
    pub fn record_reads(&self, reads: Vec<Read>) {
        let mut stack = self.stack.borrow_mut();
        let Some(top) = stack.last_mut() else {
            return;
        };
        match top.trap.as_mut() {
            Some(trap) => trap.extend(reads),
            None => {
                if top.ignore == 0 {
                    for read in &reads {
                        top.deps.insert_read(read);
                    }
                }
            }
        }
    }

    /// True iff a frame is active and not ignoring reads.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.stack.borrow().last().is_some_and(|top| top.ignore == 0)
    }

    /// Number of frames on the stack.
    #[must_use]
    pub fn frames(&self) -> usize {
        self.stack.borrow().len()
    }

    /// Run `f` with reads suppressed in the current frame.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let frame = {
            let mut stack = self.stack.borrow_mut();
            let idx = stack.len().checked_sub(1);
            if let Some(top) = stack.last_mut() {
                top.ignore += 1;
            }
            idx
        };
        let _guard = IgnoreGuard { ctx: self, frame };
        f()
    }

    /// Redirect the current frame's reads into a fresh list until the
    /// returned [`Trap`] is restored.
    pub fn trap(&self) -> Trap<'_> {
        let mut stack = self.stack.borrow_mut();
        let frame = stack.len().checked_sub(1);
        let previous = stack.last_mut().and_then(|top| top.trap.replace(Vec::new()));
        Trap {
            ctx: self,
            frame,
            previous,
        }
    }

    /// Reads captured by the current frame's active trap (0 if none).
    #[must_use]
    pub fn trap_count(&self) -> usize {
        self.stack
            .borrow()
            .last()
            .and_then(|top| top.trap.as_ref())
            .map_or(0, Vec::len)
    }
}

struct FrameGuard<'a> {
    ctx: &'a RecordingContext,
    depth: usize,
    armed: bool,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            // Unwinding: drop our frame and anything pushed above it.
            self.ctx
                .stack
                .borrow_mut()
                .truncate(self.depth.saturating_sub(1));
        }
    }
}

struct IgnoreGuard<'a> {
    ctx: &'a RecordingContext,
    frame: Option<usize>,
}

impl Drop for IgnoreGuard<'_> {
    fn drop(&mut self) {
        if let Some(idx) = self.frame
            && let Some(frame) = self.ctx.stack.borrow_mut().get_mut(idx)
        {
            frame.ignore = frame.ignore.saturating_sub(1);
        }
    }
}

/// A redirection of the current frame's reads. Restoring it reinstates the
/// previous capture target and hands back the reads made in between.
///
/// Dropping an unrestored trap also reinstates the previous target; the
/// trapped reads are discarded.
#[must_use = "restore the trap to collect its reads"]
pub struct Trap<'a> {
    ctx: &'a RecordingContext,
    frame: Option<usize>,
    previous: Option<Vec<Read>>,
}

impl Trap<'_> {
    /// Reinstate the previous capture target and return the trapped reads in
    /// read order. Empty when the trap was taken outside any recording.
    pub fn restore(mut self) -> Vec<Read> {
        self.release()
    }

    fn release(&mut self) -> Vec<Read> {
        let Some(idx) = self.frame.take() else {
            return Vec::new();
        };
        let previous = self.previous.take();
        let mut stack = self.ctx.stack.borrow_mut();
        match stack.get_mut(idx) {
            Some(frame) => std::mem::replace(&mut frame.trap, previous).unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

impl Drop for Trap<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Trap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trap").field("frame", &self.frame).finish()
    }
}
