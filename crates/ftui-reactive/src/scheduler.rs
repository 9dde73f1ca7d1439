#![forbid(unsafe_code)]

//! Batching and update ordering.
//!
//! A batch groups mutations so their downstream effects are computed once,
//! in dependency order, after every mutation in the batch is known.
//!
//! # Lifecycle
//!
//! [`start_batch`](Scheduler::start_batch) increments a nesting counter and,
//! on the first start of a group, allocates a batch record with the next
//! sequence number. Only the outermost [`stop_batch`](Scheduler::stop_batch)
//! drains:
//!
//! 1. pending notifications are dispatched in the order they were queued;
//! 2. the dirty node with the least `(primary, depth)` rank is popped and
//!    recomputed, repeatedly, until none remain (new notifications queued by
//!    a recomputation are dispatched before the next pop);
//! 3. the batch record is released and completion callbacks run in
//!    registration order.
//!
//! # Invariants
//!
//! 1. A node occupies at most one cell of the update-order table.
//! 2. A node is removed from the table before its recomputation runs, so a
//!    re-dirtying during that recomputation re-inserts it.
//! 3. Within a primary band, lower depth is always recomputed first. Order
//!    among siblings in one cell is LIFO.
//! 4. Only one drain runs at a time. A batch closed while draining folds its
//!    work into the active drain.
//!
//! # Failure Modes
//!
//! - **Recomputation panics**: the panic leaves `stop_batch`. The draining
//!   flag is reset so the runtime stays usable; dirty nodes and pending
//!   notifications that were not reached stay queued for the next drain.
//! - **Batch abandoned by unwinding**: once the last nesting level is
//!   released the batch record is closed, so no sequence number outlives its
//!   batch. Undelivered notifications and completion callbacks are carried
//!   into the next batch and delivered under that batch's number.
//! - **Step limit exceeded**: the drain is aborted, remaining work and
//!   callbacks are discarded and [`ReactiveError::DrainLimitExceeded`] is
//!   returned.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;

use crate::error::{ReactiveError, Result};
use crate::observable::{BatchNum, ObservableId};

/// A node the scheduler can recompute.
pub trait Recompute {
    fn node_id(&self) -> ObservableId;

    /// Recompute and notify dependents. Returns whether the value changed.
    fn recompute(&self) -> bool;
}

/// Ordering key: `(primary depth, depth)`.
pub type Rank = (u32, u32);

type PendingNotification = Box<dyn FnOnce(BatchNum)>;
type Callback = Box<dyn FnOnce()>;

struct BatchRecord {
    seq: BatchNum,
    pending: VecDeque<PendingNotification>,
    callbacks: Vec<Callback>,
}

impl BatchRecord {
    fn new(seq: BatchNum) -> Self {
        Self {
            seq,
            pending: VecDeque::new(),
            callbacks: Vec::new(),
        }
    }
}

#[derive(Default)]
struct BatchState {
    depth: u32,
    record: Option<BatchRecord>,
    draining: bool,
    implicit: bool,
    last: BatchNum,
    /// Work left behind by an abandoned batch, adopted by the next record.
    carried: VecDeque<PendingNotification>,
    carried_callbacks: Vec<Callback>,
}

impl BatchState {
    /// Close the record of a batch nobody will stop. No-op while any level
    /// is still open or a drain is running.
    fn shelve(&mut self) {
        if self.depth > 0 || self.draining {
            return;
        }
        let Some(record) = self.record.take() else {
            return;
        };
        tracing::warn!(
            message = "reactive.batch.abandoned",
            batch = record.seq.get(),
            pending = record.pending.len(),
            callbacks = record.callbacks.len()
        );
        self.implicit = false;
        self.carried.extend(record.pending);
        self.carried_callbacks.extend(record.callbacks);
    }
}

#[derive(Default)]
struct UpdateOrder {
    cells: BTreeMap<Rank, Vec<Rc<dyn Recompute>>>,
    index: AHashMap<ObservableId, Rank>,
}

impl UpdateOrder {
    fn insert(&mut self, node: Rc<dyn Recompute>, rank: Rank) -> bool {
        let id = node.node_id();
        if self.index.contains_key(&id) {
            return false;
        }
        self.cells.entry(rank).or_default().push(node);
        self.index.insert(id, rank);
        true
    }

    fn pop_first(&mut self) -> Option<Rc<dyn Recompute>> {
        while let Some(mut entry) = self.cells.first_entry() {
            let node = entry.get_mut().pop();
            if entry.get().is_empty() {
                entry.remove();
            }
            if let Some(node) = node {
                self.index.remove(&node.node_id());
                return Some(node);
            }
        }
        None
    }

    fn take(&mut self, id: ObservableId) -> Option<Rc<dyn Recompute>> {
        let rank = self.index.remove(&id)?;
        let cell = self.cells.get_mut(&rank)?;
        let pos = cell.iter().position(|n| n.node_id() == id)?;
        let node = cell.remove(pos);
        if cell.is_empty() {
            self.cells.remove(&rank);
        }
        Some(node)
    }

    fn clear(&mut self) -> Vec<Rc<dyn Recompute>> {
        self.index.clear();
        std::mem::take(&mut self.cells)
            .into_values()
            .flatten()
            .collect()
    }
}

/// Batch nesting, pending notifications and the update-order table.
pub struct Scheduler {
    state: RefCell<BatchState>,
    order: RefCell<UpdateOrder>,
    max_drain_steps: Option<usize>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Scheduler")
            .field("depth", &state.depth)
            .field("batch", &state.record.as_ref().map(|r| r.seq))
            .field("draining", &state.draining)
            .field("dirty", &self.order.borrow().index.len())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Scheduler {
    #[must_use]
    pub fn new(max_drain_steps: Option<usize>) -> Self {
        Self {
            state: RefCell::new(BatchState::default()),
            order: RefCell::new(UpdateOrder::default()),
            max_drain_steps,
        }
    }

    /// Open (or nest into) a batch.
    pub fn start_batch(&self) {
        let mut state = self.state.borrow_mut();
        state.depth += 1;
        if state.record.is_none() {
            state.last = state.last.succ();
            let mut record = BatchRecord::new(state.last);
            record.pending = std::mem::take(&mut state.carried);
            record.callbacks = std::mem::take(&mut state.carried_callbacks);
            state.record = Some(record);
            tracing::debug!(message = "reactive.batch.start", batch = state.last.get());
        }
    }

    /// Close one nesting level. The outermost close drains.
    pub fn stop_batch(&self) -> Result<()> {
        let should_drain = {
            let mut state = self.state.borrow_mut();
            if state.depth == 0 {
                return Err(ReactiveError::UnbalancedBatch);
            }
            state.depth -= 1;
            state.depth == 0 && !state.draining
        };
        if should_drain { self.drain() } else { Ok(()) }
    }

    /// Run `f` inside a batch. If `f` unwinds, the nesting level is released
    /// without draining; when that was the outermost level the batch is
    /// closed and its queued work carried into the next batch.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        self.start_batch();
        let mut guard = AbandonGuard {
            scheduler: self,
            armed: true,
        };
        let value = f();
        guard.armed = false;
        self.stop_batch()?;
        Ok(value)
    }

    /// Queue a notification on the open batch. Returns `false` (dropping
    /// nothing, running nothing) when no batch record exists.
    pub fn enqueue(&self, notify: impl FnOnce(BatchNum) + 'static) -> bool {
        match self.state.borrow_mut().record.as_mut() {
            Some(record) => {
                record.pending.push_back(Box::new(notify));
                true
            }
            None => false,
        }
    }

    /// Whether mutations are currently collected rather than drained.
    #[must_use]
    pub fn is_batch_active(&self) -> bool {
        let state = self.state.borrow();
        state.depth > 0 || state.draining
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.state.borrow().draining
    }

    /// Sequence number of the open batch.
    #[must_use]
    pub fn current_batch(&self) -> Option<BatchNum> {
        self.state.borrow().record.as_ref().map(|r| r.seq)
    }

    /// Sequence number of the most recently opened batch.
    #[must_use]
    pub fn last_batch(&self) -> BatchNum {
        self.state.borrow().last
    }

    #[must_use]
    pub fn nesting(&self) -> u32 {
        self.state.borrow().depth
    }

    /// Open a batch that stays open until [`close_implicit`](Self::close_implicit).
    pub(crate) fn open_implicit(&self) {
        self.start_batch();
        self.state.borrow_mut().implicit = true;
    }

    /// Close the implicit batch, if one is open.
    pub(crate) fn close_implicit(&self) -> Result<()> {
        let open = std::mem::take(&mut self.state.borrow_mut().implicit);
        if open { self.stop_batch() } else { Ok(()) }
    }

    #[must_use]
    pub fn has_implicit_batch(&self) -> bool {
        self.state.borrow().implicit
    }

    /// Mark `node` dirty at `rank`. Idempotent while the node is queued.
    pub fn register_dirty(&self, node: Rc<dyn Recompute>, primary: u32, depth: u32) -> bool {
        let id = node.node_id();
        let inserted = self.order.borrow_mut().insert(node, (primary, depth));
        if inserted {
            tracing::trace!(
                message = "reactive.dirty",
                node = id.get(),
                primary,
                depth
            );
        }
        inserted
    }

    /// Remove `id` from the table, handing it back so the caller can
    /// recompute it out of band.
    pub fn take_dirty(&self, id: ObservableId) -> Option<Rc<dyn Recompute>> {
        self.order.borrow_mut().take(id)
    }

    #[must_use]
    pub fn is_dirty(&self, id: ObservableId) -> bool {
        self.order.borrow().index.contains_key(&id)
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.order.borrow().index.len()
    }

    #[must_use]
    pub fn has_dirty(&self) -> bool {
        !self.order.borrow().index.is_empty()
    }

    /// Run `callback` once the current drain completes, or now if the
    /// scheduler is idle.
    pub fn after_drain(&self, callback: impl FnOnce() + 'static) {
        {
            let mut state = self.state.borrow_mut();
            if (state.depth > 0 || state.draining)
                && let Some(record) = state.record.as_mut()
            {
                record.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    fn drain(&self) -> Result<()> {
        let seq = {
            let mut state = self.state.borrow_mut();
            state.draining = true;
            state.record.as_ref().map_or(state.last, |r| r.seq)
        };
        let _guard = DrainGuard { scheduler: self };
        let span = tracing::debug_span!(
            "reactive.drain",
            batch = seq.get(),
            steps = tracing::field::Empty
        );
        let _enter = span.enter();

        let mut steps = 0usize;
        let mut notified = 0usize;
        loop {
            let next = self
                .state
                .borrow_mut()
                .record
                .as_mut()
                .and_then(|r| r.pending.pop_front());
            if let Some(notify) = next {
                notified += 1;
                notify(seq);
                continue;
            }

            let Some(node) = self.order.borrow_mut().pop_first() else {
                break;
            };
            steps += 1;
            if let Some(limit) = self.max_drain_steps
                && steps > limit
            {
                span.record("steps", steps as u64);
                drop(node);
                return Err(self.abort(seq, limit));
            }
            let changed = node.recompute();
            tracing::trace!(
                message = "reactive.recompute",
                node = node.node_id().get(),
                changed
            );
        }
        span.record("steps", steps as u64);

        let callbacks = {
            let mut state = self.state.borrow_mut();
            state.draining = false;
            state.record.take().map(|r| r.callbacks).unwrap_or_default()
        };
        tracing::debug!(
            message = "reactive.batch.end",
            batch = seq.get(),
            steps,
            notified,
            callbacks = callbacks.len()
        );
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    fn abort(&self, seq: BatchNum, limit: usize) -> ReactiveError {
        let discarded = self.order.borrow_mut().clear();
        let record = {
            let mut state = self.state.borrow_mut();
            state.draining = false;
            state.record.take()
        };
        tracing::error!(
            message = "reactive.drain.abort",
            batch = seq.get(),
            limit,
            discarded = discarded.len(),
            pending = record.as_ref().map_or(0, |r| r.pending.len())
        );
        drop(discarded);
        drop(record);
        ReactiveError::DrainLimitExceeded { batch: seq, steps: limit }
    }
}

struct DrainGuard<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.scheduler.state.borrow_mut();
        state.draining = false;
        state.shelve();
    }
}

struct AbandonGuard<'a> {
    scheduler: &'a Scheduler,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.scheduler.state.borrow_mut();
            state.depth = state.depth.saturating_sub(1);
            state.shelve();
        }
    }
}
