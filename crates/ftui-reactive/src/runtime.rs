#![forbid(unsafe_code)]

//! The reactive runtime: one recorder, one scheduler and one temporary
//! binding registry, shared by every observable created against it.
//!
//! Each thread has a lazily created default runtime reachable through
//! [`Runtime::current`]. Tests and embedding hosts can build isolated
//! runtimes with [`Runtime::new`] and pass them to the `*_in` constructors.
//!
//! # Invariants
//!
//! 1. Between batches the runtime is idle: no recording frames, no open
//!    batch, no dirty nodes.
//! 2. A default runtime is installed at most once per thread.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::config::{BatchMode, RuntimeConfig};
use crate::error::{ReactiveError, Result};
use crate::observable::{BatchNum, Notification, Observable, Subscription};
use crate::recorder::{RecordingContext, Trap};
use crate::scheduler::Scheduler;
use crate::temporary::TemporaryBindings;

thread_local! {
    static DEFAULT_RUNTIME: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

struct RuntimeInner {
    config: RuntimeConfig,
    recorder: RecordingContext,
    scheduler: Scheduler,
    temporaries: TemporaryBindings,
}

/// Cheaply clonable handle to a reactive runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("label", &self.inner.config.label)
            .field("recorder", &self.inner.recorder)
            .field("scheduler", &self.inner.scheduler)
            .field("temporaries", &self.inner.temporaries.len())
            .finish()
    }
}

impl Runtime {
    /// Create an isolated runtime.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let inner = RuntimeInner {
            recorder: RecordingContext::new(),
            scheduler: Scheduler::new(config.max_drain_steps),
            temporaries: TemporaryBindings::new(config.temporary_binding_window),
            config,
        };
        Self {
            inner: Rc::new(inner),
        }
    }

    /// The default runtime of this thread, created from
    /// [`RuntimeConfig::from_env`] on first use.
    #[must_use]
    pub fn current() -> Self {
        DEFAULT_RUNTIME.with(|slot| {
            slot.borrow_mut()
                .get_or_insert_with(|| Self::new(RuntimeConfig::from_env()))
                .clone()
        })
    }

    /// Install the default runtime of this thread.
    ///
    /// Fails if a default already exists, whether installed explicitly or
    /// created by an earlier [`current`](Self::current) call.
    pub fn install(config: RuntimeConfig) -> Result<Self> {
        DEFAULT_RUNTIME.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(existing) = slot.as_ref() {
                return Err(ReactiveError::already_installed(
                    existing.config().label.clone(),
                ));
            }
            let runtime = Self::new(config);
            tracing::debug!(
                message = "reactive.runtime.install",
                label = %runtime.config().label
            );
            *slot = Some(runtime.clone());
            Ok(runtime)
        })
    }

    /// Whether this thread has a default runtime.
    #[must_use]
    pub fn is_installed() -> bool {
        DEFAULT_RUNTIME.with(|slot| slot.borrow().is_some())
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn recorder(&self) -> &RecordingContext {
        &self.inner.recorder
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Whether both handles point at the same runtime.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Run `f` inside a batch; its mutations drain when the outermost batch
    /// closes.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let result = self.inner.scheduler.batch(f);
        self.release_expired_temporaries();
        result
    }

    pub fn start_batch(&self) {
        self.inner.scheduler.start_batch();
    }

    pub fn stop_batch(&self) -> Result<()> {
        let result = self.inner.scheduler.stop_batch();
        self.release_expired_temporaries();
        result
    }

    /// Run `callback` once the current drain finishes, or now when idle.
    pub fn after_drain(&self, callback: impl FnOnce() + 'static) {
        self.inner.scheduler.after_drain(callback);
    }

    /// Close the implicit batch opened by out-of-batch mutations in
    /// [`BatchMode::Deferred`]. No-op otherwise.
    pub fn flush(&self) -> Result<()> {
        let result = self.inner.scheduler.close_implicit();
        self.release_expired_temporaries();
        result
    }

    /// Route a change notification through the batch machinery.
    ///
    /// Inside a batch the notification is queued. Outside one it either gets
    /// its own batch ([`BatchMode::Synchronous`]) or joins the implicit batch
    /// ([`BatchMode::Deferred`]).
    pub(crate) fn dispatch(&self, notify: impl FnOnce(BatchNum) + 'static) -> Result<()> {
        let scheduler = &self.inner.scheduler;
        if scheduler.is_batch_active() {
            let queued = scheduler.enqueue(notify);
            debug_assert!(queued, "active batch without a record");
            return Ok(());
        }
        match self.inner.config.batch_mode {
            BatchMode::Synchronous => {
                scheduler.start_batch();
                scheduler.enqueue(notify);
                self.stop_batch()
            }
            BatchMode::Deferred => {
                scheduler.open_implicit();
                scheduler.enqueue(notify);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Run `f` without recording its reads.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.recorder.untracked(f)
    }

    /// Wrap `f` so that every call runs untracked.
    pub fn ignore<R: 'static>(&self, f: impl Fn() -> R + 'static) -> impl Fn() -> R + 'static {
        let runtime = self.clone();
        move || runtime.untracked(&f)
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.inner.recorder.is_recording()
    }

    /// Redirect the current frame's reads; see [`Trap`].
    pub fn trap(&self) -> Trap<'_> {
        self.inner.recorder.trap()
    }

    // ------------------------------------------------------------------
    // Temporary bindings
    // ------------------------------------------------------------------

    /// Bind `source` with a no-op handler until the binding window closes.
    ///
    /// No timer runs. An expired binding is released only by the next idle
    /// un-recorded read, batch close or [`flush`](Self::flush), so in a quiet
    /// program it stays bound past its window. Call
    /// [`release_temporary_bindings`](Self::release_temporary_bindings) to drop
    /// them eagerly.
    pub fn temporarily_bind(&self, source: Rc<dyn Observable>) {
        let id = source.observable_id();
        let subscription = Subscription::attach(source, None, Rc::new(|_: &Notification| {}));
        tracing::trace!(message = "reactive.temporary.bind", source = id.get());
        self.inner.temporaries.hold(subscription);
    }

    /// Number of bindings currently held.
    #[must_use]
    pub fn temporary_binding_count(&self) -> usize {
        self.inner.temporaries.len()
    }

    /// Release every temporary binding now.
    pub fn release_temporary_bindings(&self) -> usize {
        self.inner.temporaries.release_all()
    }

    /// Release temporary bindings whose window elapsed, if the runtime is
    /// idle.
    pub fn release_expired_temporaries(&self) -> usize {
        if self.is_idle() {
            self.inner.temporaries.release_expired()
        } else {
            0
        }
    }

    /// No recording frame and no open batch.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.recorder.frames() == 0 && !self.inner.scheduler.is_batch_active()
    }
}
