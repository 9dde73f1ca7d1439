#![forbid(unsafe_code)]

//! Fine-grained reactive dependency tracking for FrankenTUI.
//!
//! This crate records which observable values a computation reads,
//! recomputes the computation when any of them change, and propagates
//! changes through the resulting graph in dependency order, once per batch
//! of mutations.
//!
//! - [`Observation`]: a computed value whose dependencies are discovered by
//!   running it.
//! - [`ObservableValue`] and [`ObservableMap`]: leaf cells (whole-value and
//!   keyed).
//! - [`EventTargetObservable`]: adapter for add/remove-listener style
//!   sources.
//! - [`Runtime`]: the recorder, scheduler and temporary-binding registry
//!   shared by everything created against it. Each thread has a default.
//!
//! # Example
//!
//! ```
//! use ftui_reactive::{Observation, ObservableValue};
//!
//! let width = ObservableValue::new(80u16);
//! let w = width.clone();
//! let half = Observation::new(move || w.get() / 2);
//!
//! let _sub = half.on_change(|c| println!("{} -> {}", c.old_value, c.new_value));
//! ftui_reactive::batch(|| {
//!     width.set(100);
//!     width.set(120);
//! })
//! .unwrap();
//! assert_eq!(half.get(), 60);
//! ```
//!
//! # Invariants
//!
//! 1. Within one drain every dependency is recomputed before its dependents
//!    (glitch freedom).
//! 2. An observation is recomputed at most once per change it has pending,
//!    and notifies only when its value actually changed.
//! 3. A bound observation is subscribed to exactly the sources its last
//!    evaluation read.

pub mod config;
pub mod error;
mod handlers;
pub mod legacy;
pub mod map;
pub mod observable;
pub mod observation;
pub mod recorder;
pub mod runtime;
pub mod scheduler;
mod temporary;
pub mod value;

pub use config::{BatchMode, RuntimeConfig};
pub use error::{ReactiveError, Result};
pub use legacy::{EventTarget, EventTargetObservable, Listener};
pub use map::ObservableMap;
pub use observable::{
    BatchNum, Change, Handler, HandlerId, Notification, Observable, ObservableId, Subscription,
};
pub use observation::{Observation, ObservationOptions};
pub use recorder::{Dependencies, KeyedDependency, Read, RecordingContext, Trap};
pub use runtime::Runtime;
pub use scheduler::{Recompute, Scheduler};
pub use value::ObservableValue;

/// Run `f` inside a batch on the thread's default runtime.
pub fn batch<R>(f: impl FnOnce() -> R) -> Result<R> {
    Runtime::current().batch(f)
}

/// Run `callback` after the default runtime's current drain, or now if idle.
pub fn after_drain(callback: impl FnOnce() + 'static) {
    Runtime::current().after_drain(callback);
}

/// Run `f` without recording its reads.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    Runtime::current().untracked(f)
}

/// Whether a recording is active on the default runtime.
#[must_use]
pub fn is_recording() -> bool {
    Runtime::current().is_recording()
}
