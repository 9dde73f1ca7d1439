#![forbid(unsafe_code)]

//! Error types for the reactive runtime.
//!
//! Only usage errors and drain aborts are reported as values. A panic raised
//! by a user compute function is not converted: it unwinds through whichever
//! call triggered the evaluation (a subscribe, a `get()`, or the call that
//! closed the batch).

use thiserror::Error;

use crate::observable::BatchNum;

pub type Result<T> = std::result::Result<T, ReactiveError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    #[error("stop_recording called without a matching start_recording")]
    UnbalancedRecording,

    #[error("stop_batch called without a matching start_batch")]
    UnbalancedBatch,

    #[error("a reactive runtime is already installed on this thread (registered as `{label}`)")]
    RuntimeAlreadyInstalled { label: String },

    #[error("drain of batch {batch} exceeded {steps} recomputations; the dependency graph likely contains a cycle")]
    DrainLimitExceeded { batch: BatchNum, steps: usize },
}

impl ReactiveError {
    /// Whether this error reports caller misuse rather than a runtime condition.
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::UnbalancedRecording | Self::UnbalancedBatch | Self::RuntimeAlreadyInstalled { .. }
        )
    }

    #[must_use]
    pub fn already_installed(label: impl Into<String>) -> Self {
        Self::RuntimeAlreadyInstalled {
            label: label.into(),
        }
    }
}
