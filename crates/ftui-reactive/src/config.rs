#![forbid(unsafe_code)]

//! Runtime configuration.
//!
//! [`RuntimeConfig::default()`] matches the behavior hosts expect without any
//! setup: synchronous batch close, a 10 ms temporary-binding window, and a
//! drain guard generous enough that only a true dependency cycle trips it.
//! [`RuntimeConfig::from_env()`] layers environment overrides on top.

use std::env;
use std::time::Duration;

/// Env var overriding [`RuntimeConfig::temporary_binding_window`], in milliseconds.
pub const ENV_TEMP_BIND_MS: &str = "FTUI_REACTIVE_TEMP_BIND_MS";
/// Env var overriding [`RuntimeConfig::max_drain_steps`]; `0` disables the guard.
pub const ENV_MAX_DRAIN_STEPS: &str = "FTUI_REACTIVE_MAX_DRAIN_STEPS";
/// Env var selecting [`BatchMode`] (`sync` or `deferred`).
pub const ENV_BATCH_MODE: &str = "FTUI_REACTIVE_BATCH_MODE";

/// When a mutation made outside any explicit batch gets drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchMode {
    /// Every out-of-batch mutation opens and closes its own batch.
    #[default]
    Synchronous,
    /// Out-of-batch mutations accumulate in an implicit batch that stays open
    /// until the host calls [`Runtime::flush`](crate::Runtime::flush).
    Deferred,
}

impl BatchMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sync" | "synchronous" => Some(Self::Synchronous),
            "deferred" | "defer" | "async" => Some(Self::Deferred),
            _ => None,
        }
    }
}

/// Configuration for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name reported when a second default runtime is installed.
    /// Default: `"ftui-reactive"`.
    pub label: String,

    /// How long a temporarily bound observation stays bound after it was
    /// read inside a recording. A coalescing heuristic, not a contract.
    /// Default: 10ms.
    pub temporary_binding_window: Duration,

    /// Upper bound on recomputations performed by one drain. `None` disables
    /// the guard, in which case a dependency cycle drains forever.
    /// Default: `Some(100_000)`.
    pub max_drain_steps: Option<usize>,

    /// Default: [`BatchMode::Synchronous`].
    pub batch_mode: BatchMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            label: "ftui-reactive".to_string(),
            temporary_binding_window: Duration::from_millis(10),
            max_drain_steps: Some(100_000),
            batch_mode: BatchMode::Synchronous,
        }
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied. Unparsable values are
    /// ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = env::var(ENV_TEMP_BIND_MS)
            && let Ok(ms) = val.trim().parse::<u64>()
        {
            config.temporary_binding_window = Duration::from_millis(ms);
        }
        if let Ok(val) = env::var(ENV_MAX_DRAIN_STEPS)
            && let Ok(steps) = val.trim().parse::<usize>()
        {
            config.max_drain_steps = (steps > 0).then_some(steps);
        }
        if let Ok(val) = env::var(ENV_BATCH_MODE)
            && let Some(mode) = BatchMode::parse(&val)
        {
            config.batch_mode = mode;
        }
        config
    }

    /// Set the registration label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the temporary-binding window.
    #[must_use]
    pub fn with_temporary_binding_window(mut self, window: Duration) -> Self {
        self.temporary_binding_window = window;
        self
    }

    /// Set (or disable with `None`) the drain step guard.
    #[must_use]
    pub fn with_max_drain_steps(mut self, steps: Option<usize>) -> Self {
        self.max_drain_steps = steps;
        self
    }

    /// Set the batch mode.
    #[must_use]
    pub fn with_batch_mode(mut self, mode: BatchMode) -> Self {
        self.batch_mode = mode;
        self
    }
}
