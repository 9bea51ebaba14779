//! Configuration for stages and the stage manager.

use crate::queue::OverflowPolicy;
use std::time::Duration;

/// Configuration for a single stage.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// How long the run loop waits for new input before re-checking its
    /// shutdown state. An idle stage never blocks longer than this.
    pub poll_interval: Duration,
    /// Maximum number of queued elements. `None` means unbounded.
    pub capacity: Option<usize>,
    /// What to do with new input when the queue is at capacity.
    pub overflow: OverflowPolicy,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            capacity: None,
            overflow: OverflowPolicy::Block,
        }
    }
}

impl StageConfig {
    /// Creates a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Bounds the input queue to `capacity` elements.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Sets the overflow policy used when the queue is bounded.
    #[must_use]
    pub const fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }
}

/// Configuration for the stage manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How often the manager re-checks stage completion while waiting for a
    /// finish notification. Guards against missed wakeups.
    pub recheck_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            recheck_interval: Duration::from_millis(250),
        }
    }
}

impl ManagerConfig {
    /// Creates a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the completion re-check interval.
    #[must_use]
    pub const fn with_recheck_interval(mut self, recheck_interval: Duration) -> Self {
        self.recheck_interval = recheck_interval;
        self
    }
}
