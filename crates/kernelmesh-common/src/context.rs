//! Per-call context threaded through pipeline stages and liveness checks.

use std::time::{Duration, Instant};

/// Deadline information for one Request, Close, or liveness check.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    budget: Option<Duration>,
}

impl Context {
    /// Creates a context without a deadline.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            deadline: None,
            budget: None,
        }
    }

    /// Creates a context that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            budget: Some(timeout),
        }
    }

    /// Returns the deadline, if one was set.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the time left until the deadline, or `fallback` if there is none.
    #[must_use]
    pub fn remaining_or(&self, fallback: Duration) -> Duration {
        self.deadline
            .map_or(fallback, |d| d.saturating_duration_since(Instant::now()))
    }

    /// Context for compensating work after a failed request.
    ///
    /// Carries a fresh deadline with the original budget, so rollback is not
    /// starved by a request that used up its own time.
    #[must_use]
    pub fn postpone(&self) -> Self {
        self.budget.map_or_else(Self::new, Self::with_timeout)
    }
}
