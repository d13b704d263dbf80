//! Counter-based log rate limiting.
//!
//! CMA failures can be hit in a tight loop by drivers. The first `burst`
//! events are reported, after that only every `interval`-th one, together
//! with how many were swallowed in between.

use core::sync::atomic::{AtomicU64, Ordering};

pub struct Ratelimit {
    burst: u64,
    interval: u64,
    events: AtomicU64,
}

impl Ratelimit {
    #[must_use]
    pub const fn new(burst: u64, interval: u64) -> Self {
        Self {
            burst,
            interval,
            events: AtomicU64::new(0),
        }
    }

    /// Record an event.
    ///
    /// # Returns
    ///
    /// `Some(suppressed)` if the event should be logged, `None` otherwise.
    pub fn check(&self) -> Option<u64> {
        let n = self.events.fetch_add(1, Ordering::Relaxed);
        if n < self.burst {
            return Some(0);
        }
        let over = n - self.burst + 1;
        (over % self.interval == 0).then_some(self.interval - 1)
    }
}

impl Default for Ratelimit {
    fn default() -> Self {
        Self::new(10, 100)
    }
}
