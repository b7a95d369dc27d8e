//! Injectable time source.
//!
//! Lease expirations are absolute millisecond timestamps so they survive a
//! restart. Every component reads time through [`Clock`], which lets tests
//! drive lease arithmetic with a [`ManualClock`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time.
    fn now_millis(&self) -> i64;

    /// How long a background loop should park before re-checking `deadline`.
    ///
    /// Clocks that do not follow wall time override this to poll.
    fn park_duration(&self, deadline: i64) -> Duration {
        let remaining = deadline.saturating_sub(self.now_millis()).max(0);
        Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
    }
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
    poll: Duration,
}

impl ManualClock {
    /// Poll interval used by parked loops while time is frozen.
    pub const DEFAULT_POLL: Duration = Duration::from_millis(5);

    #[must_use]
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
            poll: Self::DEFAULT_POLL,
        }
    }

    /// Moves time forward.
    pub fn advance(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jumps to an absolute time.
    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn park_duration(&self, deadline: i64) -> Duration {
        if deadline <= self.now_millis() {
            Duration::ZERO
        } else {
            self.poll
        }
    }
}
