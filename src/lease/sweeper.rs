//! Park/reap loop shared by the service and event sweepers.
//!
//! A sweeper reaps everything due, then parks until the earliest remaining
//! expiration. Writers that lower the earliest expiration call
//! [`WakeSignal::notify`]; the pending flag survives until the sweeper
//! parks again, so a wakeup that races a reap is never lost.

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace};

use crate::clock::Clock;

/// A background loop ended because shutdown was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{loop_name} interrupted by shutdown")]
pub struct Interrupted {
    pub loop_name: &'static str,
}

#[derive(Debug, Default)]
struct WakeState {
    pending: bool,
    shutdown: bool,
}

/// Wakes a parked sweeper early.
#[derive(Debug, Default)]
pub struct WakeSignal {
    state: Mutex<WakeState>,
    cv: Condvar,
}

impl WakeSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next (or current) park return immediately.
    pub fn notify(&self) {
        self.state.lock().pending = true;
        self.cv.notify_all();
    }

    /// Ends the loop at its next check.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cv.notify_all();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Parks until `deadline` (per `clock`), a notify, or shutdown.
    fn park(&self, deadline: Option<i64>, clock: &dyn Clock) {
        let mut state = self.state.lock();
        if !state.pending && !state.shutdown {
            match deadline {
                Some(deadline) => {
                    let wait = clock.park_duration(deadline);
                    if !wait.is_zero() {
                        let _ = self.cv.wait_for(&mut state, wait);
                    }
                }
                None => self.cv.wait(&mut state),
            }
        }
        state.pending = false;
    }
}

/// Something that can drop its expired leases.
pub trait Reap: Send + Sync {
    /// Removes every lease due at the current time and returns the
    /// earliest remaining expiration.
    fn reap_expired(&self) -> Option<i64>;
}

/// Runs until shutdown. Always returns [`Interrupted`]; the caller decides
/// how to report it.
pub fn run(loop_name: &'static str, reaper: &dyn Reap, wake: &WakeSignal, clock: &dyn Clock) -> Interrupted {
    debug!(loop_name, "sweeper started");
    loop {
        if wake.is_shutdown() {
            return Interrupted { loop_name };
        }
        let next = reaper.reap_expired();
        trace!(loop_name, next_deadline = ?next, "sweep pass done");
        wake.park(next, clock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingReaper {
        passes: AtomicUsize,
    }

    impl Reap for CountingReaper {
        fn reap_expired(&self) -> Option<i64> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    #[test]
    fn test_notify_before_park_is_not_lost() {
        let wake = WakeSignal::new();
        wake.notify();
        // Would block forever without the pending flag.
        wake.park(None, &ManualClock::new(0));
    }

    #[test]
    fn test_past_deadline_does_not_block() {
        let wake = WakeSignal::new();
        wake.park(Some(5), &ManualClock::new(10));
    }

    #[test]
    fn test_loop_wakes_and_stops() {
        let reaper = Arc::new(CountingReaper::default());
        let wake = Arc::new(WakeSignal::new());
        let handle = {
            let (reaper, wake) = (Arc::clone(&reaper), Arc::clone(&wake));
            std::thread::spawn(move || run("test-sweeper", reaper.as_ref(), &wake, &ManualClock::new(0)))
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while reaper.passes.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        wake.notify();
        while reaper.passes.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(reaper.passes.load(Ordering::SeqCst) >= 2);

        wake.shutdown();
        let exit = handle.join().unwrap();
        assert_eq!(exit.loop_name, "test-sweeper");
    }
}
