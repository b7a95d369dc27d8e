//! Background work: the two lease sweepers, the snapshot writer and the
//! bounded join used at shutdown.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};

use crate::error::RegistrarError;
use crate::lease::sweeper::{Interrupted, Reap};

use super::engine::Core;
use super::lifecycle::Lifecycle;

const JOIN_POLL: Duration = Duration::from_millis(5);

pub(super) struct ServiceReaper<'a>(pub &'a Core);

pub(super) struct EventReaper<'a>(pub &'a Core);

impl Reap for ServiceReaper<'_> {
    fn reap_expired(&self) -> Option<i64> {
        let core = self.0;
        let mut state = core.state.write();
        if core.lifecycle.get() != Lifecycle::Running {
            return None;
        }
        let now = core.clock.now_millis();
        let mut reaped = 0usize;
        while let Some((expiration, id)) = state.index.earliest_service() {
            if expiration > now {
                break;
            }
            let Some(reg) = state.apply_service_expired(&id) else {
                break;
            };
            let deliveries = state.transitions(id, Some(&reg.item), None, now);
            core.dispatcher.dispatch(deliveries);
            reaped += 1;
        }
        if reaped > 0 {
            info!(reaped, "reaped expired service leases");
        }
        state.index.earliest_service().map(|(e, _)| e)
    }
}

impl Reap for EventReaper<'_> {
    fn reap_expired(&self) -> Option<i64> {
        let core = self.0;
        let mut state = core.state.write();
        if core.lifecycle.get() != Lifecycle::Running {
            return None;
        }
        let now = core.clock.now_millis();
        let mut reaped = 0usize;
        while let Some((expiration, id)) = state.index.earliest_event() {
            if expiration > now {
                break;
            }
            if state.apply_event_expired(&id).is_none() {
                break;
            }
            core.dispatcher.retire(&id);
            reaped += 1;
        }
        if reaped > 0 {
            info!(reaped, "reaped expired event leases");
        }
        state.index.earliest_event().map(|(e, _)| e)
    }
}

/// Writes a snapshot per request until the sender is dropped.
pub(super) fn snapshot_loop(core: &Core, requests: &Receiver<()>) -> Interrupted {
    let interrupted = Interrupted {
        loop_name: "snapshot writer",
    };
    while requests.recv().is_ok() {
        match core.snapshot() {
            Ok(_) => {}
            Err(RegistrarError::Unavailable { .. }) => return interrupted,
            Err(e) => error!(error = %e, "snapshot failed; log keeps growing"),
        }
    }
    interrupted
}

/// Joins each handle until a shared deadline, then detaches the rest.
pub(super) fn join_with_timeout(handles: Vec<JoinHandle<()>>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    for handle in handles {
        let name = handle.thread().name().unwrap_or("unnamed").to_string();
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }
        if !handle.is_finished() {
            warn!(thread = %name, timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "thread did not stop in time; detaching");
            continue;
        }
        if handle.join().is_err() {
            error!(thread = %name, "background thread panicked");
        } else {
            debug!(thread = %name, "joined");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_join_detaches_stuck_threads() {
        let release = Arc::new(AtomicBool::new(false));
        let stuck = {
            let release = Arc::clone(&release);
            thread::spawn(move || {
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };
        let quick = thread::spawn(|| {});

        let started = Instant::now();
        join_with_timeout(vec![quick, stuck], Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(5));
        release.store(true, Ordering::SeqCst);
    }
}
