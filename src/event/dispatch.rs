//! Ordered per-subscription delivery on a fixed worker pool.
//!
//! Each event registration owns a bounded mailbox. Enqueueing happens under
//! the registrar's write lock with a non-blocking `try_send`; a full mailbox
//! drops the event. A mailbox with work is put on a shared ready queue, and
//! at most one pool worker drains it at a time, a bounded batch per turn,
//! so a stalled listener holds up only its own subscription and one worker.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::ids::{EventId, LeaseId};

use super::listener::{DeliveryError, RemoteEventListener, ServiceEvent};

/// Deliveries a worker makes from one mailbox before moving on.
const BATCH: usize = 16;

/// One queued notification.
pub struct Delivery {
    pub listener: Arc<dyn RemoteEventListener>,
    /// Lease of the registration at generation time.
    pub lease_id: LeaseId,
    pub event: ServiceEvent,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("event_id", &self.event.event_id)
            .field("seq_no", &self.event.seq_no)
            .field("lease_id", &self.lease_id)
            .finish_non_exhaustive()
    }
}

/// Called from a worker when a listener fails permanently.
pub type PermanentFailureHook = Arc<dyn Fn(EventId, LeaseId) + Send + Sync>;

struct Mailbox {
    event_id: EventId,
    tx: Sender<Delivery>,
    rx: Receiver<Delivery>,
    /// Set while the mailbox sits on the ready queue or is being drained.
    scheduled: AtomicBool,
    /// The listener refused for good; anything still queued is discarded.
    failed: AtomicBool,
}

impl Mailbox {
    fn new(event_id: EventId, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            event_id,
            tx,
            rx,
            scheduled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    /// Delivers up to [`BATCH`] queued events in order. Returns how many
    /// were taken off the queue.
    fn drain(&self, on_permanent: &(dyn Fn(EventId, LeaseId) + Send + Sync)) -> usize {
        let event_id = self.event_id;
        let mut taken = 0;
        while taken < BATCH {
            let Ok(delivery) = self.rx.try_recv() else {
                break;
            };
            taken += 1;
            if self.failed.load(Ordering::SeqCst) {
                continue;
            }
            let seq_no = delivery.event.seq_no;
            match delivery.listener.notify(&delivery.event) {
                Ok(()) => {}
                Err(DeliveryError::Transient(reason)) => {
                    debug!(%event_id, seq_no, %reason, "transient delivery failure");
                }
                Err(DeliveryError::Permanent(reason)) => {
                    if !self.failed.swap(true, Ordering::SeqCst) {
                        warn!(%event_id, seq_no, %reason, "permanent delivery failure; cancelling event lease");
                        on_permanent(event_id, delivery.lease_id);
                    }
                }
            }
        }
        taken
    }
}

struct Shared {
    /// Dropped at close so idle workers see a disconnected queue.
    ready: Mutex<Option<Sender<Arc<Mailbox>>>>,
    on_permanent: PermanentFailureHook,
}

/// Routes deliveries to per-subscription mailboxes served by a worker pool.
pub struct Dispatcher {
    capacity: usize,
    shared: Arc<Shared>,
    ready_rx: Receiver<Arc<Mailbox>>,
    mailboxes: Mutex<HashMap<EventId, Arc<Mailbox>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("capacity", &self.capacity)
            .field("mailboxes", &self.mailboxes.lock().len())
            .field("workers", &self.worker_count())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Deliveries queue up until [`Dispatcher::start`] brings up the pool.
    #[must_use]
    pub fn new(capacity: usize, on_permanent: PermanentFailureHook) -> Self {
        let (ready_tx, ready_rx) = unbounded();
        Self {
            capacity: capacity.max(1),
            shared: Arc::new(Shared {
                ready: Mutex::new(Some(ready_tx)),
                on_permanent,
            }),
            ready_rx,
            mailboxes: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Spawns `workers` delivery threads.
    pub fn start(&self, workers: usize) -> std::io::Result<()> {
        let mut handles = self.workers.lock();
        for idx in 0..workers.max(1) {
            let rx = self.ready_rx.clone();
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("svcreg-deliver-{idx}"))
                .spawn(move || delivery_loop(&rx, &shared))?;
            handles.push(handle);
        }
        Ok(())
    }

    /// Queues deliveries in order. Never blocks on a listener.
    pub fn dispatch(&self, deliveries: Vec<Delivery>) {
        if deliveries.is_empty() {
            return;
        }
        let guard = self.shared.ready.lock();
        let Some(ready) = guard.as_ref() else {
            self.dropped.fetch_add(deliveries.len() as u64, Ordering::Relaxed);
            return;
        };
        let mut mailboxes = self.mailboxes.lock();
        for delivery in deliveries {
            let event_id = delivery.event.event_id;
            let mailbox = Arc::clone(
                mailboxes
                    .entry(event_id)
                    .or_insert_with(|| Arc::new(Mailbox::new(event_id, self.capacity))),
            );
            if mailbox.failed.load(Ordering::SeqCst) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match mailbox.tx.try_send(delivery) {
                Ok(()) => {
                    if !mailbox.scheduled.swap(true, Ordering::SeqCst) && ready.send(mailbox).is_err() {
                        warn!(%event_id, "delivery pool gone; event stays queued");
                    }
                }
                Err(TrySendError::Full(d)) => {
                    warn!(%event_id, seq_no = d.event.seq_no, capacity = self.capacity, "delivery queue full; dropping event");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(d)) => {
                    debug!(%event_id, seq_no = d.event.seq_no, "delivery queue closed; dropping event");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// The subscription ended. Whatever is already queued is still
    /// delivered; nothing new is accepted for it.
    pub fn retire(&self, event_id: &EventId) {
        self.mailboxes.lock().remove(event_id);
    }

    /// Stops accepting deliveries and hands back the worker handles.
    /// Workers finish every mailbox already scheduled before exiting.
    pub fn close(&self) -> Vec<JoinHandle<()>> {
        self.shared.ready.lock().take();
        self.mailboxes.lock().clear();
        std::mem::take(&mut *self.workers.lock())
    }

    /// Deliveries discarded because a queue was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Size of the delivery pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Subscriptions that currently own a mailbox.
    #[must_use]
    pub fn mailbox_count(&self) -> usize {
        self.mailboxes.lock().len()
    }
}

fn delivery_loop(ready: &Receiver<Arc<Mailbox>>, shared: &Shared) {
    let on_permanent = shared.on_permanent.as_ref();
    while let Ok(mailbox) = ready.recv() {
        mailbox.drain(on_permanent);
        mailbox.scheduled.store(false, Ordering::SeqCst);
        if mailbox.rx.is_empty() || mailbox.scheduled.swap(true, Ordering::SeqCst) {
            continue;
        }
        // Batch limit hit, or a producer raced the flag: back of the line.
        let requeue = shared.ready.lock().as_ref().map(|tx| tx.send(Arc::clone(&mailbox)));
        if !matches!(requeue, Some(Ok(()))) {
            // Closing: nobody will pick it up again, so finish it here.
            while mailbox.drain(on_permanent) > 0 {}
        }
    }
    debug!("delivery worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::listener::{ChannelListener, ListenerRef};
    use crate::ids::ServiceId;
    use crate::model::Transitions;
    use chrono::Utc;
    use std::time::Duration;

    fn delivery(listener: Arc<dyn RemoteEventListener>, event_id: u64, seq_no: u64) -> Delivery {
        Delivery {
            listener,
            lease_id: LeaseId::new(),
            event: ServiceEvent {
                source: ServiceId::new(),
                event_id: EventId::new(event_id),
                seq_no,
                service_id: ServiceId::new(),
                transition: Transitions::NOMATCH_MATCH,
                item: None,
                handback: None,
                generated_at: Utc::now(),
            },
        }
    }

    fn noop_hook() -> PermanentFailureHook {
        Arc::new(|_, _| {})
    }

    struct Repudiating;

    impl RemoteEventListener for Repudiating {
        fn notify(&self, _event: &ServiceEvent) -> Result<(), DeliveryError> {
            Err(DeliveryError::Permanent("unknown event".to_string()))
        }

        fn listener_ref(&self) -> ListenerRef {
            ListenerRef::new("repudiating")
        }
    }

    /// Blocks every delivery until the gate opens.
    struct Gated {
        gate: Receiver<()>,
    }

    impl RemoteEventListener for Gated {
        fn notify(&self, _event: &ServiceEvent) -> Result<(), DeliveryError> {
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
            Ok(())
        }

        fn listener_ref(&self) -> ListenerRef {
            ListenerRef::new("gated")
        }
    }

    #[test]
    fn test_in_order_per_subscription() {
        let dispatcher = Dispatcher::new(64, noop_hook());
        dispatcher.start(3).unwrap();
        let (listener, rx) = ChannelListener::new("a");
        let listener: Arc<dyn RemoteEventListener> = listener;
        // Crosses several batch boundaries.
        dispatcher.dispatch((1..=50).map(|seq| delivery(Arc::clone(&listener), 1, seq)).collect());

        let got: Vec<u64> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().seq_no)
            .collect();
        assert_eq!(got, (1..=50).collect::<Vec<_>>());
        assert_eq!(dispatcher.mailbox_count(), 1);

        for handle in dispatcher.close() {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_pool_size_is_fixed() {
        let dispatcher = Dispatcher::new(8, noop_hook());
        dispatcher.start(2).unwrap();
        let mut receivers = Vec::new();
        for id in 1..=40 {
            let (listener, rx) = ChannelListener::new("many");
            dispatcher.dispatch(vec![delivery(Arc::clone(&listener) as Arc<dyn RemoteEventListener>, id, 1)]);
            dispatcher.dispatch(vec![delivery(listener, id, 2)]);
            receivers.push(rx);
        }
        assert_eq!(dispatcher.worker_count(), 2);
        assert_eq!(dispatcher.mailbox_count(), 40);
        for rx in &receivers {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().seq_no, 1);
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().seq_no, 2);
        }

        for handle in dispatcher.close() {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_stalled_listener_holds_one_worker() {
        let dispatcher = Dispatcher::new(8, noop_hook());
        dispatcher.start(2).unwrap();
        let (open_gate, gate) = crossbeam_channel::unbounded();
        dispatcher.dispatch(vec![delivery(Arc::new(Gated { gate }), 1, 1)]);

        let (listener, rx) = ChannelListener::new("free");
        dispatcher.dispatch(vec![delivery(listener, 2, 1)]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().seq_no, 1);

        open_gate.send(()).unwrap();
        for handle in dispatcher.close() {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_full_mailbox_drops() {
        // No workers yet, so nothing drains.
        let dispatcher = Dispatcher::new(2, noop_hook());
        let (listener, rx) = ChannelListener::new("a");
        let listener: Arc<dyn RemoteEventListener> = listener;
        dispatcher.dispatch((1..=5).map(|seq| delivery(Arc::clone(&listener), 1, seq)).collect());
        assert_eq!(dispatcher.dropped(), 3);

        dispatcher.start(1).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().seq_no, 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().seq_no, 2);
        for handle in dispatcher.close() {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_permanent_failure_calls_hook_once() {
        let (hook_tx, hook_rx) = crossbeam_channel::unbounded();
        let dispatcher = Dispatcher::new(
            8,
            Arc::new(move |event_id, _lease| {
                let _ = hook_tx.send(event_id);
            }),
        );
        dispatcher.start(1).unwrap();
        let listener: Arc<dyn RemoteEventListener> = Arc::new(Repudiating);
        dispatcher.dispatch(vec![delivery(Arc::clone(&listener), 9, 1), delivery(listener, 9, 2)]);

        assert_eq!(hook_rx.recv_timeout(Duration::from_secs(5)).unwrap(), EventId::new(9));
        for handle in dispatcher.close() {
            handle.join().unwrap();
        }
        assert!(hook_rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_dispatcher_drops() {
        let dispatcher = Dispatcher::new(8, noop_hook());
        assert!(dispatcher.close().is_empty());
        let (listener, rx) = ChannelListener::new("a");
        dispatcher.dispatch(vec![delivery(listener, 1, 1)]);
        assert_eq!(dispatcher.dropped(), 1);
        assert!(rx.try_recv().is_err());
    }
}
