//! Event delivery ordering and failure handling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use svcreg::{
    ChannelListener, Clock, DeliveryError, Item, LeaseDuration, ListenerRef, ManualClock, Registrar, RegistrarConfig,
    RegistrarError, RemoteEventListener, ServiceEvent, ServiceHandle, Template, Transitions, TypeDesc,
};

const WAIT: Duration = Duration::from_secs(10);

fn open() -> Registrar {
    Registrar::builder(RegistrarConfig::transient())
        .clock(Arc::new(ManualClock::new(0)) as Arc<dyn Clock>)
        .open()
        .unwrap()
}

fn camera(n: usize) -> Item {
    Item::new(TypeDesc::new("Camera"), ServiceHandle::new(n.to_le_bytes().to_vec()))
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Records sequence numbers after a random pause per delivery.
struct JitteryListener {
    name: &'static str,
    max_pause_us: u64,
    seen: Mutex<Vec<u64>>,
}

impl JitteryListener {
    fn new(name: &'static str, max_pause_us: u64) -> Arc<Self> {
        Arc::new(Self {
            name,
            max_pause_us,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<u64> {
        self.seen.lock().clone()
    }
}

impl RemoteEventListener for JitteryListener {
    fn notify(&self, event: &ServiceEvent) -> Result<(), DeliveryError> {
        let pause = rand::thread_rng().gen_range(0..=self.max_pause_us);
        std::thread::sleep(Duration::from_micros(pause));
        self.seen.lock().push(event.seq_no);
        Ok(())
    }

    fn listener_ref(&self) -> ListenerRef {
        ListenerRef::new(self.name)
    }
}

/// Fails transiently on every delivery.
struct FlakyListener;

impl RemoteEventListener for FlakyListener {
    fn notify(&self, _event: &ServiceEvent) -> Result<(), DeliveryError> {
        Err(DeliveryError::Transient("connection reset".to_string()))
    }

    fn listener_ref(&self) -> ListenerRef {
        ListenerRef::new("flaky")
    }
}

#[test]
fn test_sequence_numbers_arrive_in_order() {
    const N: usize = 200;
    let registrar = open();
    let listener = JitteryListener::new("jitter", 500);
    registrar
        .notify(
            Template::by_type("Camera"),
            Transitions::NOMATCH_MATCH,
            Arc::clone(&listener) as Arc<dyn RemoteEventListener>,
            None,
            LeaseDuration::Any,
        )
        .unwrap();

    std::thread::scope(|s| {
        for t in 0..4 {
            let registrar = &registrar;
            s.spawn(move || {
                for i in 0..N / 4 {
                    registrar.register(camera(t * 1_000 + i), LeaseDuration::Any).unwrap();
                }
            });
        }
    });

    assert!(wait_for(|| listener.seen().len() == N));
    let expected: Vec<u64> = (1..=N as u64).collect();
    assert_eq!(listener.seen(), expected);
}

#[test]
fn test_slow_subscriber_does_not_delay_others() {
    let registrar = open();
    let slow = JitteryListener::new("slow", 20_000);
    let (fast, fast_rx) = ChannelListener::new("fast");
    let listeners: [Arc<dyn RemoteEventListener>; 2] = [slow.clone(), fast];
    for listener in listeners {
        registrar
            .notify(Template::any(), Transitions::all(), listener, None, LeaseDuration::Any)
            .unwrap();
    }

    for i in 0..20 {
        registrar.register(camera(i), LeaseDuration::Any).unwrap();
    }
    for expected in 1..=20 {
        assert_eq!(fast_rx.recv_timeout(WAIT).unwrap().seq_no, expected);
    }
    assert!(wait_for(|| slow.seen().len() == 20));
}

#[test]
fn test_permanent_failure_cancels_subscription() {
    let registrar = open();
    let (listener, rx) = ChannelListener::new("hung-up");
    let sub = registrar
        .notify(Template::any(), Transitions::all(), listener, None, LeaseDuration::Any)
        .unwrap();
    drop(rx);

    registrar.register(camera(1), LeaseDuration::Any).unwrap();
    assert!(wait_for(|| registrar.stats().events == 0));

    let err = registrar
        .renew_event_lease(sub.event_id, sub.lease.lease_id, LeaseDuration::Any)
        .unwrap_err();
    assert!(matches!(err, RegistrarError::NotFound(_)));
}

#[test]
fn test_transient_failure_keeps_subscription() {
    let registrar = open();
    let sub = registrar
        .notify(Template::any(), Transitions::all(), Arc::new(FlakyListener), None, LeaseDuration::Any)
        .unwrap();

    registrar.register(camera(1), LeaseDuration::Any).unwrap();
    registrar.register(camera(2), LeaseDuration::Any).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(registrar.stats().events, 1);
    registrar
        .renew_event_lease(sub.event_id, sub.lease.lease_id, LeaseDuration::Any)
        .unwrap();
}

#[test]
fn test_only_requested_transitions_are_delivered() {
    let registrar = open();
    let (listener, rx) = ChannelListener::new("departures");
    registrar
        .notify(
            Template::by_type("Camera"),
            Transitions::MATCH_NOMATCH,
            listener,
            None,
            LeaseDuration::Any,
        )
        .unwrap();

    let reg = registrar.register(camera(1), LeaseDuration::Any).unwrap();
    let other = Item::new(TypeDesc::new("Scanner"), ServiceHandle::new(*b"s"));
    registrar.register(other, LeaseDuration::Any).unwrap();
    registrar
        .cancel_service_lease(reg.service_id, reg.lease.lease_id)
        .unwrap();

    let event = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(event.seq_no, 1);
    assert_eq!(event.transition, Transitions::MATCH_NOMATCH);
    assert_eq!(event.service_id, reg.service_id);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_many_subscriptions_share_the_delivery_pool() {
    let config = RegistrarConfig {
        delivery_workers: 2,
        ..RegistrarConfig::transient()
    };
    let registrar = Registrar::builder(config)
        .clock(Arc::new(ManualClock::new(0)) as Arc<dyn Clock>)
        .open()
        .unwrap();

    let receivers: Vec<_> = (0..50)
        .map(|_| {
            let (listener, rx) = ChannelListener::new("watcher");
            registrar
                .notify(Template::by_type("Camera"), Transitions::all(), listener, None, LeaseDuration::Any)
                .unwrap();
            rx
        })
        .collect();

    registrar.register(camera(1), LeaseDuration::Any).unwrap();
    registrar.register(camera(2), LeaseDuration::Any).unwrap();
    for rx in &receivers {
        assert_eq!(rx.recv_timeout(WAIT).unwrap().seq_no, 1);
        assert_eq!(rx.recv_timeout(WAIT).unwrap().seq_no, 2);
    }

    let stats = registrar.stats();
    assert_eq!(stats.delivery_workers, 2);
    assert_eq!(stats.delivery_mailboxes, 50);
}
