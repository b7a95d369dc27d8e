//! Listener contract and the event envelope delivered to subscribers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{EventId, ServiceId};
use crate::model::{Item, Transitions};

/// Persistable reference to a listener (a marshalled remote handle).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerRef(pub Vec<u8>);

impl ListenerRef {
    #[must_use]
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        Self(bytes.as_ref().to_vec())
    }
}

/// A change notification for one event registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    /// Service ID of the registrar that generated the event.
    pub source: ServiceId,
    pub event_id: EventId,
    pub seq_no: u64,
    pub service_id: ServiceId,
    /// Exactly one transition bit.
    pub transition: Transitions,
    /// Post-state of the item; `None` when it no longer exists.
    pub item: Option<Item>,
    pub handback: Option<Vec<u8>>,
    pub generated_at: DateTime<Utc>,
}

/// Why a delivery failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Timeout or transport trouble. The subscription is kept.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The listener repudiated the event or no longer exists. The event
    /// lease is cancelled.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Receiver of change notifications.
pub trait RemoteEventListener: Send + Sync {
    /// Delivers one event. Called from the subscription's own worker, in
    /// sequence order.
    fn notify(&self, event: &ServiceEvent) -> Result<(), DeliveryError>;

    /// Reference persisted with the registration so it can be re-resolved
    /// after a restart.
    fn listener_ref(&self) -> ListenerRef;
}

/// Turns persisted listener references back into live listeners.
pub trait ListenerResolver: Send + Sync {
    fn resolve(&self, reference: &ListenerRef) -> Option<Arc<dyn RemoteEventListener>>;
}

/// Resolver that never resolves. Every recovered subscription is inert.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResolver;

impl ListenerResolver for NoResolver {
    fn resolve(&self, _reference: &ListenerRef) -> Option<Arc<dyn RemoteEventListener>> {
        None
    }
}

/// In-process resolver backed by a map of known listeners.
#[derive(Default)]
pub struct ListenerDirectory {
    listeners: RwLock<HashMap<ListenerRef, Arc<dyn RemoteEventListener>>>,
}

impl ListenerDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, listener: Arc<dyn RemoteEventListener>) {
        self.listeners.write().insert(listener.listener_ref(), listener);
    }
}

impl fmt::Debug for ListenerDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerDirectory")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl ListenerResolver for ListenerDirectory {
    fn resolve(&self, reference: &ListenerRef) -> Option<Arc<dyn RemoteEventListener>> {
        self.listeners.read().get(reference).cloned()
    }
}

/// In-process listener that forwards events into a channel.
///
/// Dropping the receiver makes further deliveries fail permanently, which
/// cancels the subscription.
#[derive(Debug)]
pub struct ChannelListener {
    reference: ListenerRef,
    tx: Sender<ServiceEvent>,
}

impl ChannelListener {
    #[must_use]
    pub fn new(name: &str) -> (Arc<Self>, Receiver<ServiceEvent>) {
        let (tx, rx) = unbounded();
        let listener = Arc::new(Self {
            reference: ListenerRef::new(name),
            tx,
        });
        (listener, rx)
    }
}

impl RemoteEventListener for ChannelListener {
    fn notify(&self, event: &ServiceEvent) -> Result<(), DeliveryError> {
        self.tx
            .send(event.clone())
            .map_err(|_| DeliveryError::Permanent("receiver dropped".to_string()))
    }

    fn listener_ref(&self) -> ListenerRef {
        self.reference.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> ServiceEvent {
        ServiceEvent {
            source: ServiceId::new(),
            event_id: EventId::new(1),
            seq_no: 1,
            service_id: ServiceId::new(),
            transition: Transitions::NOMATCH_MATCH,
            item: None,
            handback: None,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_channel_listener_forwards() {
        let (listener, rx) = ChannelListener::new("l1");
        listener.notify(&event()).unwrap();
        assert_eq!(rx.try_recv().unwrap().seq_no, 1);
    }

    #[test]
    fn test_channel_listener_dropped_receiver_is_permanent() {
        let (listener, rx) = ChannelListener::new("l1");
        drop(rx);
        let err = listener.notify(&event()).unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_directory_resolves_known_refs() {
        let dir = ListenerDirectory::new();
        let (listener, _rx) = ChannelListener::new("known");
        dir.insert(listener);
        assert!(dir.resolve(&ListenerRef::new("known")).is_some());
        assert!(dir.resolve(&ListenerRef::new("unknown")).is_none());
        assert!(NoResolver.resolve(&ListenerRef::new("known")).is_none());
    }
}
