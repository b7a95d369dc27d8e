//! Lease bookkeeping shared by service and event registrations.
//!
//! - [`policy`]: grant durations and the load-dependent maxima.
//! - [`ExpiredLeases`]: a bounded memory of reaped leases, so a late
//!   renewal reports `LeaseExpired` instead of `NotFound`.
//! - [`sweeper`]: the wakeable park/reap loop run by both sweepers.

pub mod policy;
pub mod sweeper;

use std::num::NonZeroUsize;

use lru::LruCache;
use serde::Serialize;

use crate::error::{Missing, RegistrarError, RegistrarResult};
use crate::ids::{EventId, LeaseId, ServiceId};
use crate::index::IndexManager;
use crate::model::{EventReg, SvcReg};

pub use policy::{LeaseDuration, LeasePolicy};

/// A granted (or renewed) lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeaseGrant {
    pub lease_id: LeaseId,
    /// Absolute expiration, milliseconds since the epoch.
    pub expiration: i64,
    /// Duration actually granted, after clamping.
    pub duration_ms: i64,
}

/// Names one lease in a batch renew or cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseTarget {
    Service { service_id: ServiceId, lease_id: LeaseId },
    Event { event_id: EventId, lease_id: LeaseId },
}

/// Leases reaped by a sweeper, most recent first, bounded.
#[derive(Debug)]
pub struct ExpiredLeases {
    services: LruCache<ServiceId, LeaseId>,
    events: LruCache<EventId, LeaseId>,
}

impl ExpiredLeases {
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            services: LruCache::new(capacity),
            events: LruCache::new(capacity),
        }
    }

    pub fn service_reaped(&mut self, id: ServiceId, lease: LeaseId) {
        self.services.put(id, lease);
    }

    pub fn event_reaped(&mut self, id: EventId, lease: LeaseId) {
        self.events.put(id, lease);
    }

    /// A reused service ID invalidates the old tombstone.
    pub fn service_reused(&mut self, id: &ServiceId) {
        self.services.pop(id);
    }

    #[must_use]
    pub fn was_service_reaped(&self, id: &ServiceId, lease: &LeaseId) -> bool {
        self.services.peek(id) == Some(lease)
    }

    #[must_use]
    pub fn was_event_reaped(&self, id: &EventId, lease: &LeaseId) -> bool {
        self.events.peek(id) == Some(lease)
    }
}

/// Resolves a live service lease, or reports why it cannot be used.
pub fn check_service_lease<'a>(
    index: &'a IndexManager,
    expired: &ExpiredLeases,
    id: &ServiceId,
    lease: &LeaseId,
    now: i64,
) -> RegistrarResult<&'a SvcReg> {
    let target = Missing::Service(*id);
    match index.service(id) {
        Some(reg) if reg.lease_id != *lease => Err(RegistrarError::LeaseMismatch {
            target,
            presented: *lease,
        }),
        Some(reg) if reg.expiration <= now => Err(RegistrarError::LeaseExpired { target, lease: *lease }),
        Some(reg) => Ok(reg),
        None if expired.was_service_reaped(id, lease) => {
            Err(RegistrarError::LeaseExpired { target, lease: *lease })
        }
        None => Err(RegistrarError::NotFound(target)),
    }
}

/// Resolves a live event lease, or reports why it cannot be used.
pub fn check_event_lease<'a>(
    index: &'a IndexManager,
    expired: &ExpiredLeases,
    id: &EventId,
    lease: &LeaseId,
    now: i64,
) -> RegistrarResult<&'a EventReg> {
    let target = Missing::Event(*id);
    match index.event(id) {
        Some(reg) if reg.lease_id != *lease => Err(RegistrarError::LeaseMismatch {
            target,
            presented: *lease,
        }),
        Some(reg) if reg.expiration <= now => Err(RegistrarError::LeaseExpired { target, lease: *lease }),
        Some(reg) => Ok(reg),
        None if expired.was_event_reaped(id, lease) => {
            Err(RegistrarError::LeaseExpired { target, lease: *lease })
        }
        None => Err(RegistrarError::NotFound(target)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Item, ServiceHandle, TypeDesc};

    fn tombstones() -> ExpiredLeases {
        ExpiredLeases::new(NonZeroUsize::new(2).unwrap())
    }

    #[test]
    fn test_service_lease_checks() {
        let mut index = IndexManager::new();
        let id = ServiceId::new();
        let lease = LeaseId::new();
        index.add_service(SvcReg {
            item: Item::new(TypeDesc::new("Printer"), ServiceHandle::new(*b"p")).with_id(id),
            lease_id: lease,
            expiration: 100,
        });
        let expired = tombstones();

        assert!(check_service_lease(&index, &expired, &id, &lease, 50).is_ok());
        assert!(matches!(
            check_service_lease(&index, &expired, &id, &LeaseId::new(), 50),
            Err(RegistrarError::LeaseMismatch { .. })
        ));
        assert!(matches!(
            check_service_lease(&index, &expired, &id, &lease, 100),
            Err(RegistrarError::LeaseExpired { .. })
        ));
        assert!(matches!(
            check_service_lease(&index, &expired, &ServiceId::new(), &lease, 50),
            Err(RegistrarError::NotFound(Missing::Service(_)))
        ));
    }

    #[test]
    fn test_tombstone_reports_expired_until_evicted() {
        let index = IndexManager::new();
        let mut expired = tombstones();
        let (id, lease) = (ServiceId::new(), LeaseId::new());
        expired.service_reaped(id, lease);
        assert!(check_service_lease(&index, &expired, &id, &lease, 0)
            .unwrap_err()
            .is_lease_error());

        expired.service_reaped(ServiceId::new(), LeaseId::new());
        expired.service_reaped(ServiceId::new(), LeaseId::new());
        assert!(matches!(
            check_service_lease(&index, &expired, &id, &lease, 0),
            Err(RegistrarError::NotFound(_))
        ));
    }

    #[test]
    fn test_event_tombstone() {
        let index = IndexManager::new();
        let mut expired = tombstones();
        let lease = LeaseId::new();
        expired.event_reaped(EventId::new(7), lease);
        assert!(matches!(
            check_event_lease(&index, &expired, &EventId::new(7), &lease, 0),
            Err(RegistrarError::LeaseExpired { .. })
        ));
        assert!(matches!(
            check_event_lease(&index, &expired, &EventId::new(7), &LeaseId::new(), 0),
            Err(RegistrarError::NotFound(Missing::Event(_)))
        ));
    }
}
