//! The single owned aggregate behind the registrar lock.
//!
//! `apply_*` functions are the shared mutation path of live operations and
//! log replay. They do no lease or lifecycle checks: callers validate first,
//! log, then apply.

use std::num::NonZeroUsize;

use tracing::debug;

use crate::config::Tunables;
use crate::event::listener::ListenerResolver;
use crate::event::{transition, Delivery};
use crate::ids::{EventId, LeaseId, ServiceId};
use crate::index::IndexManager;
use crate::lease::{ExpiredLeases, LeasePolicy};
use crate::model::{EventReg, EventRegRecord, Item, ListenerSlot, SvcReg, TypeGraph};
use crate::persist::{LogRecord, SnapshotHeader};

#[derive(Debug)]
pub(crate) struct RegistryState {
    pub index: IndexManager,
    pub policy: LeasePolicy,
    pub expired: ExpiredLeases,
    pub registrar_id: ServiceId,
    /// Next event ID to allocate. Only ever grows.
    pub next_event_id: u64,
}

/// Outcome of replaying one log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Replayed {
    Applied,
    /// The record referred to something that no longer exists (or to an
    /// older lease); nothing changed.
    Skipped,
}

impl RegistryState {
    pub fn new(tunables: Tunables, expired_memory: NonZeroUsize) -> Self {
        Self {
            index: IndexManager::new(),
            policy: LeasePolicy::new(tunables),
            expired: ExpiredLeases::new(expired_memory),
            registrar_id: ServiceId::new(),
            next_event_id: 1,
        }
    }

    /// Re-solves the dynamic lease maxima for the current counts.
    pub fn recompute(&mut self) {
        self.policy
            .recompute(self.index.service_count(), self.index.event_count());
    }

    pub fn apply_tunables(&mut self, tunables: Tunables) {
        let (services, events) = (self.index.service_count(), self.index.event_count());
        self.policy.set_tunables(tunables, services, events);
    }

    /// Indexes `reg`, replacing (and returning) any registration with the
    /// same service ID.
    pub fn apply_register(&mut self, reg: SvcReg) -> Option<SvcReg> {
        let id = reg.service_id();
        let prior = self.index.delete_service(&id);
        self.expired.service_reused(&id);
        self.index.add_service(reg);
        if prior.is_none() {
            self.recompute();
        }
        prior
    }

    pub fn apply_service_renew(&mut self, id: &ServiceId, expiration: i64) -> bool {
        self.index.set_service_expiration(id, expiration)
    }

    pub fn apply_service_cancel(&mut self, id: &ServiceId) -> Option<SvcReg> {
        let reg = self.index.delete_service(id)?;
        self.recompute();
        Some(reg)
    }

    /// Removes a lapsed registration and remembers its lease.
    pub fn apply_service_expired(&mut self, id: &ServiceId) -> Option<SvcReg> {
        let reg = self.apply_service_cancel(id)?;
        self.expired.service_reaped(*id, reg.lease_id);
        Some(reg)
    }

    pub fn apply_event_register(&mut self, reg: EventReg) {
        self.next_event_id = self.next_event_id.max(reg.event_id.get().saturating_add(1));
        self.index.add_event(reg);
        self.recompute();
    }

    pub fn apply_event_renew(&mut self, id: &EventId, expiration: i64) -> bool {
        self.index.set_event_expiration(id, expiration)
    }

    pub fn apply_event_cancel(&mut self, id: &EventId) -> Option<EventReg> {
        let reg = self.index.delete_event(id)?;
        self.recompute();
        Some(reg)
    }

    pub fn apply_event_expired(&mut self, id: &EventId) -> Option<EventReg> {
        let reg = self.apply_event_cancel(id)?;
        self.expired.event_reaped(*id, reg.lease_id);
        Some(reg)
    }

    /// Runs `edit` on a copy of the item and re-indexes the result.
    /// Returns the (pre, post) items, or `None` if the service is unknown.
    pub fn apply_attributes(
        &mut self,
        id: &ServiceId,
        edit: impl FnOnce(&mut Item, &TypeGraph),
    ) -> Option<(Item, Item)> {
        let pre = self.index.service(id)?.item.clone();
        let mut post = pre.clone();
        edit(&mut post, self.index.types());
        self.index.replace_attributes(id, post.attributes.clone());
        Some((pre, post))
    }

    /// Detects transitions for one item change and stamps sequence numbers.
    pub fn transitions(&mut self, service_id: ServiceId, pre: Option<&Item>, post: Option<&Item>, now: i64) -> Vec<Delivery> {
        let source = self.registrar_id;
        transition::generate(&mut self.index, source, service_id, pre, post, now)
    }

    /// Rebuilds an event registration from its persisted form.
    pub fn restore_event(record: EventRegRecord, resolver: &dyn ListenerResolver) -> EventReg {
        let slot = match resolver.resolve(&record.listener_ref) {
            Some(listener) => ListenerSlot::Live(listener),
            None => {
                debug!(event_id = %record.event_id, "listener did not resolve; registration is inert");
                ListenerSlot::Inert
            }
        };
        record.into_reg(slot)
    }

    /// `log_sequence` is stamped by the store when the snapshot begins.
    pub fn snapshot_header(&self, taken_at: i64) -> SnapshotHeader {
        SnapshotHeader {
            registrar_id: self.registrar_id,
            next_event_id: self.next_event_id,
            tunables: self.policy.tunables().clone(),
            services: self.index.service_count() as u64,
            events: self.index.event_count() as u64,
            log_sequence: 0,
            taken_at,
        }
    }

    fn service_lease_is(&self, id: &ServiceId, lease: &LeaseId) -> bool {
        self.index.service(id).is_some_and(|r| r.lease_id == *lease)
    }

    fn event_lease_is(&self, id: &EventId, lease: &LeaseId) -> bool {
        self.index.event(id).is_some_and(|r| r.lease_id == *lease)
    }

    /// Re-applies one logged operation. No events are generated.
    pub fn replay(&mut self, record: LogRecord, resolver: &dyn ListenerResolver) -> Replayed {
        let kind = record.kind();
        let applied = match record {
            LogRecord::Identity { registrar_id } => {
                self.registrar_id = registrar_id;
                true
            }
            LogRecord::ServiceRegistered { reg } => {
                self.apply_register(reg);
                true
            }
            LogRecord::ServiceLeaseRenewed {
                service_id,
                lease_id,
                expiration,
            } => self.service_lease_is(&service_id, &lease_id) && self.apply_service_renew(&service_id, expiration),
            LogRecord::ServiceLeaseCancelled { service_id, lease_id } => {
                self.service_lease_is(&service_id, &lease_id) && self.apply_service_cancel(&service_id).is_some()
            }
            LogRecord::EventRegistered { reg } => {
                let reg = Self::restore_event(reg, resolver);
                self.apply_event_register(reg);
                true
            }
            LogRecord::EventLeaseRenewed {
                event_id,
                lease_id,
                expiration,
            } => self.event_lease_is(&event_id, &lease_id) && self.apply_event_renew(&event_id, expiration),
            LogRecord::EventLeaseCancelled { event_id, lease_id } => {
                self.event_lease_is(&event_id, &lease_id) && self.apply_event_cancel(&event_id).is_some()
            }
            LogRecord::AttributesAdded {
                service_id,
                lease_id,
                attributes,
            } => {
                self.service_lease_is(&service_id, &lease_id)
                    && self
                        .apply_attributes(&service_id, |item, _| item.add_attributes(&attributes))
                        .is_some()
            }
            LogRecord::AttributesModified {
                service_id,
                lease_id,
                templates,
                changes,
            } => {
                self.service_lease_is(&service_id, &lease_id)
                    && self
                        .apply_attributes(&service_id, |item, graph| {
                            item.modify_attributes(&templates, &changes, graph);
                        })
                        .is_some()
            }
            LogRecord::AttributesSet {
                service_id,
                lease_id,
                attributes,
            } => {
                self.service_lease_is(&service_id, &lease_id)
                    && self
                        .apply_attributes(&service_id, |item, _| {
                            item.attributes = attributes;
                            item.dedup_attributes();
                        })
                        .is_some()
            }
            LogRecord::TunablesChanged { tunables } => {
                self.apply_tunables(tunables);
                true
            }
        };
        if applied {
            Replayed::Applied
        } else {
            debug!(kind, "log record refers to a missing registration or stale lease; skipped");
            Replayed::Skipped
        }
    }
}
