//! The registrar: public operation contract over the registry state.
//!
//! # Concurrency
//!
//! One reader/writer lock guards all index, lease and event state. Lookups
//! and browsing take it shared; every mutation takes it exclusively, and
//! lease renewals use a priority write mode so they are not starved by a
//! backlog of registrations. Three background threads run beside request
//! handling: a service lease sweeper, an event lease sweeper and (when
//! persistent) a snapshot writer. Event delivery runs on one worker per
//! subscription.
//!
//! # Example
//!
//! ```
//! use svcreg::{Item, LeaseDuration, Registrar, RegistrarConfig, ServiceHandle, Template, TypeDesc};
//!
//! let registrar = Registrar::open(RegistrarConfig::transient()).unwrap();
//! let item = Item::new(TypeDesc::new("Printer"), ServiceHandle::new(*b"lp0"));
//! let reg = registrar.register(item, LeaseDuration::Any).unwrap();
//!
//! let found = registrar.lookup(&Template::by_type("Printer")).unwrap().unwrap();
//! assert_eq!(found.service_id, Some(reg.service_id));
//! registrar.destroy().unwrap();
//! ```

mod background;
mod engine;
mod lifecycle;
mod recovery;
mod state;
mod sync;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::config::{RegistrarConfig, Tunables};
use crate::error::RegistrarResult;
use crate::event::listener::{ListenerResolver, NoResolver, RemoteEventListener};
use crate::ids::{EventId, LeaseId, ServiceId};
use crate::lease::{LeaseDuration, LeaseGrant, LeaseTarget};
use crate::model::{EntryClassDesc, EntryRep, EventRegRecord, FieldValue, Item, SvcReg, Template, Transitions};

use self::engine::{Collaborators, Core};

pub use lifecycle::Lifecycle;

/// Makes the registrar callable remotely. Owned by the transport layer.
pub trait RemoteExport: Send + Sync {
    /// Withdraws the export. Without `force`, an export with calls in
    /// flight may refuse and return false.
    fn unexport(&self, force: bool) -> bool;
}

/// Result of a successful `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceRegistration {
    pub service_id: ServiceId,
    pub lease: LeaseGrant,
}

/// Result of a successful `notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventRegistration {
    pub event_id: EventId,
    /// ID of the registrar that will generate the events.
    pub source: ServiceId,
    pub lease: LeaseGrant,
    /// Sequence number as of registration; the first event carries `seq_no + 1`.
    pub seq_no: u64,
}

/// Result of `lookup_many`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupMatches {
    pub items: Vec<Item>,
    /// All matches, including those beyond the requested maximum.
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrarStats {
    pub registrar_id: ServiceId,
    pub lifecycle: Lifecycle,
    pub services: usize,
    pub events: usize,
    pub entry_classes: usize,
    pub records_since_snapshot: u64,
    pub max_service_lease_ms: i64,
    pub max_event_lease_ms: i64,
    pub dropped_events: u64,
    /// Size of the listener delivery pool.
    pub delivery_workers: usize,
    /// Subscriptions with a delivery mailbox.
    pub delivery_mailboxes: usize,
}

/// Every live registration, for inspection tools.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryDump {
    pub services: Vec<SvcReg>,
    pub events: Vec<EventRegRecord>,
}

/// Configures and opens a [`Registrar`].
pub struct RegistrarBuilder {
    config: RegistrarConfig,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn ListenerResolver>,
    export: Option<Arc<dyn RemoteExport>>,
}

impl RegistrarBuilder {
    #[must_use]
    pub fn new(config: RegistrarConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            resolver: Arc::new(NoResolver),
            export: None,
        }
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Resolves listener references found during recovery.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn ListenerResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Export withdrawn by [`Registrar::destroy`].
    #[must_use]
    pub fn export(mut self, export: Arc<dyn RemoteExport>) -> Self {
        self.export = Some(export);
        self
    }

    /// Recovers persisted state (if configured) and starts the registrar.
    ///
    /// # Errors
    /// - `InvalidArgument` for an invalid configuration
    /// - `Unrecoverable` if the persisted state is corrupt or from another format version
    /// - `Storage` if the data directory cannot be locked or read
    pub fn open(self) -> RegistrarResult<Registrar> {
        let core = Core::start(
            self.config,
            Collaborators {
                clock: self.clock,
                resolver: self.resolver,
                export: self.export,
            },
        )?;
        Ok(Registrar { core })
    }
}

impl fmt::Debug for RegistrarBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrarBuilder")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("export", &self.export.is_some())
            .finish_non_exhaustive()
    }
}

/// A running service registrar.
///
/// Dropping it shuts it down; call [`destroy`](Self::destroy) to observe
/// shutdown errors.
pub struct Registrar {
    core: Arc<Core>,
}

impl fmt::Debug for Registrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrar")
            .field("registrar_id", &self.core.registrar_id)
            .field("lifecycle", &self.core.lifecycle())
            .finish_non_exhaustive()
    }
}

impl Registrar {
    /// Opens a registrar with the system clock and no listener resolver.
    pub fn open(config: RegistrarConfig) -> RegistrarResult<Self> {
        RegistrarBuilder::new(config).open()
    }

    #[must_use]
    pub fn builder(config: RegistrarConfig) -> RegistrarBuilder {
        RegistrarBuilder::new(config)
    }

    /// The registrar's own service ID. Reserved for it.
    #[must_use]
    pub fn registrar_id(&self) -> ServiceId {
        self.core.registrar_id
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle()
    }

    /// Registers `item`, replacing any registration with the same service
    /// ID. Items without an ID are assigned a fresh one.
    ///
    /// # Errors
    /// - `InvalidArgument` for a negative duration, a malformed item, or the
    ///   nil / registrar's own service ID
    pub fn register(&self, item: Item, duration: LeaseDuration) -> RegistrarResult<ServiceRegistration> {
        self.core.register(item, duration)
    }

    /// One matching item, or `None`.
    ///
    /// Without a service ID or attribute constraint the pick is random
    /// among all matches.
    pub fn lookup(&self, template: &Template) -> RegistrarResult<Option<Item>> {
        self.core.lookup(template)
    }

    /// Up to `max` matching items plus the total number of matches.
    pub fn lookup_many(&self, template: &Template, max: usize) -> RegistrarResult<LookupMatches> {
        self.core.lookup_many(template, max)
    }

    /// Subscribes `listener` to the requested transitions of items matching
    /// `template`.
    ///
    /// # Errors
    /// - `InvalidArgument` for an empty or unknown transition mask, or a negative duration
    pub fn notify(
        &self,
        template: Template,
        transitions: Transitions,
        listener: Arc<dyn RemoteEventListener>,
        handback: Option<Vec<u8>>,
        duration: LeaseDuration,
    ) -> RegistrarResult<EventRegistration> {
        self.core.notify(template, transitions, listener, handback, duration)
    }

    /// # Errors
    /// - `NotFound`, `LeaseMismatch` or `LeaseExpired`
    pub fn renew_service_lease(
        &self,
        service_id: ServiceId,
        lease_id: LeaseId,
        duration: LeaseDuration,
    ) -> RegistrarResult<LeaseGrant> {
        self.core.renew_service_lease(service_id, lease_id, duration)
    }

    pub fn cancel_service_lease(&self, service_id: ServiceId, lease_id: LeaseId) -> RegistrarResult<()> {
        self.core.cancel_service_lease(service_id, lease_id)
    }

    pub fn renew_event_lease(&self, event_id: EventId, lease_id: LeaseId, duration: LeaseDuration) -> RegistrarResult<LeaseGrant> {
        self.core.renew_event_lease(event_id, lease_id, duration)
    }

    pub fn cancel_event_lease(&self, event_id: EventId, lease_id: LeaseId) -> RegistrarResult<()> {
        self.core.cancel_event_lease(event_id, lease_id)
    }

    /// Renews each lease independently; one result per request, in order.
    pub fn renew_leases(&self, requests: &[(LeaseTarget, LeaseDuration)]) -> Vec<RegistrarResult<LeaseGrant>> {
        self.core.renew_leases(requests)
    }

    /// Cancels each lease independently; one result per target, in order.
    pub fn cancel_leases(&self, targets: &[LeaseTarget]) -> Vec<RegistrarResult<()>> {
        self.core.cancel_leases(targets)
    }

    /// Adds entries not already present on the item.
    pub fn add_attributes(&self, service_id: ServiceId, lease_id: LeaseId, attributes: Vec<EntryRep>) -> RegistrarResult<()> {
        self.core.add_attributes(service_id, lease_id, attributes)
    }

    /// For each `templates[i]`, applies `changes[i]` to the matching
    /// entries. A `None` change deletes them.
    ///
    /// # Errors
    /// - `InvalidArgument` if the lists differ in length or a change's class
    ///   differs from its template's
    pub fn modify_attributes(
        &self,
        service_id: ServiceId,
        lease_id: LeaseId,
        templates: Vec<EntryRep>,
        changes: Vec<Option<EntryRep>>,
    ) -> RegistrarResult<()> {
        self.core.modify_attributes(service_id, lease_id, templates, changes)
    }

    /// Replaces every entry on the item.
    pub fn set_attributes(&self, service_id: ServiceId, lease_id: LeaseId, attributes: Vec<EntryRep>) -> RegistrarResult<()> {
        self.core.set_attributes(service_id, lease_id, attributes)
    }

    /// Distinct entry classes on matching items.
    pub fn entry_classes(&self, template: &Template) -> RegistrarResult<Vec<EntryClassDesc>> {
        self.core.entry_classes(template)
    }

    /// Distinct values of one field, over the entries of matching items
    /// that match `template.attributes[entry_index]`.
    ///
    /// # Errors
    /// - `InvalidArgument` (`MissingField`) if either index is out of range
    pub fn field_values(&self, template: &Template, entry_index: usize, field_index: usize) -> RegistrarResult<Vec<FieldValue>> {
        self.core.field_values(template, entry_index, field_index)
    }

    /// Distinct type names (concrete and ancestors) of matching items that
    /// start with `prefix`.
    pub fn service_types(&self, template: &Template, prefix: &str) -> RegistrarResult<Vec<String>> {
        self.core.service_types(template, prefix)
    }

    pub fn update_tunables(&self, tunables: Tunables) -> RegistrarResult<()> {
        self.core.update_tunables(tunables)
    }

    pub fn tunables(&self) -> RegistrarResult<Tunables> {
        self.core.tunables()
    }

    #[must_use]
    pub fn stats(&self) -> RegistrarStats {
        self.core.stats()
    }

    pub fn dump(&self) -> RegistrarResult<RegistryDump> {
        self.core.dump()
    }

    /// Writes a snapshot immediately and truncates the log. Returns false
    /// when running without persistence.
    pub fn snapshot(&self) -> RegistrarResult<bool> {
        self.core.snapshot()
    }

    /// Shuts the registrar down. Idempotent.
    pub fn destroy(&self) -> RegistrarResult<()> {
        self.core.destroy()
    }
}

impl Drop for Registrar {
    fn drop(&mut self) {
        if self.core.lifecycle() == Lifecycle::Running {
            if let Err(e) = self.core.destroy() {
                tracing::warn!(error = %e, "registrar shutdown on drop failed");
            }
        }
    }
}
