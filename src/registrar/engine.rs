//! Registrar operations behind the one registry lock.
//!
//! Every mutation follows the same order under the write lock: re-check
//! the lifecycle, validate the lease, append the log record, apply, then
//! generate and enqueue events. A failed append leaves state untouched.

use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{RegistrarConfig, Tunables};
use crate::error::{Missing, RegistrarError, RegistrarResult, ValidationError};
use crate::event::listener::{ListenerResolver, RemoteEventListener};
use crate::event::{Dispatcher, PermanentFailureHook};
use crate::ids::{EventId, LeaseId, ServiceId};
use crate::lease::sweeper::{self, WakeSignal};
use crate::lease::{check_event_lease, check_service_lease, LeaseDuration, LeaseGrant, LeaseTarget};
use crate::model::item::validate_modification;
use crate::model::{
    entry_matches, EntryClassDesc, EntryRep, EventReg, FieldValue, Item, ListenerSlot, SvcReg, Template, Transitions,
    TypeGraph,
};
use crate::persist::{LogRecord, Store};

use super::background::{self, EventReaper, ServiceReaper};
use super::lifecycle::{Lifecycle, LifecycleCell};
use super::recovery;
use super::state::RegistryState;
use super::sync::PriorityRwLock;
use super::{EventRegistration, LookupMatches, RegistrarStats, RegistryDump, RemoteExport, ServiceRegistration};

/// Shared registrar internals. Background threads hold an `Arc` to it.
pub(crate) struct Core {
    pub(super) config: RegistrarConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) lifecycle: LifecycleCell,
    pub(super) registrar_id: ServiceId,
    pub(super) state: PriorityRwLock<RegistryState>,
    /// `None` when transient, and after shutdown.
    pub(super) store: Mutex<Option<Store>>,
    pub(super) dispatcher: Dispatcher,
    pub(super) service_wake: WakeSignal,
    pub(super) event_wake: WakeSignal,
    /// Dropping the sender stops the snapshot loop.
    pub(super) snapshot_tx: Mutex<Option<Sender<()>>>,
    pub(super) threads: Mutex<Vec<JoinHandle<()>>>,
    pub(super) export: Mutex<Option<Arc<dyn RemoteExport>>>,
}

/// Everything `Core::start` needs besides the configuration.
pub(crate) struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub resolver: Arc<dyn ListenerResolver>,
    pub export: Option<Arc<dyn RemoteExport>>,
}

/// Any template that does not pin a service ID or an attribute is
/// answered with a random pick among the matches.
fn load_balanced(template: &Template) -> bool {
    template.service_id.is_none() && template.attributes.is_empty()
}

fn wake_if_earlier(wake: &WakeSignal, earliest: Option<i64>, expiration: i64) {
    if earliest.map_or(true, |e| expiration < e) {
        wake.notify();
    }
}

impl Core {
    /// Recovers (if persistent), then starts the background loops.
    pub fn start(config: RegistrarConfig, parts: Collaborators) -> RegistrarResult<Arc<Self>> {
        let config = config.validate()?;
        let lifecycle = LifecycleCell::new();
        let expired_memory = NonZeroUsize::new(config.expired_lease_memory).unwrap_or(NonZeroUsize::MIN);
        let mut state = RegistryState::new(config.tunables.clone(), expired_memory);

        let store = match &config.persistence_dir {
            Some(dir) => {
                lifecycle.set(Lifecycle::Recovering);
                let (store, recovered) = Store::open(dir, config.sync_on_write)?;
                let summary = recovery::restore(&mut state, recovered, parts.resolver.as_ref());
                if !summary.identity_found {
                    store.append(&LogRecord::Identity {
                        registrar_id: state.registrar_id,
                    })?;
                    store.append(&LogRecord::TunablesChanged {
                        tunables: state.policy.tunables().clone(),
                    })?;
                } else if state.policy.tunables() != &config.tunables {
                    info!("persisted tunables take precedence over configured ones");
                }
                Some(store)
            }
            None => None,
        };

        let registrar_id = state.registrar_id;
        let capacity = config.delivery_queue_capacity;
        let persistent = store.is_some();
        let core = Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let on_permanent: PermanentFailureHook = Arc::new(move |event_id, lease_id| {
                if let Some(core) = weak.upgrade() {
                    core.drop_failed_subscription(event_id, lease_id);
                }
            });
            Self {
                config,
                clock: parts.clock,
                lifecycle,
                registrar_id,
                state: PriorityRwLock::new(state),
                store: Mutex::new(store),
                dispatcher: Dispatcher::new(capacity, on_permanent),
                service_wake: WakeSignal::new(),
                event_wake: WakeSignal::new(),
                snapshot_tx: Mutex::new(None),
                threads: Mutex::new(Vec::new()),
                export: Mutex::new(parts.export),
            }
        });

        core.lifecycle.set(Lifecycle::Running);
        if let Err(e) = core.spawn_background() {
            if let Err(shutdown) = core.destroy() {
                warn!(error = %shutdown, "shutdown after failed start also failed");
            }
            return Err(e);
        }
        info!(%registrar_id, persistent, "registrar running");
        Ok(core)
    }

    fn spawn_background(self: &Arc<Self>) -> RegistrarResult<()> {
        self.dispatcher
            .start(self.config.delivery_workers)
            .map_err(|e| RegistrarError::storage(format!("failed to spawn delivery workers: {e}")))?;

        let core = Arc::clone(self);
        self.spawn("svcreg-service-sweeper", move || {
            let reaper = ServiceReaper(&core);
            let interrupted = sweeper::run("service sweeper", &reaper, &core.service_wake, core.clock.as_ref());
            debug!(%interrupted, "background loop exited");
        })?;

        let core = Arc::clone(self);
        self.spawn("svcreg-event-sweeper", move || {
            let reaper = EventReaper(&core);
            let interrupted = sweeper::run("event sweeper", &reaper, &core.event_wake, core.clock.as_ref());
            debug!(%interrupted, "background loop exited");
        })?;

        if self.store.lock().is_some() {
            let (tx, rx) = bounded::<()>(1);
            *self.snapshot_tx.lock() = Some(tx);
            let core = Arc::clone(self);
            self.spawn("svcreg-snapshot", move || {
                let interrupted = background::snapshot_loop(&core, &rx);
                debug!(%interrupted, "background loop exited");
            })?;
        }
        Ok(())
    }

    fn spawn(&self, name: &str, body: impl FnOnce() + Send + 'static) -> RegistrarResult<()> {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|e| RegistrarError::storage(format!("failed to spawn {name}: {e}")))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Lock and log helpers
    // ---------------------------------------------------------------------

    fn read(&self) -> RegistrarResult<RwLockReadGuard<'_, RegistryState>> {
        let guard = self.state.read();
        self.lifecycle.ensure_running()?;
        Ok(guard)
    }

    fn write(&self) -> RegistrarResult<RwLockWriteGuard<'_, RegistryState>> {
        let guard = self.state.write();
        self.lifecycle.ensure_running()?;
        Ok(guard)
    }

    fn write_priority(&self) -> RegistrarResult<RwLockWriteGuard<'_, RegistryState>> {
        let guard = self.state.write_priority();
        self.lifecycle.ensure_running()?;
        Ok(guard)
    }

    fn log(&self, record: &LogRecord) -> RegistrarResult<()> {
        match self.store.lock().as_ref() {
            Some(store) => store.append(record),
            None => Ok(()),
        }
    }

    /// Signals the snapshot loop once the log has outgrown the live state.
    #[allow(clippy::cast_precision_loss)]
    fn maybe_request_snapshot(&self, state: &RegistryState) {
        let records = match self.store.lock().as_ref() {
            Some(store) => store.records_since_snapshot(),
            None => return,
        };
        let tunables = state.policy.tunables();
        let live = state.index.service_count() + state.index.event_count();
        if records < tunables.log_to_snapshot_threshold
            || (records as f64) < f64::from(tunables.snapshot_weight) * live as f64
        {
            return;
        }
        if let Some(tx) = self.snapshot_tx.lock().as_ref() {
            if tx.try_send(()).is_ok() {
                debug!(records, live, "snapshot requested");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Registration and lookup
    // ---------------------------------------------------------------------

    pub fn register(&self, mut item: Item, duration: LeaseDuration) -> RegistrarResult<ServiceRegistration> {
        item.validate()?;
        if let Some(id) = item.service_id {
            if id.is_nil() || id == self.registrar_id {
                return Err(ValidationError::ReservedServiceId { id }.into());
            }
        }

        let mut state = self.write()?;
        let now = self.clock.now_millis();
        let duration_ms = state.policy.service_grant(duration)?;
        let expiration = now.saturating_add(duration_ms);
        let service_id = *item.service_id.get_or_insert_with(ServiceId::new);
        item.dedup_attributes();
        let lease_id = LeaseId::new();
        let reg = SvcReg {
            item,
            lease_id,
            expiration,
        };
        self.log(&LogRecord::ServiceRegistered { reg: reg.clone() })?;

        let earliest = state.index.earliest_service().map(|(e, _)| e);
        let post = reg.item.clone();
        let prior = state.apply_register(reg);
        let deliveries = state.transitions(service_id, prior.as_ref().map(|p| &p.item), Some(&post), now);
        self.dispatcher.dispatch(deliveries);
        wake_if_earlier(&self.service_wake, earliest, expiration);
        self.maybe_request_snapshot(&state);

        debug!(%service_id, duration_ms, replaced = prior.is_some(), "service registered");
        Ok(ServiceRegistration {
            service_id,
            lease: LeaseGrant {
                lease_id,
                expiration,
                duration_ms,
            },
        })
    }

    pub fn lookup(&self, template: &Template) -> RegistrarResult<Option<Item>> {
        template.validate()?;
        let state = self.read()?;
        let now = self.clock.now_millis();
        let mut matches = state.index.matching_items(template, now);
        let found = if load_balanced(template) {
            let all: Vec<&SvcReg> = matches.collect();
            all.choose(&mut rand::thread_rng()).copied()
        } else {
            matches.next()
        };
        Ok(found.map(|reg| reg.item.clone()))
    }

    pub fn lookup_many(&self, template: &Template, max: usize) -> RegistrarResult<LookupMatches> {
        template.validate()?;
        let state = self.read()?;
        let now = self.clock.now_millis();
        let mut all: Vec<&SvcReg> = state.index.matching_items(template, now).collect();
        let total = all.len();
        if load_balanced(template) {
            all.shuffle(&mut rand::thread_rng());
        }
        let items = all.into_iter().take(max).map(|reg| reg.item.clone()).collect();
        Ok(LookupMatches { items, total })
    }

    pub fn notify(
        &self,
        template: Template,
        transitions: Transitions,
        listener: Arc<dyn RemoteEventListener>,
        handback: Option<Vec<u8>>,
        duration: LeaseDuration,
    ) -> RegistrarResult<EventRegistration> {
        template.validate()?;
        let transitions = Transitions::from_mask(transitions.bits())?;

        let mut state = self.write()?;
        let now = self.clock.now_millis();
        let duration_ms = state.policy.event_grant(duration)?;
        let expiration = now.saturating_add(duration_ms);
        let event_id = EventId::new(state.next_event_id);
        let lease_id = LeaseId::new();
        let reg = EventReg {
            event_id,
            lease_id,
            template,
            transitions,
            seq_no: 0,
            listener_ref: listener.listener_ref(),
            listener: ListenerSlot::Live(listener),
            handback,
            expiration,
        };
        self.log(&LogRecord::EventRegistered { reg: reg.record() })?;

        let earliest = state.index.earliest_event().map(|(e, _)| e);
        state.apply_event_register(reg);
        wake_if_earlier(&self.event_wake, earliest, expiration);
        self.maybe_request_snapshot(&state);

        debug!(%event_id, duration_ms, "event registration created");
        Ok(EventRegistration {
            event_id,
            source: self.registrar_id,
            lease: LeaseGrant {
                lease_id,
                expiration,
                duration_ms,
            },
            seq_no: 0,
        })
    }

    // ---------------------------------------------------------------------
    // Leases
    // ---------------------------------------------------------------------

    pub fn renew_service_lease(
        &self,
        service_id: ServiceId,
        lease_id: LeaseId,
        duration: LeaseDuration,
    ) -> RegistrarResult<LeaseGrant> {
        let mut state = self.write_priority()?;
        let now = self.clock.now_millis();
        check_service_lease(&state.index, &state.expired, &service_id, &lease_id, now)?;
        let duration_ms = state.policy.service_grant(duration)?;
        let expiration = now.saturating_add(duration_ms);
        self.log(&LogRecord::ServiceLeaseRenewed {
            service_id,
            lease_id,
            expiration,
        })?;

        let earliest = state.index.earliest_service().map(|(e, _)| e);
        state.apply_service_renew(&service_id, expiration);
        wake_if_earlier(&self.service_wake, earliest, expiration);
        self.maybe_request_snapshot(&state);
        Ok(LeaseGrant {
            lease_id,
            expiration,
            duration_ms,
        })
    }

    pub fn cancel_service_lease(&self, service_id: ServiceId, lease_id: LeaseId) -> RegistrarResult<()> {
        let mut state = self.write()?;
        let now = self.clock.now_millis();
        check_service_lease(&state.index, &state.expired, &service_id, &lease_id, now)?;
        self.log(&LogRecord::ServiceLeaseCancelled { service_id, lease_id })?;

        if let Some(prior) = state.apply_service_cancel(&service_id) {
            let deliveries = state.transitions(service_id, Some(&prior.item), None, now);
            self.dispatcher.dispatch(deliveries);
        }
        self.maybe_request_snapshot(&state);
        debug!(%service_id, "service lease cancelled");
        Ok(())
    }

    pub fn renew_event_lease(
        &self,
        event_id: EventId,
        lease_id: LeaseId,
        duration: LeaseDuration,
    ) -> RegistrarResult<LeaseGrant> {
        let mut state = self.write_priority()?;
        let now = self.clock.now_millis();
        check_event_lease(&state.index, &state.expired, &event_id, &lease_id, now)?;
        let duration_ms = state.policy.event_grant(duration)?;
        let expiration = now.saturating_add(duration_ms);
        self.log(&LogRecord::EventLeaseRenewed {
            event_id,
            lease_id,
            expiration,
        })?;

        let earliest = state.index.earliest_event().map(|(e, _)| e);
        state.apply_event_renew(&event_id, expiration);
        wake_if_earlier(&self.event_wake, earliest, expiration);
        self.maybe_request_snapshot(&state);
        Ok(LeaseGrant {
            lease_id,
            expiration,
            duration_ms,
        })
    }

    pub fn cancel_event_lease(&self, event_id: EventId, lease_id: LeaseId) -> RegistrarResult<()> {
        let mut state = self.write()?;
        let now = self.clock.now_millis();
        check_event_lease(&state.index, &state.expired, &event_id, &lease_id, now)?;
        self.log(&LogRecord::EventLeaseCancelled { event_id, lease_id })?;

        state.apply_event_cancel(&event_id);
        self.dispatcher.retire(&event_id);
        self.maybe_request_snapshot(&state);
        debug!(%event_id, "event lease cancelled");
        Ok(())
    }

    pub fn renew_leases(&self, requests: &[(LeaseTarget, LeaseDuration)]) -> Vec<RegistrarResult<LeaseGrant>> {
        requests
            .iter()
            .map(|(target, duration)| match *target {
                LeaseTarget::Service { service_id, lease_id } => self.renew_service_lease(service_id, lease_id, *duration),
                LeaseTarget::Event { event_id, lease_id } => self.renew_event_lease(event_id, lease_id, *duration),
            })
            .collect()
    }

    pub fn cancel_leases(&self, targets: &[LeaseTarget]) -> Vec<RegistrarResult<()>> {
        targets
            .iter()
            .map(|target| match *target {
                LeaseTarget::Service { service_id, lease_id } => self.cancel_service_lease(service_id, lease_id),
                LeaseTarget::Event { event_id, lease_id } => self.cancel_event_lease(event_id, lease_id),
            })
            .collect()
    }

    /// Permanent delivery failure: the subscription goes away.
    fn drop_failed_subscription(&self, event_id: EventId, lease_id: LeaseId) {
        let mut state = self.state.write();
        if self.lifecycle.get() != Lifecycle::Running {
            return;
        }
        if !state.index.event(&event_id).is_some_and(|r| r.lease_id == lease_id) {
            return;
        }
        if let Err(e) = self.log(&LogRecord::EventLeaseCancelled { event_id, lease_id }) {
            error!(%event_id, error = %e, "could not log cancellation of failed subscription");
            return;
        }
        state.apply_event_cancel(&event_id);
        self.dispatcher.retire(&event_id);
        warn!(%event_id, "listener failed permanently; event lease cancelled");
    }

    // ---------------------------------------------------------------------
    // Attributes
    // ---------------------------------------------------------------------

    pub fn add_attributes(&self, service_id: ServiceId, lease_id: LeaseId, attributes: Vec<EntryRep>) -> RegistrarResult<()> {
        for entry in &attributes {
            entry.validate()?;
        }
        let record = LogRecord::AttributesAdded {
            service_id,
            lease_id,
            attributes: attributes.clone(),
        };
        self.edit_attributes(service_id, lease_id, &record, |item, _| item.add_attributes(&attributes))
    }

    pub fn modify_attributes(
        &self,
        service_id: ServiceId,
        lease_id: LeaseId,
        templates: Vec<EntryRep>,
        changes: Vec<Option<EntryRep>>,
    ) -> RegistrarResult<()> {
        validate_modification(&templates, &changes)?;
        let record = LogRecord::AttributesModified {
            service_id,
            lease_id,
            templates: templates.clone(),
            changes: changes.clone(),
        };
        self.edit_attributes(service_id, lease_id, &record, |item, graph| {
            item.modify_attributes(&templates, &changes, graph);
        })
    }

    pub fn set_attributes(&self, service_id: ServiceId, lease_id: LeaseId, attributes: Vec<EntryRep>) -> RegistrarResult<()> {
        for entry in &attributes {
            entry.validate()?;
        }
        let record = LogRecord::AttributesSet {
            service_id,
            lease_id,
            attributes: attributes.clone(),
        };
        self.edit_attributes(service_id, lease_id, &record, |item, _| {
            item.attributes = attributes;
            item.dedup_attributes();
        })
    }

    fn edit_attributes(
        &self,
        service_id: ServiceId,
        lease_id: LeaseId,
        record: &LogRecord,
        edit: impl FnOnce(&mut Item, &TypeGraph),
    ) -> RegistrarResult<()> {
        let mut state = self.write()?;
        let now = self.clock.now_millis();
        check_service_lease(&state.index, &state.expired, &service_id, &lease_id, now)?;
        self.log(record)?;

        let (pre, post) = state
            .apply_attributes(&service_id, edit)
            .ok_or(RegistrarError::NotFound(Missing::Service(service_id)))?;
        let deliveries = state.transitions(service_id, Some(&pre), Some(&post), now);
        self.dispatcher.dispatch(deliveries);
        self.maybe_request_snapshot(&state);
        debug!(%service_id, kind = record.kind(), "attributes updated");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Browsing
    // ---------------------------------------------------------------------

    pub fn entry_classes(&self, template: &Template) -> RegistrarResult<Vec<EntryClassDesc>> {
        template.validate()?;
        let state = self.read()?;
        let now = self.clock.now_millis();
        if *template == Template::any() {
            return Ok(state.index.live_classes(now));
        }
        let mut seen = HashSet::new();
        let mut classes = Vec::new();
        for reg in state.index.matching_items(template, now) {
            for entry in &reg.item.attributes {
                if seen.insert(entry.class_name()) {
                    classes.push(entry.class.clone());
                }
            }
        }
        Ok(classes)
    }

    pub fn field_values(&self, template: &Template, entry_index: usize, field_index: usize) -> RegistrarResult<Vec<FieldValue>> {
        template.validate()?;
        let Some(target) = template.attributes.get(entry_index) else {
            return Err(ValidationError::MissingField {
                field: format!("attributes[{entry_index}]"),
            }
            .into());
        };
        if field_index >= target.class.field_count() {
            return Err(ValidationError::MissingField {
                field: format!("{}[{field_index}]", target.class_name()),
            }
            .into());
        }

        let state = self.read()?;
        let now = self.clock.now_millis();
        let graph = state.index.types();
        let mut values = BTreeSet::new();
        for reg in state.index.matching_items(template, now) {
            for entry in &reg.item.attributes {
                if !entry_matches(entry, target, graph) {
                    continue;
                }
                if let Some(Some(value)) = entry.values.get(field_index) {
                    values.insert(value.clone());
                }
            }
        }
        Ok(values.into_iter().collect())
    }

    pub fn service_types(&self, template: &Template, prefix: &str) -> RegistrarResult<Vec<String>> {
        template.validate()?;
        let state = self.read()?;
        let now = self.clock.now_millis();
        let matches = if template.is_type_only() {
            state.index.matching_services(&template.types, now)
        } else {
            state.index.matching_items(template, now)
        };
        let mut names = BTreeSet::new();
        for reg in matches {
            for name in reg.item.service_type.lineage() {
                if name.starts_with(prefix) {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    // ---------------------------------------------------------------------
    // Admin
    // ---------------------------------------------------------------------

    pub fn update_tunables(&self, tunables: Tunables) -> RegistrarResult<()> {
        tunables.validate()?;
        let mut state = self.write()?;
        self.log(&LogRecord::TunablesChanged {
            tunables: tunables.clone(),
        })?;
        state.apply_tunables(tunables);
        info!(
            max_service_lease_ms = state.policy.max_service_lease(),
            max_event_lease_ms = state.policy.max_event_lease(),
            "tunables updated"
        );
        self.maybe_request_snapshot(&state);
        Ok(())
    }

    pub fn tunables(&self) -> RegistrarResult<Tunables> {
        Ok(self.read()?.policy.tunables().clone())
    }

    /// Counters. Available in every lifecycle state.
    pub fn stats(&self) -> RegistrarStats {
        let state = self.state.read();
        let records_since_snapshot = self.store.lock().as_ref().map_or(0, Store::records_since_snapshot);
        RegistrarStats {
            registrar_id: self.registrar_id,
            lifecycle: self.lifecycle.get(),
            services: state.index.service_count(),
            events: state.index.event_count(),
            entry_classes: state.index.active_classes().count(),
            records_since_snapshot,
            max_service_lease_ms: state.policy.max_service_lease(),
            max_event_lease_ms: state.policy.max_event_lease(),
            dropped_events: self.dispatcher.dropped(),
            delivery_workers: self.dispatcher.worker_count(),
            delivery_mailboxes: self.dispatcher.mailbox_count(),
        }
    }

    /// Deep copy of every live registration.
    pub fn dump(&self) -> RegistrarResult<RegistryDump> {
        let state = self.read()?;
        let mut services: Vec<SvcReg> = state.index.services().cloned().collect();
        services.sort_by_key(SvcReg::expiry_key);
        let mut events: Vec<_> = state.index.events().map(EventReg::record).collect();
        events.sort_by_key(|e| e.event_id);
        Ok(RegistryDump { services, events })
    }

    /// Writes a snapshot now. Returns false for a transient registrar.
    pub fn snapshot(&self) -> RegistrarResult<bool> {
        let state = self.read()?;
        let store = self.store.lock();
        let Some(store) = store.as_ref() else {
            return Ok(false);
        };
        let header = state.snapshot_header(self.clock.now_millis());
        let (services, events) = (header.services, header.events);
        let mut writer = store.begin_snapshot(header)?;
        let write_failed = |e: std::io::Error| RegistrarError::storage(format!("failed to write snapshot: {e}"));
        for reg in state.index.services() {
            writer.write_service(reg).map_err(write_failed)?;
        }
        for reg in state.index.events() {
            writer.write_event(&reg.record()).map_err(write_failed)?;
        }
        store.commit_snapshot(writer)?;
        info!(services, events, "snapshot written");
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------------

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    /// Stops accepting requests, withdraws the export, joins the loops and
    /// closes persistence, in that order. Calling it again is a no-op.
    pub fn destroy(&self) -> RegistrarResult<()> {
        if !self.lifecycle.transition(Lifecycle::Running, Lifecycle::Destroying) {
            return match self.lifecycle.get() {
                Lifecycle::Destroying | Lifecycle::Terminated => Ok(()),
                other => Err(RegistrarError::Unavailable { state: other.as_str() }),
            };
        }
        // Wait out any mutation that passed its lifecycle check already.
        drop(self.state.write_priority());

        if let Some(export) = self.export.lock().take() {
            if !export.unexport(false) {
                warn!("export refused a graceful unexport; forcing it");
                if !export.unexport(true) {
                    warn!("forced unexport failed");
                }
            }
        }

        self.service_wake.shutdown();
        self.event_wake.shutdown();
        self.snapshot_tx.lock().take();

        let mut handles = std::mem::take(&mut *self.threads.lock());
        handles.extend(self.dispatcher.close());
        let current = thread::current().id();
        handles.retain(|h| h.thread().id() != current);
        background::join_with_timeout(handles, Duration::from_millis(self.config.shutdown_timeout_ms));

        let closed = match self.store.lock().take() {
            Some(store) => store.close(),
            None => Ok(()),
        };
        self.lifecycle.set(Lifecycle::Terminated);
        closed
    }
}
