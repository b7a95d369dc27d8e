//! In-memory indices over live registrations.
//!
//! Every [`SvcReg`] and [`EventReg`] is stored exactly once, keyed by its
//! ID; all secondary indices hold IDs only. Mutation functions here are
//! pure bookkeeping: lease checks, logging and event generation happen in
//! the registrar, under its write lock.
//!
//! ```text
//!   services ──┬── by expiry    (expiration, lease) → id
//!              ├── by type      declared type       → {id}
//!              ├── by attribute class → field → value → {id}
//!              └── by empty attribute  class        → {id}
//!   events   ──┬── by expiry    (expiration, event id)
//!              └── by service id | wildcard
//! ```

mod classes;
mod iter;

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::trace;

use crate::ids::{EventId, LeaseId, ServiceId};
use crate::model::{EntryClassDesc, EntryRep, EventReg, FieldValue, SvcReg, Template, TypeGraph, TypeIdx, ROOT_TYPE};

pub use classes::EntryClass;
pub use iter::MatchingItems;

use classes::ClassTable;

type ValueIndex = HashMap<Option<FieldValue>, HashSet<ServiceId>>;

/// The multi-index over services and event registrations.
#[derive(Debug, Default)]
pub struct IndexManager {
    types: TypeGraph,
    classes: ClassTable,

    services: HashMap<ServiceId, SvcReg>,
    service_by_expiry: BTreeMap<(i64, LeaseId), ServiceId>,
    /// Keyed by the declared type only; supertype queries walk the graph.
    service_by_type: HashMap<TypeIdx, HashSet<ServiceId>>,
    /// class → one value index per field of the class.
    service_by_attr: HashMap<TypeIdx, Vec<ValueIndex>>,
    service_by_empty_attr: HashMap<TypeIdx, HashSet<ServiceId>>,

    events: HashMap<EventId, EventReg>,
    event_by_expiry: BTreeSet<(i64, EventId)>,
    subscribers_by_service: HashMap<ServiceId, BTreeSet<EventId>>,
    wildcard_subscribers: BTreeSet<EventId>,
}

impl IndexManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn types(&self) -> &TypeGraph {
        &self.types
    }

    #[must_use]
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn service(&self, id: &ServiceId) -> Option<&SvcReg> {
        self.services.get(id)
    }

    #[must_use]
    pub fn event(&self, id: &EventId) -> Option<&EventReg> {
        self.events.get(id)
    }

    pub fn event_mut(&mut self, id: &EventId) -> Option<&mut EventReg> {
        self.events.get_mut(id)
    }

    /// All registrations, in no particular order.
    pub fn services(&self) -> impl Iterator<Item = &SvcReg> {
        self.services.values()
    }

    pub fn events(&self) -> impl Iterator<Item = &EventReg> {
        self.events.values()
    }

    // ---------------------------------------------------------------------
    // Services
    // ---------------------------------------------------------------------

    /// Indexes a registration. Any previous registration under the same ID
    /// must already have been deleted.
    pub fn add_service(&mut self, reg: SvcReg) {
        let id = reg.service_id();
        debug_assert!(!self.services.contains_key(&id), "service {id} indexed twice");

        self.service_by_expiry.insert(reg.expiry_key(), id);

        let type_idx = self.types.intern(&reg.item.service_type);
        self.service_by_type.entry(type_idx).or_default().insert(id);

        self.index_attributes(id, &reg.item.attributes);
        trace!(service_id = %id, "indexed service");
        self.services.insert(id, reg);
    }

    /// Removes a registration from every index.
    pub fn delete_service(&mut self, id: &ServiceId) -> Option<SvcReg> {
        let reg = self.services.remove(id)?;
        self.service_by_expiry.remove(&reg.expiry_key());

        if let Some(t) = self.types.get(&reg.item.service_type.name) {
            if let Some(set) = self.service_by_type.get_mut(&t) {
                set.remove(id);
                if set.is_empty() {
                    self.service_by_type.remove(&t);
                }
            }
        }
        self.unindex_attributes(*id, &reg.item.attributes);
        self.types.release(&reg.item.service_type);
        trace!(service_id = %id, "unindexed service");
        Some(reg)
    }

    /// Moves a service to a new expiration. Returns false if unknown.
    pub fn set_service_expiration(&mut self, id: &ServiceId, expiration: i64) -> bool {
        let Some(reg) = self.services.get_mut(id) else {
            return false;
        };
        self.service_by_expiry.remove(&reg.expiry_key());
        reg.expiration = expiration;
        self.service_by_expiry.insert(reg.expiry_key(), *id);
        true
    }

    /// Replaces a service's attribute set, re-indexing it.
    pub fn replace_attributes(&mut self, id: &ServiceId, attributes: Vec<EntryRep>) -> bool {
        let Some(old) = self.services.get(id).map(|r| r.item.attributes.clone()) else {
            return false;
        };
        self.unindex_attributes(*id, &old);
        self.index_attributes(*id, &attributes);
        if let Some(reg) = self.services.get_mut(id) {
            reg.item.attributes = attributes;
        }
        true
    }

    /// The registration with the earliest expiration.
    #[must_use]
    pub fn earliest_service(&self) -> Option<(i64, ServiceId)> {
        self.service_by_expiry
            .iter()
            .next()
            .map(|((exp, _), id)| (*exp, *id))
    }

    fn index_attributes(&mut self, id: ServiceId, attributes: &[EntryRep]) {
        let mut seen_classes = HashSet::new();
        for entry in attributes {
            let class = self.types.intern(&entry.class.ty);
            if seen_classes.insert(class) {
                self.classes.add_instance(class, &entry.class);
            }
            if entry.is_fieldless() {
                self.service_by_empty_attr.entry(class).or_default().insert(id);
                continue;
            }
            let fields = self.service_by_attr.entry(class).or_default();
            if fields.len() < entry.values.len() {
                fields.resize_with(entry.values.len(), HashMap::new);
            }
            for (field, value) in entry.values.iter().enumerate() {
                fields[field].entry(value.clone()).or_default().insert(id);
            }
        }
    }

    fn unindex_attributes(&mut self, id: ServiceId, attributes: &[EntryRep]) {
        let mut seen_classes = HashSet::new();
        for entry in attributes {
            let Some(class) = self.types.get(entry.class_name()) else {
                continue;
            };
            if seen_classes.insert(class) {
                self.classes.remove_instance(class);
            }
            self.unindex_entry(id, class, entry);
            self.types.release(&entry.class.ty);
        }
    }

    fn unindex_entry(&mut self, id: ServiceId, class: TypeIdx, entry: &EntryRep) {
        if entry.is_fieldless() {
            if let Some(set) = self.service_by_empty_attr.get_mut(&class) {
                set.remove(&id);
                if set.is_empty() {
                    self.service_by_empty_attr.remove(&class);
                }
            }
            return;
        }
        let Some(fields) = self.service_by_attr.get_mut(&class) else {
            return;
        };
        for (field, value) in entry.values.iter().enumerate() {
            let Some(values) = fields.get_mut(field) else {
                continue;
            };
            if let Some(set) = values.get_mut(value) {
                set.remove(&id);
                if set.is_empty() {
                    values.remove(value);
                }
            }
        }
        if fields.iter().all(HashMap::is_empty) {
            self.service_by_attr.remove(&class);
        }
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Lazily yields every live registration matching `template` whose
    /// lease has not lapsed at `now`. Each registration is yielded once.
    #[must_use]
    pub fn matching_items<'a>(&'a self, template: &'a Template, now: i64) -> MatchingItems<'a> {
        MatchingItems::new(self, Cow::Borrowed(template), self.candidates(template), now)
    }

    /// Registrations whose type is assignable to every name in `types`.
    #[must_use]
    pub fn matching_services<'a>(&'a self, types: &'a [String], now: i64) -> MatchingItems<'a> {
        let template = Template {
            types: types.to_vec(),
            ..Template::default()
        };
        MatchingItems::new(self, Cow::Owned(template), self.candidates_by_type(types.first()), now)
    }

    /// Entry classes with at least one live instance.
    pub fn active_classes(&self) -> impl Iterator<Item = &EntryClass> {
        self.classes.active().iter().filter_map(|idx| self.classes.get(*idx))
    }

    /// Distinct entry classes carried by registrations still live at `now`.
    ///
    /// The active list is exact unless a lapsed lease is waiting for the
    /// sweeper; only then are registrations scanned.
    #[must_use]
    pub fn live_classes(&self, now: i64) -> Vec<EntryClassDesc> {
        if self.earliest_service().map_or(true, |(expiration, _)| expiration > now) {
            return self.active_classes().map(|c| c.desc.clone()).collect();
        }
        let mut seen = HashSet::new();
        let mut classes = Vec::new();
        for reg in self.matching_items(&Template::any(), now) {
            for entry in &reg.item.attributes {
                if seen.insert(entry.class_name()) {
                    classes.push(entry.class.clone());
                }
            }
        }
        classes
    }

    /// Picks the cheapest candidate source for a template:
    /// exact ID, then leading type, then a bound attribute field, then the
    /// empty-attribute buckets, then a scan of assignable live classes.
    fn candidates<'a>(&'a self, template: &'a Template) -> Box<dyn Iterator<Item = ServiceId> + 'a> {
        if let Some(id) = template.service_id {
            return Box::new(self.services.contains_key(&id).then_some(id).into_iter());
        }
        if let Some(first) = template.types.first() {
            return self.candidates_by_type(Some(first));
        }
        if template.attributes.is_empty() {
            return Box::new(self.services.keys().copied());
        }

        let bound = template.attributes.iter().find_map(|entry| {
            entry
                .values
                .iter()
                .position(Option::is_some)
                .map(|field| (entry, field))
        });
        if let Some((entry, field)) = bound {
            let value = entry.values[field].clone();
            return Box::new(
                self.assignable_active(entry.class_name())
                    .filter_map(move |class| self.service_by_attr.get(&class))
                    .filter_map(move |fields| fields.get(field))
                    .filter_map(move |values| values.get(&value))
                    .flat_map(|set| set.iter().copied()),
            );
        }

        // No bound field anywhere. Fieldless classes come from the
        // empty-attribute buckets, fielded ones from a scan of their first
        // field; both may repeat IDs.
        let first = &template.attributes[0];
        Box::new(
            self.assignable_active(first.class_name())
                .flat_map(move |class| self.services_with_class(class)),
        )
    }

    fn candidates_by_type<'a>(&'a self, name: Option<&String>) -> Box<dyn Iterator<Item = ServiceId> + 'a> {
        let Some(name) = name.filter(|n| *n != ROOT_TYPE) else {
            return Box::new(self.services.keys().copied());
        };
        let Some(target) = self.types.get(name) else {
            return Box::new(std::iter::empty());
        };
        // Buckets are disjoint, one per declared type.
        Box::new(
            self.service_by_type
                .iter()
                .filter(move |(declared, _)| self.types.is_assignable(**declared, target))
                .flat_map(|(_, set)| set.iter().copied()),
        )
    }

    /// Live classes assignable to the named class.
    fn assignable_active<'a>(&'a self, name: &str) -> Box<dyn Iterator<Item = TypeIdx> + 'a> {
        let Some(target) = self.types.get(name) else {
            return Box::new(std::iter::empty());
        };
        Box::new(
            self.classes
                .active()
                .iter()
                .copied()
                .filter(move |c| self.types.is_assignable(*c, target)),
        )
    }

    /// Services carrying an entry of exactly `class`. May repeat IDs.
    fn services_with_class(&self, class: TypeIdx) -> Box<dyn Iterator<Item = ServiceId> + '_> {
        if let Some(set) = self.service_by_empty_attr.get(&class) {
            return Box::new(set.iter().copied());
        }
        match self.service_by_attr.get(&class).and_then(|fields| fields.first()) {
            Some(values) => Box::new(values.values().flat_map(|set| set.iter().copied())),
            None => Box::new(std::iter::empty()),
        }
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    pub fn add_event(&mut self, reg: EventReg) {
        let id = reg.event_id;
        self.event_by_expiry.insert(reg.expiry_key());
        match reg.template.service_id {
            Some(sid) => {
                self.subscribers_by_service.entry(sid).or_default().insert(id);
            }
            None => {
                self.wildcard_subscribers.insert(id);
            }
        }
        for entry in &reg.template.attributes {
            let class = self.types.intern(&entry.class.ty);
            self.classes.add_template(class, &entry.class);
        }
        self.events.insert(id, reg);
    }

    pub fn delete_event(&mut self, id: &EventId) -> Option<EventReg> {
        let reg = self.events.remove(id)?;
        self.event_by_expiry.remove(&reg.expiry_key());
        match reg.template.service_id {
            Some(sid) => {
                if let Some(set) = self.subscribers_by_service.get_mut(&sid) {
                    set.remove(id);
                    if set.is_empty() {
                        self.subscribers_by_service.remove(&sid);
                    }
                }
            }
            None => {
                self.wildcard_subscribers.remove(id);
            }
        }
        for entry in &reg.template.attributes {
            if let Some(class) = self.types.get(entry.class_name()) {
                self.classes.remove_template(class);
            }
            self.types.release(&entry.class.ty);
        }
        Some(reg)
    }

    pub fn set_event_expiration(&mut self, id: &EventId, expiration: i64) -> bool {
        let Some(reg) = self.events.get_mut(id) else {
            return false;
        };
        self.event_by_expiry.remove(&reg.expiry_key());
        reg.expiration = expiration;
        self.event_by_expiry.insert(reg.expiry_key());
        true
    }

    #[must_use]
    pub fn earliest_event(&self) -> Option<(i64, EventId)> {
        self.event_by_expiry.iter().next().copied()
    }

    /// Event registrations whose template could apply to `service_id`, in
    /// event ID order: direct subscribers first, then wildcards.
    #[must_use]
    pub fn subscribers_for(&self, service_id: &ServiceId) -> Vec<EventId> {
        let direct = self
            .subscribers_by_service
            .get(service_id)
            .into_iter()
            .flat_map(|set| set.iter().copied());
        direct.chain(self.wildcard_subscribers.iter().copied()).collect()
    }

    /// Checks the structural invariants. Test support.
    #[cfg(test)]
    pub(crate) fn verify(&self) -> Result<(), String> {
        if self.service_by_expiry.len() != self.services.len() {
            return Err(format!(
                "expiry set has {} entries for {} services",
                self.service_by_expiry.len(),
                self.services.len()
            ));
        }
        for (key, id) in &self.service_by_expiry {
            match self.services.get(id) {
                Some(reg) if reg.expiry_key() == *key => {}
                _ => return Err(format!("stale expiry entry for {id}")),
            }
        }
        let typed: usize = self.service_by_type.values().map(HashSet::len).sum();
        if typed != self.services.len() {
            return Err(format!("type buckets hold {typed} ids for {} services", self.services.len()));
        }
        for class in self.classes.iter() {
            let carrying = self
                .services
                .values()
                .filter(|r| r.item.attributes.iter().any(|e| e.class_name() == class.desc.name()))
                .count();
            if carrying != class.instances {
                return Err(format!(
                    "class {} counts {} instances, {} services carry it",
                    class.desc.name(),
                    class.instances,
                    carrying
                ));
            }
        }
        if self.event_by_expiry.len() != self.events.len() {
            return Err("event expiry set out of step".to_string());
        }
        let keyed: usize = self.subscribers_by_service.values().map(BTreeSet::len).sum();
        if keyed + self.wildcard_subscribers.len() != self.events.len() {
            return Err("subscription indices out of step".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::listener::ListenerRef;
    use crate::model::{EntryClassDesc, Item, ListenerSlot, ServiceHandle, Transitions, TypeDesc};

    fn location() -> EntryClassDesc {
        EntryClassDesc::new("Location", &["building", "floor"])
    }

    fn reg(ty: &str, attrs: Vec<EntryRep>, expiration: i64) -> SvcReg {
        let mut item = Item::new(TypeDesc::new(ty).extends("Device"), ServiceHandle::new(*b"proxy"))
            .with_id(ServiceId::new());
        item.attributes = attrs;
        SvcReg {
            item,
            lease_id: LeaseId::new(),
            expiration,
        }
    }

    fn ids(iter: MatchingItems<'_>) -> HashSet<ServiceId> {
        iter.map(SvcReg::service_id).collect()
    }

    #[test]
    fn test_add_delete_keeps_invariants() {
        let mut index = IndexManager::new();
        let a = reg("Printer", vec![EntryRep::empty(location()).with("floor", 1)], 100);
        let a_id = a.service_id();
        index.add_service(a);
        index.add_service(reg("Scanner", vec![], 50));
        index.verify().unwrap();
        assert_eq!(index.active_classes().count(), 1);

        index.delete_service(&a_id).unwrap();
        index.verify().unwrap();
        assert_eq!(index.active_classes().count(), 0);
        assert_eq!(index.service_count(), 1);
    }

    #[test]
    fn test_lookup_paths() {
        let mut index = IndexManager::new();
        let a = reg("Printer", vec![EntryRep::empty(location()).with("floor", 1)], 100);
        let b = reg("Printer", vec![EntryRep::empty(location()).with("floor", 2)], 100);
        let c = reg("Scanner", vec![EntryRep::empty(EntryClassDesc::new("Marker", &[]))], 100);
        let (a_id, b_id, c_id) = (a.service_id(), b.service_id(), c.service_id());
        for r in [a, b, c] {
            index.add_service(r);
        }

        let all = Template::any();
        assert_eq!(ids(index.matching_items(&all, 0)).len(), 3);

        let by_id = Template::by_id(b_id);
        assert_eq!(ids(index.matching_items(&by_id, 0)), HashSet::from([b_id]));

        let by_type = Template::by_type("Device");
        assert_eq!(ids(index.matching_items(&by_type, 0)).len(), 3);

        let by_attr = Template::any().with_attribute(EntryRep::empty(location()).with("floor", 1));
        assert_eq!(ids(index.matching_items(&by_attr, 0)), HashSet::from([a_id]));

        let by_empty = Template::any().with_attribute(EntryRep::empty(EntryClassDesc::new("Marker", &[])));
        assert_eq!(ids(index.matching_items(&by_empty, 0)), HashSet::from([c_id]));

        let unbound = Template::any().with_attribute(EntryRep::empty(location()));
        assert_eq!(ids(index.matching_items(&unbound, 0)), HashSet::from([a_id, b_id]));

        let by_root = Template::by_type(ROOT_TYPE);
        assert_eq!(ids(index.matching_items(&by_root, 0)).len(), 3);
    }

    #[test]
    fn test_subclass_entries_found_through_superclass_template() {
        let mut index = IndexManager::new();
        let sub = EntryClassDesc::new("Room", &["building", "floor", "room"]).extends("Location");
        let r = reg("Printer", vec![EntryRep::empty(sub.clone()).with("floor", 3).with("room", "3a")], 100);
        let id = r.service_id();
        index.add_service(r);
        index.add_service(reg("Printer", vec![EntryRep::empty(sub).with("floor", 4)], 100));

        let tmpl = Template::any().with_attribute(EntryRep::empty(location()).with("floor", 3));
        assert_eq!(ids(index.matching_items(&tmpl, 0)), HashSet::from([id]));
    }

    #[test]
    fn test_supertype_learned_later_reaches_existing_items() {
        let mut index = IndexManager::new();
        let typed = |desc: TypeDesc| SvcReg {
            item: Item::new(desc, ServiceHandle::new(*b"p")).with_id(ServiceId::new()),
            lease_id: LeaseId::new(),
            expiration: 100,
        };
        let laser = typed(TypeDesc::new("LaserPrinter").extends("Printer"));
        let laser_id = laser.service_id();
        index.add_service(laser);
        // A later registration reveals that every Printer is also Hardware.
        let printer = typed(TypeDesc::new("Printer").extends("Hardware"));
        let printer_id = printer.service_id();
        index.add_service(printer);

        let tmpl = Template::by_type("Hardware");
        assert_eq!(ids(index.matching_items(&tmpl, 0)), HashSet::from([laser_id, printer_id]));
        assert_eq!(ids(index.matching_services(&tmpl.types, 0)), HashSet::from([laser_id, printer_id]));
        let item = &index.service(&laser_id).unwrap().item;
        assert!(tmpl.matches(item, index.types()));
        index.verify().unwrap();
    }

    #[test]
    fn test_type_names_released_with_last_holder() {
        let mut index = IndexManager::new();
        let marker = EntryRep::empty(EntryClassDesc::new("Marker", &[]));
        let a = reg("Printer", vec![marker.clone()], 100);
        let b = reg("Printer", vec![], 100);
        let (a_id, b_id) = (a.service_id(), b.service_id());
        index.add_service(a);
        index.add_service(b);
        // Printer, Device, Marker.
        assert_eq!(index.types().len(), 3);

        index.delete_service(&a_id).unwrap();
        assert_eq!(index.types().len(), 2);
        index.delete_service(&b_id).unwrap();
        assert!(index.types().is_empty());
        index.verify().unwrap();
    }

    #[test]
    fn test_live_classes_skip_lapsed_leases() {
        let mut index = IndexManager::new();
        index.add_service(reg("Printer", vec![EntryRep::empty(location()).with("floor", 1)], 100));
        let marker = EntryClassDesc::new("Marker", &[]);
        index.add_service(reg("Scanner", vec![EntryRep::empty(marker.clone())], 200));

        assert_eq!(index.live_classes(50).len(), 2);
        // Lapsed but not yet reaped.
        assert_eq!(index.live_classes(150), vec![marker]);
        assert!(index.live_classes(200).is_empty());
    }

    #[test]
    fn test_expired_items_are_skipped() {
        let mut index = IndexManager::new();
        index.add_service(reg("Printer", vec![], 100));
        assert_eq!(index.matching_items(&Template::any(), 99).count(), 1);
        assert_eq!(index.matching_items(&Template::any(), 100).count(), 0);
    }

    #[test]
    fn test_fallback_scan_deduplicates() {
        let mut index = IndexManager::new();
        // Two entries of the same class on one item appear twice in the scan.
        let r = reg(
            "Printer",
            vec![
                EntryRep::empty(location()).with("building", "A").with("floor", 1),
                EntryRep::empty(location()).with("building", "B").with("floor", 1),
            ],
            100,
        );
        index.add_service(r);
        let tmpl = Template::any().with_attribute(EntryRep::empty(location()));
        assert_eq!(index.matching_items(&tmpl, 0).count(), 1);
    }

    #[test]
    fn test_expiration_moves() {
        let mut index = IndexManager::new();
        let r = reg("Printer", vec![], 100);
        let id = r.service_id();
        index.add_service(r);
        index.add_service(reg("Printer", vec![], 200));
        assert_eq!(index.earliest_service(), Some((100, id)));
        assert!(index.set_service_expiration(&id, 300));
        assert_eq!(index.earliest_service().unwrap().0, 200);
        index.verify().unwrap();
    }

    #[test]
    fn test_replace_attributes_reindexes() {
        let mut index = IndexManager::new();
        let r = reg("Printer", vec![EntryRep::empty(location()).with("floor", 1)], 100);
        let id = r.service_id();
        index.add_service(r);
        index.replace_attributes(&id, vec![EntryRep::empty(location()).with("floor", 5)]);

        let old = Template::any().with_attribute(EntryRep::empty(location()).with("floor", 1));
        let new = Template::any().with_attribute(EntryRep::empty(location()).with("floor", 5));
        assert_eq!(index.matching_items(&old, 0).count(), 0);
        assert_eq!(index.matching_items(&new, 0).count(), 1);
        index.verify().unwrap();
    }

    #[test]
    fn test_event_subscription_indices() {
        let mut index = IndexManager::new();
        let sid = ServiceId::new();
        let make = |id: u64, template: Template| EventReg {
            event_id: EventId::new(id),
            lease_id: LeaseId::new(),
            template,
            transitions: Transitions::all(),
            seq_no: 0,
            listener: ListenerSlot::Inert,
            listener_ref: ListenerRef::new("x"),
            handback: None,
            expiration: 1_000,
        };
        index.add_event(make(1, Template::by_id(sid)));
        index.add_event(make(2, Template::any()));
        index.add_event(make(3, Template::by_id(ServiceId::new())));
        index.verify().unwrap();

        assert_eq!(index.subscribers_for(&sid), vec![EventId::new(1), EventId::new(2)]);
        index.delete_event(&EventId::new(1)).unwrap();
        assert_eq!(index.subscribers_for(&sid), vec![EventId::new(2)]);
        index.verify().unwrap();
    }
}
