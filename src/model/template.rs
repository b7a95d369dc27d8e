//! Lookup templates and the item-matching predicate.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::ids::ServiceId;

use super::entry::EntryRep;
use super::item::Item;
use super::types::TypeGraph;

/// Query filter over registered items. Absent parts are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub service_id: Option<ServiceId>,
    /// Type names the item's concrete type must be assignable to.
    pub types: Vec<String>,
    /// Every template entry must be matched by at least one item entry.
    pub attributes: Vec<EntryRep>,
}

impl Template {
    /// The match-everything template.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn by_id(id: ServiceId) -> Self {
        Self {
            service_id: Some(id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn by_type(name: impl Into<String>) -> Self {
        Self {
            types: vec![name.into()],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_type(mut self, name: impl Into<String>) -> Self {
        self.types.push(name.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, entry: EntryRep) -> Self {
        self.attributes.push(entry);
        self
    }

    /// True if the template constrains by type and nothing else.
    #[must_use]
    pub fn is_type_only(&self) -> bool {
        self.service_id.is_none() && !self.types.is_empty() && self.attributes.is_empty()
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        for entry in &self.attributes {
            entry.validate()?;
        }
        Ok(())
    }

    /// The full match predicate.
    #[must_use]
    pub fn matches(&self, item: &Item, graph: &TypeGraph) -> bool {
        if let Some(id) = self.service_id {
            if item.service_id != Some(id) {
                return false;
            }
        }
        if !self.types.iter().all(|t| graph.is_assignable_desc(&item.service_type, t)) {
            return false;
        }
        self.attributes
            .iter()
            .all(|tmpl| item.attributes.iter().any(|entry| entry_matches(entry, tmpl, graph)))
    }
}

/// True if `entry` is of a class assignable to the template's class and
/// agrees with every set template field.
#[must_use]
pub fn entry_matches(entry: &EntryRep, template: &EntryRep, graph: &TypeGraph) -> bool {
    graph.is_assignable_desc(&entry.class.ty, template.class_name()) && entry.fields_match(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entry::EntryClassDesc;
    use crate::model::item::ServiceHandle;
    use crate::model::types::TypeDesc;

    fn setup() -> (TypeGraph, Item) {
        let mut graph = TypeGraph::new();
        let ty = TypeDesc::new("LaserPrinter").extends("Printer");
        let class = EntryClassDesc::new("Location", &["floor"]);
        graph.intern(&ty);
        graph.intern(&class.ty);
        let item = Item::new(ty, ServiceHandle::default())
            .with_id(ServiceId::new())
            .with_attribute(EntryRep::empty(class).with("floor", 2));
        (graph, item)
    }

    #[test]
    fn test_empty_template_matches() {
        let (graph, item) = setup();
        assert!(Template::any().matches(&item, &graph));
    }

    #[test]
    fn test_type_constraint() {
        let (graph, item) = setup();
        assert!(Template::by_type("Printer").matches(&item, &graph));
        assert!(!Template::by_type("Scanner").matches(&item, &graph));
        assert!(Template::by_type("Printer").is_type_only());
    }

    #[test]
    fn test_attribute_constraint() {
        let (graph, item) = setup();
        let class = EntryClassDesc::new("Location", &["floor"]);
        let hit = Template::any().with_attribute(EntryRep::empty(class.clone()).with("floor", 2));
        let miss = Template::any().with_attribute(EntryRep::empty(class).with("floor", 9));
        assert!(hit.matches(&item, &graph));
        assert!(!miss.matches(&item, &graph));
    }

    #[test]
    fn test_service_id_constraint() {
        let (graph, item) = setup();
        assert!(!Template::by_id(ServiceId::new()).matches(&item, &graph));
        assert!(Template::by_id(item.service_id.unwrap()).matches(&item, &graph));
    }
}
