//! Registered service items.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::ids::ServiceId;

use super::entry::EntryRep;
use super::template::entry_matches;
use super::types::{TypeDesc, TypeGraph};

/// Opaque marshalled service proxy. The registry never looks inside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceHandle(pub Vec<u8>);

impl ServiceHandle {
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }
}

/// A service as registered: identity, type lineage, proxy and attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// `None` asks the registrar to assign a fresh ID on first registration.
    pub service_id: Option<ServiceId>,
    pub service_type: TypeDesc,
    pub handle: ServiceHandle,
    pub attributes: Vec<EntryRep>,
}

impl Item {
    #[must_use]
    pub fn new(service_type: TypeDesc, handle: ServiceHandle) -> Self {
        Self {
            service_id: None,
            service_type,
            handle,
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: ServiceId) -> Self {
        self.service_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, entry: EntryRep) -> Self {
        self.attributes.push(entry);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        self.service_type.validate()?;
        for entry in &self.attributes {
            entry.validate()?;
        }
        Ok(())
    }

    /// Drops entries equal to an earlier entry, keeping order.
    pub(crate) fn dedup_attributes(&mut self) {
        let mut kept: Vec<EntryRep> = Vec::with_capacity(self.attributes.len());
        for entry in self.attributes.drain(..) {
            if !kept.iter().any(|k| k.class == entry.class && k.values == entry.values) {
                kept.push(entry);
            }
        }
        self.attributes = kept;
    }

    /// Appends entries, dropping any already present.
    pub(crate) fn add_attributes(&mut self, attributes: &[EntryRep]) {
        self.attributes.extend_from_slice(attributes);
        self.dedup_attributes();
    }

    /// For every template, rewrites each matching entry with the paired
    /// change; a `None` change deletes the matching entries.
    pub(crate) fn modify_attributes(&mut self, templates: &[EntryRep], changes: &[Option<EntryRep>], graph: &TypeGraph) {
        for (template, change) in templates.iter().zip(changes) {
            match change {
                Some(change) => {
                    for entry in &mut self.attributes {
                        if entry_matches(entry, template, graph) {
                            entry.apply_change(change);
                        }
                    }
                }
                None => self.attributes.retain(|entry| !entry_matches(entry, template, graph)),
            }
        }
        self.dedup_attributes();
    }
}

/// Checks a modify request before anything is applied.
pub(crate) fn validate_modification(templates: &[EntryRep], changes: &[Option<EntryRep>]) -> Result<(), ValidationError> {
    if templates.len() != changes.len() {
        return Err(ValidationError::MismatchedAttributeLists {
            templates: templates.len(),
            changes: changes.len(),
        });
    }
    for (template, change) in templates.iter().zip(changes) {
        template.validate()?;
        if let Some(change) = change {
            change.validate()?;
            if change.class != template.class {
                return Err(ValidationError::ChangeClassMismatch {
                    template: template.class_name().to_string(),
                    change: change.class_name().to_string(),
                });
            }
        }
    }
    Ok(())
}
