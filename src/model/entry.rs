//! Attribute entries attached to registered items.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

use super::types::TypeDesc;

/// Value of one entry field.
///
/// Values are compared for exact equality and hashed into the attribute
/// index, so only types with a total equality are admitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// Class of an entry: its type lineage plus declared field names.
///
/// Fields are ordered with inherited fields first, so a subclass entry can
/// be compared field-by-field against a template of any ancestor class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryClassDesc {
    pub ty: TypeDesc,
    pub fields: Vec<String>,
}

impl EntryClassDesc {
    #[must_use]
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            ty: TypeDesc::new(name),
            fields: fields.iter().map(|f| (*f).to_string()).collect(),
        }
    }

    #[must_use]
    pub fn extends(mut self, ancestor: impl Into<String>) -> Self {
        self.ty = self.ty.extends(ancestor);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.ty.name
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// A structured attribute instance.
///
/// When used inside a template, `None` fields are wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryRep {
    pub class: EntryClassDesc,
    pub values: Vec<Option<FieldValue>>,
    /// Where the entry's class can be loaded from. Never compared.
    pub codebase: Option<String>,
}

impl EntryRep {
    /// An entry with every field unset.
    #[must_use]
    pub fn empty(class: EntryClassDesc) -> Self {
        let values = vec![None; class.field_count()];
        Self {
            class,
            values,
            codebase: None,
        }
    }

    /// Sets a field by name. Unknown names are ignored.
    #[must_use]
    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        if let Some(pos) = self.class.fields.iter().position(|f| f == field) {
            self.values[pos] = Some(value.into());
        }
        self
    }

    #[must_use]
    pub fn with_codebase(mut self, codebase: impl Into<String>) -> Self {
        self.codebase = Some(codebase.into());
        self
    }

    #[must_use]
    pub fn class_name(&self) -> &str {
        self.class.name()
    }

    /// True if the entry has no fields at all (not merely unset ones).
    #[must_use]
    pub fn is_fieldless(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        self.class.ty.validate()?;
        if self.values.len() != self.class.field_count() {
            return Err(ValidationError::FieldCountMismatch {
                class: self.class.name().to_string(),
                expected: self.class.field_count(),
                actual: self.values.len(),
            });
        }
        Ok(())
    }

    /// Field-wise match of this entry against a template of an assignable class.
    ///
    /// Only the template's own fields are compared; subclass fields beyond
    /// them are ignored. Unset template fields match anything.
    #[must_use]
    pub fn fields_match(&self, template: &EntryRep) -> bool {
        if template.values.len() > self.values.len() {
            return false;
        }
        template
            .values
            .iter()
            .zip(&self.values)
            .all(|(t, v)| t.is_none() || t == v)
    }

    /// Overwrites fields with the set fields of `change`.
    pub(crate) fn apply_change(&mut self, change: &EntryRep) {
        for (slot, value) in self.values.iter_mut().zip(&change.values) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
    }
}
