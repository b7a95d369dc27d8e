//! Canonical entry-class records and the distinct-active-class list.

use std::collections::HashMap;

use crate::model::{EntryClassDesc, TypeIdx};

/// Bookkeeping for one distinct entry class.
#[derive(Debug, Clone)]
pub struct EntryClass {
    pub desc: EntryClassDesc,
    pub idx: TypeIdx,
    /// Services carrying at least one entry of exactly this class.
    pub instances: usize,
    /// Event templates referencing this class.
    pub templates: usize,
}

/// All entry classes known to the index plus the subset with live instances.
#[derive(Debug, Default)]
pub(crate) struct ClassTable {
    classes: HashMap<TypeIdx, EntryClass>,
    /// Classes with `instances > 0`, in order of first appearance.
    active: Vec<TypeIdx>,
}

impl ClassTable {
    pub fn get(&self, idx: TypeIdx) -> Option<&EntryClass> {
        self.classes.get(&idx)
    }

    pub fn active(&self) -> &[TypeIdx] {
        &self.active
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntryClass> {
        self.classes.values()
    }

    fn entry(&mut self, idx: TypeIdx, desc: &EntryClassDesc) -> &mut EntryClass {
        self.classes.entry(idx).or_insert_with(|| EntryClass {
            desc: desc.clone(),
            idx,
            instances: 0,
            templates: 0,
        })
    }

    pub fn add_instance(&mut self, idx: TypeIdx, desc: &EntryClassDesc) {
        let class = self.entry(idx, desc);
        class.instances += 1;
        if class.instances == 1 {
            self.active.push(idx);
        }
    }

    pub fn remove_instance(&mut self, idx: TypeIdx) {
        let Some(class) = self.classes.get_mut(&idx) else {
            return;
        };
        class.instances = class.instances.saturating_sub(1);
        if class.instances == 0 {
            if let Some(pos) = self.active.iter().position(|a| *a == idx) {
                self.active.remove(pos);
            }
            self.release_if_unused(idx);
        }
    }

    pub fn add_template(&mut self, idx: TypeIdx, desc: &EntryClassDesc) {
        self.entry(idx, desc).templates += 1;
    }

    pub fn remove_template(&mut self, idx: TypeIdx) {
        if let Some(class) = self.classes.get_mut(&idx) {
            class.templates = class.templates.saturating_sub(1);
        }
        self.release_if_unused(idx);
    }

    fn release_if_unused(&mut self, idx: TypeIdx) {
        if self
            .classes
            .get(&idx)
            .is_some_and(|c| c.instances == 0 && c.templates == 0)
        {
            self.classes.remove(&idx);
        }
    }
}
