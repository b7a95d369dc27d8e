//! Type descriptors and the assignability graph.
//!
//! Service types and entry classes are described by name plus their full
//! ancestor chain (supertypes and interfaces, flattened). The registry
//! interns every distinct name once into a [`TypeGraph`] whose nodes carry a
//! precomputed ancestor set, so "is `a` assignable to `b`" is a hash lookup.
//!
//! Names are reference counted: every live registration holds its lineage,
//! and a name nobody holds any more is dropped from the graph.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ValidationError;

/// Name of the root type every service type is implicitly assignable to.
pub const ROOT_TYPE: &str = "Object";

/// A named type with its flattened ancestor chain.
///
/// The chain lists supertypes nearest-first; it never includes `name`
/// itself and need not include [`ROOT_TYPE`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDesc {
    pub name: String,
    pub ancestors: Vec<String>,
}

impl TypeDesc {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ancestors: Vec::new(),
        }
    }

    /// Adds a supertype or interface to the chain.
    #[must_use]
    pub fn extends(mut self, ancestor: impl Into<String>) -> Self {
        self.ancestors.push(ancestor.into());
        self
    }

    /// The name followed by every ancestor name.
    pub fn lineage(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.ancestors.iter().map(String::as_str))
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::MissingField {
                field: "type name".to_string(),
            });
        }
        if self.ancestors.iter().any(|a| a == &self.name) {
            return Err(ValidationError::CyclicType {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// Interned handle of a type in a [`TypeGraph`]. Handles of released
/// names are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeIdx(u32);

impl TypeIdx {
    const fn slot(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct TypeNode {
    name: String,
    /// Every type this one is assignable to, itself included.
    ancestors: HashSet<TypeIdx>,
    /// Lineage mentions held by live registrations and templates.
    refs: usize,
}

/// Directed graph of every type name currently in use.
#[derive(Debug, Default)]
pub struct TypeGraph {
    by_name: HashMap<String, TypeIdx>,
    nodes: Vec<Option<TypeNode>>,
    free: Vec<TypeIdx>,
}

impl TypeGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct type names interned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Looks up the interned handle of a name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<TypeIdx> {
        self.by_name.get(name).copied()
    }

    fn node(&self, idx: TypeIdx) -> Option<&TypeNode> {
        self.nodes.get(idx.slot()).and_then(Option::as_ref)
    }

    /// Interns a descriptor, taking one reference on every name in its
    /// lineage, and returns the handle of its own name.
    ///
    /// A later descriptor for a known name may add ancestors. They are
    /// propagated to every type that already reaches that name, so
    /// assignability stays transitive.
    pub fn intern(&mut self, desc: &TypeDesc) -> TypeIdx {
        let idx = self.acquire(&desc.name);
        let mut grown = HashSet::new();
        for ancestor in &desc.ancestors {
            let a = self.acquire(ancestor);
            if let Some(node) = self.node(a) {
                grown.extend(node.ancestors.iter().copied());
            }
        }
        if let Some(node) = self.node(idx) {
            grown.retain(|t| !node.ancestors.contains(t));
        }
        if !grown.is_empty() {
            let mut reached = 0usize;
            for node in self.nodes.iter_mut().flatten() {
                if node.ancestors.contains(&idx) {
                    node.ancestors.extend(grown.iter().copied());
                    reached += 1;
                }
            }
            debug!(type_name = %desc.name, added = grown.len(), reached, "extended type lineage");
        }
        idx
    }

    /// Gives back the references [`TypeGraph::intern`] took for `desc`.
    /// Names left without references are removed.
    pub fn release(&mut self, desc: &TypeDesc) {
        for name in desc.lineage() {
            let Some(idx) = self.get(name) else {
                continue;
            };
            let Some(node) = self.nodes.get_mut(idx.slot()).and_then(Option::as_mut) else {
                continue;
            };
            node.refs = node.refs.saturating_sub(1);
            if node.refs == 0 {
                self.remove(idx);
            }
        }
    }

    fn acquire(&mut self, name: &str) -> TypeIdx {
        if let Some(idx) = self.get(name) {
            if let Some(node) = self.nodes.get_mut(idx.slot()).and_then(Option::as_mut) {
                node.refs += 1;
            }
            return idx;
        }
        let idx = self
            .free
            .pop()
            .unwrap_or_else(|| TypeIdx(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX)));
        let node = TypeNode {
            name: name.to_string(),
            ancestors: HashSet::from([idx]),
            refs: 1,
        };
        if idx.slot() < self.nodes.len() {
            self.nodes[idx.slot()] = Some(node);
        } else {
            self.nodes.push(Some(node));
        }
        self.by_name.insert(name.to_string(), idx);
        idx
    }

    fn remove(&mut self, idx: TypeIdx) {
        let Some(node) = self.nodes.get_mut(idx.slot()).and_then(Option::take) else {
            return;
        };
        self.by_name.remove(&node.name);
        for other in self.nodes.iter_mut().flatten() {
            other.ancestors.remove(&idx);
        }
        self.free.push(idx);
    }

    /// True if a value of type `sub` may be used where `sup` is required.
    #[must_use]
    pub fn is_assignable(&self, sub: TypeIdx, sup: TypeIdx) -> bool {
        self.node(sub).is_some_and(|n| n.ancestors.contains(&sup))
    }

    /// Name-based assignability. Unknown names are never assignable,
    /// except that everything is assignable to [`ROOT_TYPE`].
    #[must_use]
    pub fn is_assignable_name(&self, sub: &str, sup: &str) -> bool {
        if sup == ROOT_TYPE || sub == sup {
            return true;
        }
        match (self.get(sub), self.get(sup)) {
            (Some(a), Some(b)) => self.is_assignable(a, b),
            _ => false,
        }
    }

    /// Assignability of a described type: through any name in its own
    /// lineage, so a descriptor still answers after the graph let go of it.
    #[must_use]
    pub fn is_assignable_desc(&self, desc: &TypeDesc, sup: &str) -> bool {
        desc.lineage().any(|name| self.is_assignable_name(name, sup))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignable_through_chain() {
        let mut graph = TypeGraph::new();
        let printer = graph.intern(&TypeDesc::new("LaserPrinter").extends("Printer").extends("Device"));
        let device = graph.get("Device").unwrap();
        assert!(graph.is_assignable(printer, device));
        assert!(!graph.is_assignable(device, printer));
        assert!(graph.is_assignable_name("LaserPrinter", "Printer"));
        assert!(graph.is_assignable_name("Printer", ROOT_TYPE));
    }

    #[test]
    fn test_unknown_names_not_assignable() {
        let graph = TypeGraph::new();
        assert!(!graph.is_assignable_name("A", "B"));
        assert!(graph.is_assignable_name("A", "A"));
    }

    #[test]
    fn test_later_descriptor_extends_closure() {
        let mut graph = TypeGraph::new();
        graph.intern(&TypeDesc::new("Scanner").extends("Device"));
        let mfp = graph.intern(&TypeDesc::new("Mfp").extends("Printer"));
        // The second sighting adds Scanner, and with it Scanner's ancestors.
        graph.intern(&TypeDesc::new("Mfp").extends("Scanner"));
        assert!(graph.is_assignable(mfp, graph.get("Device").unwrap()));
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_new_ancestors_reach_descendants() {
        let mut graph = TypeGraph::new();
        let laser = graph.intern(&TypeDesc::new("LaserPrinter").extends("Printer"));
        graph.intern(&TypeDesc::new("Printer").extends("Device"));
        assert!(graph.is_assignable(laser, graph.get("Device").unwrap()));
        assert!(graph.is_assignable_name("LaserPrinter", "Device"));
    }

    #[test]
    fn test_released_names_are_dropped() {
        let mut graph = TypeGraph::new();
        let printer = TypeDesc::new("LaserPrinter").extends("Printer");
        graph.intern(&printer);
        graph.intern(&printer);
        graph.intern(&TypeDesc::new("Printer"));
        assert_eq!(graph.len(), 2);

        graph.release(&printer);
        assert_eq!(graph.len(), 2);
        graph.release(&printer);
        assert_eq!(graph.len(), 1);
        assert!(graph.get("LaserPrinter").is_none());

        // The freed handle is reused without inheriting old ancestors.
        let scanner = graph.intern(&TypeDesc::new("Scanner"));
        assert!(!graph.is_assignable(scanner, graph.get("Printer").unwrap()));
        assert!(graph.is_assignable_desc(&printer, "Printer"));

        graph.release(&TypeDesc::new("Printer"));
        graph.release(&TypeDesc::new("Scanner"));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_validate_rejects_self_ancestor() {
        let desc = TypeDesc::new("Loop").extends("Loop");
        assert!(matches!(desc.validate(), Err(ValidationError::CyclicType { .. })));
        assert!(TypeDesc::new("").validate().is_err());
    }
}
