//! Value and aggregate types of the registry plus their matching predicates.

pub mod entry;
pub mod item;
pub mod reg;
pub mod template;
pub mod types;

pub use entry::{EntryClassDesc, EntryRep, FieldValue};
pub use item::{Item, ServiceHandle};
pub use reg::{EventReg, EventRegRecord, ListenerSlot, SvcReg, Transitions};
pub use template::{entry_matches, Template};
pub use types::{TypeDesc, TypeGraph, TypeIdx, ROOT_TYPE};
