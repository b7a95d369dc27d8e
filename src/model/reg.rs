//! Registration aggregates: leased services and event subscriptions.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::event::listener::{ListenerRef, RemoteEventListener};
use crate::ids::{EventId, LeaseId, ServiceId};

use super::item::Item;
use super::template::Template;

bitflags! {
    /// Item state changes a subscription can ask to hear about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Transitions: u8 {
        /// A matching item stopped matching (or went away).
        const MATCH_NOMATCH = 1;
        /// An item started matching (or appeared).
        const NOMATCH_MATCH = 2;
        /// A matching item changed and still matches.
        const MATCH_MATCH = 4;
    }
}

impl Transitions {
    /// Parses a caller-supplied mask. Empty masks and unknown bits are rejected.
    pub fn from_mask(mask: u8) -> Result<Self, ValidationError> {
        match Self::from_bits(mask) {
            Some(t) if !t.is_empty() => Ok(t),
            _ => Err(ValidationError::InvalidTransitionMask { mask }),
        }
    }

    /// Classifies a (before, after) match pair.
    #[must_use]
    pub fn classify(pre_match: bool, post_match: bool) -> Option<Self> {
        match (pre_match, post_match) {
            (true, false) => Some(Self::MATCH_NOMATCH),
            (false, true) => Some(Self::NOMATCH_MATCH),
            (true, true) => Some(Self::MATCH_MATCH),
            (false, false) => None,
        }
    }
}

/// A leased service registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvcReg {
    pub item: Item,
    pub lease_id: LeaseId,
    /// Absolute expiration, milliseconds since the epoch.
    pub expiration: i64,
}

impl SvcReg {
    /// The registered service ID. Always present on a stored registration.
    #[must_use]
    pub fn service_id(&self) -> ServiceId {
        self.item.service_id.unwrap_or_else(ServiceId::nil)
    }

    /// Ordering key of the expiration set.
    #[must_use]
    pub fn expiry_key(&self) -> (i64, LeaseId) {
        (self.expiration, self.lease_id)
    }
}

/// The listener an event registration delivers to.
#[derive(Clone)]
pub enum ListenerSlot {
    Live(Arc<dyn RemoteEventListener>),
    /// The persisted reference could not be resolved; never fires.
    Inert,
}

impl ListenerSlot {
    #[must_use]
    pub fn is_inert(&self) -> bool {
        matches!(self, Self::Inert)
    }
}

impl fmt::Debug for ListenerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live(l) => write!(f, "Live({:?})", l.listener_ref()),
            Self::Inert => write!(f, "Inert"),
        }
    }
}

/// A leased event subscription.
#[derive(Debug, Clone)]
pub struct EventReg {
    pub event_id: EventId,
    pub lease_id: LeaseId,
    pub template: Template,
    pub transitions: Transitions,
    /// Sequence number of the last event generated for this registration.
    pub seq_no: u64,
    pub listener: ListenerSlot,
    pub listener_ref: ListenerRef,
    pub handback: Option<Vec<u8>>,
    pub expiration: i64,
}

impl EventReg {
    #[must_use]
    pub fn expiry_key(&self) -> (i64, EventId) {
        (self.expiration, self.event_id)
    }

    #[must_use]
    pub fn record(&self) -> EventRegRecord {
        EventRegRecord {
            event_id: self.event_id,
            lease_id: self.lease_id,
            template: self.template.clone(),
            transitions: self.transitions,
            seq_no: self.seq_no,
            listener_ref: self.listener_ref.clone(),
            handback: self.handback.clone(),
            expiration: self.expiration,
        }
    }
}

impl PartialEq for EventReg {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
            && self.transitions == other.transitions
            && self.lease_id == other.lease_id
            && self.handback == other.handback
    }
}

impl Eq for EventReg {}

/// Persisted form of an [`EventReg`]; the listener travels as a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRegRecord {
    pub event_id: EventId,
    pub lease_id: LeaseId,
    pub template: Template,
    pub transitions: Transitions,
    pub seq_no: u64,
    pub listener_ref: ListenerRef,
    pub handback: Option<Vec<u8>>,
    pub expiration: i64,
}

impl EventRegRecord {
    /// Rebuilds a live registration around an already-resolved listener slot.
    #[must_use]
    pub fn into_reg(self, listener: ListenerSlot) -> EventReg {
        EventReg {
            event_id: self.event_id,
            lease_id: self.lease_id,
            template: self.template,
            transitions: self.transitions,
            seq_no: self.seq_no,
            listener,
            listener_ref: self.listener_ref,
            handback: self.handback,
            expiration: self.expiration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_parsing() {
        assert_eq!(Transitions::from_mask(1).unwrap(), Transitions::MATCH_NOMATCH);
        assert_eq!(Transitions::from_mask(7).unwrap(), Transitions::all());
        assert!(Transitions::from_mask(0).is_err());
        assert!(Transitions::from_mask(8).is_err());
    }

    #[test]
    fn test_classify() {
        assert_eq!(Transitions::classify(true, false), Some(Transitions::MATCH_NOMATCH));
        assert_eq!(Transitions::classify(false, true), Some(Transitions::NOMATCH_MATCH));
        assert_eq!(Transitions::classify(true, true), Some(Transitions::MATCH_MATCH));
        assert_eq!(Transitions::classify(false, false), None);
    }

    #[test]
    fn test_event_reg_identity_ignores_expiration() {
        let reg = EventRegRecord {
            event_id: EventId::new(1),
            lease_id: LeaseId::new(),
            template: Template::any(),
            transitions: Transitions::all(),
            seq_no: 0,
            listener_ref: ListenerRef::new("l"),
            handback: None,
            expiration: 10,
        }
        .into_reg(ListenerSlot::Inert);
        let mut later = reg.clone();
        later.expiration = 99;
        later.seq_no = 4;
        assert_eq!(reg, later);
    }
}
