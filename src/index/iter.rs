use std::borrow::Cow;
use std::collections::HashSet;

use crate::ids::ServiceId;
use crate::model::{SvcReg, Template};

use super::IndexManager;

/// Lazy iterator over registrations matching a template.
///
/// Candidates come from whichever index the template selects and are then
/// filtered by the full match predicate and by lease expiry. Candidate
/// sources may repeat an ID; each registration is yielded at most once.
pub struct MatchingItems<'a> {
    index: &'a IndexManager,
    template: Cow<'a, Template>,
    candidates: Box<dyn Iterator<Item = ServiceId> + 'a>,
    seen: HashSet<ServiceId>,
    now: i64,
}

impl<'a> MatchingItems<'a> {
    pub(super) fn new(
        index: &'a IndexManager,
        template: Cow<'a, Template>,
        candidates: Box<dyn Iterator<Item = ServiceId> + 'a>,
        now: i64,
    ) -> Self {
        Self {
            index,
            template,
            candidates,
            seen: HashSet::new(),
            now,
        }
    }
}

impl<'a> Iterator for MatchingItems<'a> {
    type Item = &'a SvcReg;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.candidates.next()?;
            if !self.seen.insert(id) {
                continue;
            }
            let Some(reg) = self.index.services.get(&id) else {
                continue;
            };
            if reg.expiration <= self.now {
                continue;
            }
            if self.template.matches(&reg.item, &self.index.types) {
                return Some(reg);
            }
        }
    }
}
