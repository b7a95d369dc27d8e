//! Transition detection.
//!
//! Runs inside the write-lock critical section that changed an item, so
//! sequence numbers are stamped in the same order the changes happened.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use crate::ids::ServiceId;
use crate::index::IndexManager;
use crate::model::{Item, ListenerSlot, Transitions};

use super::dispatch::Delivery;
use super::listener::ServiceEvent;

/// Compares an item's pre- and post-state against every subscription that
/// could apply to it, bumps the sequence number of each subscription that
/// asked for the observed transition, and returns the deliveries to queue.
///
/// Subscriptions whose lease has lapsed at `now` or whose listener is inert
/// generate nothing.
pub fn generate(
    index: &mut IndexManager,
    source: ServiceId,
    service_id: ServiceId,
    pre: Option<&Item>,
    post: Option<&Item>,
    now: i64,
) -> Vec<Delivery> {
    let hits: Vec<_> = index
        .subscribers_for(&service_id)
        .into_iter()
        .filter_map(|event_id| {
            let reg = index.event(&event_id)?;
            if reg.expiration <= now || reg.listener.is_inert() {
                return None;
            }
            let types = index.types();
            let before = pre.is_some_and(|item| reg.template.matches(item, types));
            let after = post.is_some_and(|item| reg.template.matches(item, types));
            let transition = Transitions::classify(before, after)?;
            reg.transitions.contains(transition).then_some((event_id, transition))
        })
        .collect();

    if hits.is_empty() {
        return Vec::new();
    }

    let generated_at = Utc.timestamp_millis_opt(now).single().unwrap_or_else(Utc::now);
    let mut deliveries = Vec::with_capacity(hits.len());
    for (event_id, transition) in hits {
        let Some(reg) = index.event_mut(&event_id) else {
            continue;
        };
        reg.seq_no += 1;
        let ListenerSlot::Live(listener) = &reg.listener else {
            continue;
        };
        deliveries.push(Delivery {
            listener: Arc::clone(listener),
            lease_id: reg.lease_id,
            event: ServiceEvent {
                source,
                event_id,
                seq_no: reg.seq_no,
                service_id,
                transition,
                item: post.cloned(),
                handback: reg.handback.clone(),
                generated_at,
            },
        });
    }
    deliveries
}
