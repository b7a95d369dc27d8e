//! Rebuilds registry state from a snapshot and the log written after it.

use tracing::info;

use crate::event::listener::ListenerResolver;
use crate::event::SEQ_RECOVERY_GAP;
use crate::ids::EventId;
use crate::persist::{LogRecord, Recovered};

use super::state::{RegistryState, Replayed};

/// What recovery found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RecoverySummary {
    pub services: usize,
    pub events: usize,
    pub records: usize,
    pub skipped: usize,
    pub inert_listeners: usize,
    /// Whether a registrar ID was found on disk.
    pub identity_found: bool,
}

/// Loads `recovered` into an empty `state`, in original order, exactly once.
pub(crate) fn restore(state: &mut RegistryState, recovered: Recovered, resolver: &dyn ListenerResolver) -> RecoverySummary {
    let mut summary = RecoverySummary::default();

    if let Some(snapshot) = recovered.snapshot {
        let header = snapshot.header;
        state.registrar_id = header.registrar_id;
        state.next_event_id = header.next_event_id;
        state.apply_tunables(header.tunables);
        summary.identity_found = true;

        for reg in snapshot.services {
            state.apply_register(reg);
        }
        for record in snapshot.events {
            let reg = RegistryState::restore_event(record, resolver);
            state.apply_event_register(reg);
        }
    }

    for record in recovered.records {
        summary.identity_found |= matches!(record, LogRecord::Identity { .. });
        summary.records += 1;
        if state.replay(record, resolver) == Replayed::Skipped {
            summary.skipped += 1;
        }
    }

    // Events issued before the crash were never logged; jump past them.
    let ids: Vec<EventId> = state.index.events().map(|e| e.event_id).collect();
    for id in &ids {
        if let Some(reg) = state.index.event_mut(id) {
            reg.seq_no = reg.seq_no.saturating_add(SEQ_RECOVERY_GAP);
            if reg.listener.is_inert() {
                summary.inert_listeners += 1;
            }
        }
    }

    summary.services = state.index.service_count();
    summary.events = state.index.event_count();
    info!(
        registrar_id = %state.registrar_id,
        services = summary.services,
        events = summary.events,
        records = summary.records,
        skipped = summary.skipped,
        inert_listeners = summary.inert_listeners,
        "recovered registry state"
    );
    summary
}
