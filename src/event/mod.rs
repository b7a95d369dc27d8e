//! Event engine: transition detection and ordered delivery.

pub mod dispatch;
pub mod listener;
pub mod transition;

pub use dispatch::{Delivery, Dispatcher, PermanentFailureHook};
pub use listener::{
    ChannelListener, DeliveryError, ListenerDirectory, ListenerRef, ListenerResolver, NoResolver, RemoteEventListener,
    ServiceEvent,
};

/// Added to every subscription's sequence number after recovery, so no
/// event numbered after the restart can collide with one that was issued
/// before the crash but never replayed.
pub const SEQ_RECOVERY_GAP: u64 = (1 << 31) - 1;
