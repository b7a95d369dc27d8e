//! # svcreg - a crash-recoverable service registry
//!
//! Services register an item (a typed handle plus attribute entries) under
//! a renewable lease. Clients look items up by ID, type and attribute
//! templates, and subscribe to ordered change events. All state survives a
//! restart through an operation log plus periodic snapshots.
//!
//! ## Core Concepts
//!
//! - **Item**: a service's ID, type lineage, opaque handle and attribute entries
//! - **Template**: a query; absent parts are wildcards
//! - **Lease**: a time-bounded grant keeping a registration alive until it lapses
//! - **Transition**: absent→match, match→absent or match→match, as seen by one subscription
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use svcreg::{
//!     ChannelListener, EntryClassDesc, EntryRep, Item, LeaseDuration, Registrar, RegistrarConfig,
//!     ServiceHandle, Template, Transitions, TypeDesc,
//! };
//!
//! let registrar = Registrar::open(RegistrarConfig::transient())?;
//!
//! let (listener, events) = ChannelListener::new("printer-watch");
//! registrar.notify(Template::by_type("Printer"), Transitions::all(), listener, None, LeaseDuration::Any)?;
//!
//! let floor = EntryRep::empty(EntryClassDesc::new("Location", &["floor"])).with("floor", 3);
//! let item = Item::new(TypeDesc::new("Printer"), ServiceHandle::new(*b"lp0")).with_attribute(floor);
//! let reg = registrar.register(item, LeaseDuration::Millis(60_000))?;
//!
//! let event = events.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
//! assert_eq!(event.service_id, reg.service_id);
//! assert_eq!(event.transition, Transitions::NOMATCH_MATCH);
//! registrar.destroy()?;
//! # Ok::<(), svcreg::RegistrarError>(())
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Values and identity
pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod model;

// Registry machinery
pub mod event;
pub mod index;
pub mod lease;
pub mod persist;
pub mod registrar;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RegistrarConfig, Tunables};
pub use error::{Missing, RegistrarError, RegistrarResult, ValidationError};
pub use event::{
    ChannelListener, DeliveryError, ListenerDirectory, ListenerRef, ListenerResolver, NoResolver, RemoteEventListener,
    ServiceEvent, SEQ_RECOVERY_GAP,
};
pub use ids::{EventId, LeaseId, ServiceId};
pub use index::IndexManager;
pub use lease::{LeaseDuration, LeaseGrant, LeaseTarget};
pub use model::{EntryClassDesc, EntryRep, FieldValue, Item, ServiceHandle, Template, Transitions, TypeDesc};
pub use registrar::{
    EventRegistration, Lifecycle, LookupMatches, Registrar, RegistrarBuilder, RegistrarStats, RegistryDump,
    RemoteExport, ServiceRegistration,
};
