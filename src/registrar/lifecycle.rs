use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;
use tracing::info;

use crate::error::{RegistrarError, RegistrarResult};

/// Lifecycle of a registrar instance. Only `Running` serves requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Lifecycle {
    Constructing = 0,
    Recovering = 1,
    Running = 2,
    Destroying = 3,
    Terminated = 4,
}

impl Lifecycle {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Constructing => "constructing",
            Self::Recovering => "recovering",
            Self::Running => "running",
            Self::Destroying => "destroying",
            Self::Terminated => "terminated",
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Constructing,
            1 => Self::Recovering,
            2 => Self::Running,
            3 => Self::Destroying,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub(crate) struct LifecycleCell(AtomicU8);

impl LifecycleCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(Lifecycle::Constructing as u8))
    }

    pub fn get(&self) -> Lifecycle {
        Lifecycle::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, next: Lifecycle) {
        let prev = Lifecycle::from_u8(self.0.swap(next as u8, Ordering::SeqCst));
        info!(from = %prev, to = %next, "registrar lifecycle transition");
    }

    /// Moves `from` → `to`; false if the current state is not `from`.
    pub fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        let moved = self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if moved {
            info!(%from, %to, "registrar lifecycle transition");
        }
        moved
    }

    pub fn ensure_running(&self) -> RegistrarResult<()> {
        match self.get() {
            Lifecycle::Running => Ok(()),
            other => Err(RegistrarError::Unavailable { state: other.as_str() }),
        }
    }
}
