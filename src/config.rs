//! Registrar configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. [`Tunables`] are additionally persisted with the registry
//! state and may be changed at runtime.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Lease and snapshot parameters that travel with the persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Floor of the dynamic maximum service lease.
    pub min_max_service_lease_ms: i64,
    /// Floor of the dynamic maximum event lease.
    pub min_max_event_lease_ms: i64,
    /// Renewal rate budget: all leases together should not need renewing
    /// more often than once per this interval.
    pub min_renewal_interval_ms: i64,
    /// Log records per live entity required before a snapshot is taken.
    pub snapshot_weight: f32,
    /// Minimum log records before a snapshot is considered.
    pub log_to_snapshot_threshold: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            min_max_service_lease_ms: 5 * 60 * 1000,
            min_max_event_lease_ms: 30 * 60 * 1000,
            min_renewal_interval_ms: 100,
            snapshot_weight: 10.0,
            log_to_snapshot_threshold: 200,
        }
    }
}

impl Tunables {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: String| Err(ValidationError::InvalidConfig { reason });
        if self.min_max_service_lease_ms <= 0 {
            return invalid(format!(
                "min_max_service_lease_ms must be positive (got {})",
                self.min_max_service_lease_ms
            ));
        }
        if self.min_max_event_lease_ms <= 0 {
            return invalid(format!(
                "min_max_event_lease_ms must be positive (got {})",
                self.min_max_event_lease_ms
            ));
        }
        if self.min_renewal_interval_ms < 0 {
            return invalid(format!(
                "min_renewal_interval_ms must not be negative (got {})",
                self.min_renewal_interval_ms
            ));
        }
        if !(self.snapshot_weight.is_finite() && self.snapshot_weight >= 0.0) {
            return invalid(format!("snapshot_weight must be finite and >= 0 (got {})", self.snapshot_weight));
        }
        Ok(())
    }
}

/// Configuration for a registrar instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// Directory holding the log and snapshot. `None` runs purely in memory.
    pub persistence_dir: Option<PathBuf>,
    /// Whether to fsync after every log append (slower but safer).
    pub sync_on_write: bool,
    /// Upper bound on joining background loops during shutdown.
    pub shutdown_timeout_ms: u64,
    /// How many reaped leases to remember for `LeaseExpired` reporting.
    pub expired_lease_memory: usize,
    /// Per-subscriber queue capacity before events are dropped.
    pub delivery_queue_capacity: usize,
    /// Threads shared by all subscriptions for listener calls.
    pub delivery_workers: usize,
    pub tunables: Tunables,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            persistence_dir: None,
            sync_on_write: true,
            shutdown_timeout_ms: 5_000,
            expired_lease_memory: 1024,
            delivery_queue_capacity: 1024,
            delivery_workers: 4,
            tunables: Tunables::default(),
        }
    }
}

impl RegistrarConfig {
    /// In-memory configuration with default tunables.
    #[must_use]
    pub fn transient() -> Self {
        Self::default()
    }

    /// Persistent configuration rooted at `dir`.
    #[must_use]
    pub fn persistent(dir: impl AsRef<Path>) -> Self {
        Self {
            persistence_dir: Some(dir.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Parses a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ValidationError> {
        let cfg: Self = toml::from_str(text).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("invalid TOML: {e}"),
        })?;
        cfg.validate()
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(self) -> Result<Self, ValidationError> {
        self.tunables.validate()?;
        if self.expired_lease_memory == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "expired_lease_memory must be at least 1".to_string(),
            });
        }
        if self.delivery_queue_capacity == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "delivery_queue_capacity must be at least 1".to_string(),
            });
        }
        if self.delivery_workers == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "delivery_workers must be at least 1".to_string(),
            });
        }
        Ok(self)
    }
}
