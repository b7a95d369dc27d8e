//! Error types for svcreg.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! exact failure. Only [`RegistrarError::Unrecoverable`] is fatal to the
//! process; everything else is returned to the caller of a single operation
//! without affecting other in-flight operations.

use thiserror::Error;

use crate::ids::{EventId, LeaseId, ServiceId};

/// Validation errors raised before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Lease duration {millis}ms is negative")]
    NegativeDuration {
        millis: i64,
    },

    #[error("Transition mask {mask:#x} is empty or has unknown bits")]
    InvalidTransitionMask {
        mask: u8,
    },

    #[error("Service ID {id} is reserved")]
    ReservedServiceId {
        id: ServiceId,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Attribute list lengths differ: {templates} templates, {changes} changes")]
    MismatchedAttributeLists {
        templates: usize,
        changes: usize,
    },

    #[error("Entry of class '{class}' carries {actual} fields, class declares {expected}")]
    FieldCountMismatch {
        class: String,
        expected: usize,
        actual: usize,
    },

    #[error("Change for template of class '{template}' has class '{change}'")]
    ChangeClassMismatch {
        template: String,
        change: String,
    },

    #[error("Type '{name}' lists itself as an ancestor")]
    CyclicType {
        name: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// What a `NotFound` error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Service(ServiceId),
    Event(EventId),
}

impl std::fmt::Display for Missing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service(id) => write!(f, "service {id}"),
            Self::Event(id) => write!(f, "event registration {id}"),
        }
    }
}

/// Top-level error type for registrar operations.
#[derive(Debug, Clone, Error)]
pub enum RegistrarError {
    #[error("Not found: {0}")]
    NotFound(Missing),

    #[error("Lease mismatch for {target}: presented {presented}")]
    LeaseMismatch {
        target: Missing,
        presented: LeaseId,
    },

    #[error("Lease {lease} for {target} has expired")]
    LeaseExpired {
        target: Missing,
        lease: LeaseId,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] ValidationError),

    #[error("Unrecoverable persistent state: {reason}")]
    Unrecoverable {
        reason: String,
    },

    #[error("Registrar is {state}, not accepting requests")]
    Unavailable {
        state: &'static str,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },
}

impl RegistrarError {
    /// Creates an unrecoverable (corrupt or version-mismatched state) error.
    #[must_use]
    pub fn unrecoverable(reason: impl Into<String>) -> Self {
        Self::Unrecoverable {
            reason: reason.into(),
        }
    }

    /// Creates a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Returns true if the process cannot continue with this registry.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Unrecoverable { .. })
    }

    /// Returns true if retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }

    /// Returns true if the error is a lease problem (unknown, mismatched or lapsed).
    #[must_use]
    pub const fn is_lease_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::LeaseMismatch { .. } | Self::LeaseExpired { .. }
        )
    }
}

/// Result type alias for registrar operations.
pub type RegistrarResult<T> = Result<T, RegistrarError>;
