//! Lease duration policy.
//!
//! The maximum grantable lease grows with the number of registrations so
//! that, with every holder renewing at the maximum, the registrar sees at
//! most one renewal per `min_renewal_interval`:
//!
//! ```text
//! services / max_service + events / max_event <= 1 / min_renewal_interval
//! max_service / max_event = min_max_service / min_max_event   (held fixed)
//! ```

use crate::config::Tunables;
use crate::error::ValidationError;

/// A requested lease duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDuration {
    /// Whatever the registrar currently allows.
    Any,
    Millis(i64),
}

impl From<std::time::Duration> for LeaseDuration {
    fn from(d: std::time::Duration) -> Self {
        Self::Millis(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

/// Current dynamic maxima and the tunables they derive from.
#[derive(Debug, Clone)]
pub struct LeasePolicy {
    tunables: Tunables,
    max_service_lease: i64,
    max_event_lease: i64,
}

impl LeasePolicy {
    #[must_use]
    pub fn new(tunables: Tunables) -> Self {
        let mut policy = Self {
            max_service_lease: tunables.min_max_service_lease_ms,
            max_event_lease: tunables.min_max_event_lease_ms,
            tunables,
        };
        policy.recompute(0, 0);
        policy
    }

    #[must_use]
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn set_tunables(&mut self, tunables: Tunables, services: usize, events: usize) {
        self.tunables = tunables;
        self.recompute(services, events);
    }

    #[must_use]
    pub fn max_service_lease(&self) -> i64 {
        self.max_service_lease
    }

    #[must_use]
    pub fn max_event_lease(&self) -> i64 {
        self.max_event_lease
    }

    /// Re-solves the maxima for the given registration counts.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn recompute(&mut self, services: usize, events: usize) {
        let t = &self.tunables;
        let ratio = t.min_max_service_lease_ms as f64 / t.min_max_event_lease_ms as f64;
        let needed = t.min_renewal_interval_ms as f64 * (services as f64 + ratio * events as f64);
        let service = needed.max(t.min_max_service_lease_ms as f64);
        self.max_service_lease = clamp_to_i64(service);
        self.max_event_lease = clamp_to_i64(service / ratio);
    }

    /// Duration to grant a service lease.
    pub fn service_grant(&self, requested: LeaseDuration) -> Result<i64, ValidationError> {
        clamp(requested, self.max_service_lease)
    }

    /// Duration to grant an event lease.
    pub fn event_grant(&self, requested: LeaseDuration) -> Result<i64, ValidationError> {
        clamp(requested, self.max_event_lease)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn clamp_to_i64(v: f64) -> i64 {
    if v >= i64::MAX as f64 {
        i64::MAX
    } else {
        v.ceil() as i64
    }
}

fn clamp(requested: LeaseDuration, max: i64) -> Result<i64, ValidationError> {
    match requested {
        LeaseDuration::Any => Ok(max),
        LeaseDuration::Millis(ms) if ms < 0 => Err(ValidationError::NegativeDuration { millis: ms }),
        LeaseDuration::Millis(ms) => Ok(ms.min(max)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunables() -> Tunables {
        Tunables {
            min_max_service_lease_ms: 1_000,
            min_max_event_lease_ms: 6_000,
            min_renewal_interval_ms: 10,
            ..Tunables::default()
        }
    }

    #[test]
    fn test_floor_when_idle() {
        let p = LeasePolicy::new(tunables());
        assert_eq!(p.max_service_lease(), 1_000);
        assert_eq!(p.max_event_lease(), 6_000);
    }

    #[test]
    fn test_grows_with_load_and_keeps_ratio() {
        let mut p = LeasePolicy::new(tunables());
        p.recompute(600, 600);
        // 10 * (600 + 600/6) = 7000
        assert_eq!(p.max_service_lease(), 7_000);
        assert_eq!(p.max_event_lease(), 42_000);
        // The renewal budget is met exactly.
        let rate: f64 = 600.0 / 7_000.0 + 600.0 / 42_000.0;
        assert!((rate - 1.0 / 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_clamp_policy() {
        let p = LeasePolicy::new(tunables());
        assert_eq!(p.service_grant(LeaseDuration::Any).unwrap(), 1_000);
        assert_eq!(p.service_grant(LeaseDuration::Millis(0)).unwrap(), 0);
        assert_eq!(p.service_grant(LeaseDuration::Millis(500)).unwrap(), 500);
        assert_eq!(p.service_grant(LeaseDuration::Millis(i64::MAX)).unwrap(), 1_000);
        assert_eq!(p.event_grant(LeaseDuration::Millis(10_000)).unwrap(), 6_000);
        assert!(matches!(
            p.service_grant(LeaseDuration::Millis(-1)),
            Err(ValidationError::NegativeDuration { millis: -1 })
        ));
    }
}
