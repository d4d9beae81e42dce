use std::collections::BTreeMap;
use std::time::Duration;

use crate::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX};

/// Failure tracker that turns consecutive reconcile errors into requeue delays.
///
/// Each key doubles its delay on every failure, starting at `base` and
/// capped at `max`. A successful reconcile clears the key.
#[derive(Debug, Clone)]
pub struct RequeueBackoff {
    base: Duration,
    max: Duration,

    /// Tracked failures: resource_key -> consecutive failure count.
    failures: BTreeMap<String, u32>,
}

impl Default for RequeueBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX)
    }
}

impl RequeueBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource and return how long to wait before
    /// reconciling it again.
    pub fn record_failure(&mut self, resource_key: &str) -> Duration {
        let count = self
            .failures
            .entry(resource_key.to_string())
            .or_insert(0);
        *count = count.saturating_add(1);
        let failures = *count;
        self.delay_for(failures)
    }

    /// Consecutive failures recorded for a resource.
    pub fn failures(&self, resource_key: &str) -> u32 {
        self.failures.get(resource_key).copied().unwrap_or(0)
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    fn delay_for(&self, failures: u32) -> Duration {
        // 2^(n-1) * base; shifts past 31 overflow u32 long before the cap matters.
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}
