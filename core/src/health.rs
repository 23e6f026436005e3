//! Debounced channel health.
//!
//! A [`HealthTracker`] turns the pass/fail result of every gate test on one fusion channel into a
//! stable healthy/unhealthy classification: `fail_limit` consecutive failures make a healthy channel
//! unhealthy and `pass_limit` consecutive passes make an unhealthy channel healthy again. A single
//! outlier therefore never excludes a sensor, and a single lucky pass never readmits one.

use serde::{Deserialize, Serialize};

/// Debounce thresholds for one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthLimits {
    /// Consecutive gate failures that make a healthy channel unhealthy
    pub fail_limit: u32,
    /// Consecutive gate passes that make an unhealthy channel healthy
    pub pass_limit: u32,
}
impl Default for HealthLimits {
    fn default() -> Self {
        HealthLimits {
            fail_limit: 5,
            pass_limit: 3,
        }
    }
}

/// Change of classification reported by [`HealthTracker::record`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthTransition {
    BecameUnhealthy,
    BecameHealthy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthTracker {
    limits: HealthLimits,
    healthy: bool,
    consecutive_failures: u32,
    consecutive_passes: u32,
    /// Total number of failed gate tests since construction
    total_failures: u32,
}
impl HealthTracker {
    pub fn new(limits: HealthLimits) -> Self {
        HealthTracker {
            limits,
            healthy: true,
            consecutive_failures: 0,
            consecutive_passes: 0,
            total_failures: 0,
        }
    }
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
    pub fn limits(&self) -> HealthLimits {
        self.limits
    }
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
    pub fn total_failures(&self) -> u32 {
        self.total_failures
    }
    /// Record one gate test result, returning the classification change it caused.
    pub fn record(&mut self, passed: bool) -> Option<HealthTransition> {
        if passed {
            self.consecutive_failures = 0;
            self.consecutive_passes = self.consecutive_passes.saturating_add(1);
            if !self.healthy && self.consecutive_passes >= self.limits.pass_limit {
                self.healthy = true;
                return Some(HealthTransition::BecameHealthy);
            }
        } else {
            self.consecutive_passes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.total_failures = self.total_failures.saturating_add(1);
            if self.healthy && self.consecutive_failures >= self.limits.fail_limit {
                self.healthy = false;
                return Some(HealthTransition::BecameUnhealthy);
            }
        }
        None
    }
    /// Return to the healthy state with cleared counters.
    pub fn reset(&mut self) {
        *self = HealthTracker {
            total_failures: self.total_failures,
            ..HealthTracker::new(self.limits)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_miss_is_tolerated() {
        let mut tracker = HealthTracker::new(HealthLimits::default());
        assert_eq!(tracker.record(false), None);
        assert_eq!(tracker.record(true), None);
        assert!(tracker.is_healthy());
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.total_failures(), 1);
    }
    #[test]
    fn debounce_both_ways() {
        let limits = HealthLimits {
            fail_limit: 3,
            pass_limit: 2,
        };
        let mut tracker = HealthTracker::new(limits);
        assert_eq!(tracker.record(false), None);
        assert_eq!(tracker.record(false), None);
        assert_eq!(tracker.record(false), Some(HealthTransition::BecameUnhealthy));
        assert_eq!(tracker.record(false), None);
        assert!(!tracker.is_healthy());
        assert_eq!(tracker.record(true), None);
        assert_eq!(tracker.record(false), None);
        assert_eq!(tracker.record(true), None);
        assert_eq!(tracker.record(true), Some(HealthTransition::BecameHealthy));
        assert!(tracker.is_healthy());
    }
    #[test]
    fn reset_keeps_totals() {
        let mut tracker = HealthTracker::new(HealthLimits {
            fail_limit: 1,
            pass_limit: 5,
        });
        tracker.record(false);
        assert!(!tracker.is_healthy());
        tracker.reset();
        assert!(tracker.is_healthy());
        assert_eq!(tracker.total_failures(), 1);
    }
}
