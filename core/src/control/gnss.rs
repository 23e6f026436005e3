//! GNSS receiver quality checks and the local navigation origin.
//!
//! Every GNSS sample pushed to the estimator is checked against [`GnssChecks`]. The local origin is
//! only set after the checks have passed continuously for the configured duration, and aiding cannot
//! start within the fail hold-off of the most recent failure. All times are times of validity.

use log::{info, warn};
use nalgebra::Vector2;

use crate::config::{EstimatorConfig, GnssChecks};
use crate::earth::MapProjection;
use crate::ekf::CoreEstimator;
use crate::messages::GnssSample;

/// Which checks the most recent sample failed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GnssCheckFailures {
    pub fix: bool,
    pub satellites: bool,
    pub pdop: bool,
    pub horizontal_accuracy: bool,
    pub vertical_accuracy: bool,
    pub speed_accuracy: bool,
}
impl GnssCheckFailures {
    pub fn any(&self) -> bool {
        self.fix
            || self.satellites
            || self.pdop
            || self.horizontal_accuracy
            || self.vertical_accuracy
            || self.speed_accuracy
    }
    pub fn to_bits(&self) -> u8 {
        [
            self.fix,
            self.satellites,
            self.pdop,
            self.horizontal_accuracy,
            self.vertical_accuracy,
            self.speed_accuracy,
        ]
        .iter()
        .enumerate()
        .fold(0u8, |bits, (i, set)| if *set { bits | (1 << i) } else { bits })
    }
}

#[derive(Clone, Debug)]
pub struct GnssMonitor {
    checks: GnssChecks,
    delay_us: u64,
    failures: GnssCheckFailures,
    last_fail_us: Option<u64>,
    passing_since_us: Option<u64>,
    last_check_us: Option<u64>,
    origin: Option<MapProjection>,
    /// GNSS altitude of the navigation frame origin, m
    altitude_reference: f64,
}
impl GnssMonitor {
    pub fn new(config: &EstimatorConfig) -> Self {
        GnssMonitor {
            checks: config.gnss.checks,
            delay_us: config.delays.delay_us(crate::messages::SensorKind::Gnss),
            failures: GnssCheckFailures::default(),
            last_fail_us: None,
            passing_since_us: None,
            last_check_us: None,
            origin: None,
            altitude_reference: 0.0,
        }
    }

    /// Run the quality checks on a freshly pushed sample (push time stamp).
    ///
    /// Returns true when every check passed.
    pub fn check(&mut self, sample: &GnssSample) -> bool {
        let time_us = sample.time_us.saturating_sub(self.delay_us);
        let checks = &self.checks;
        self.failures = GnssCheckFailures {
            fix: sample.fix_type < checks.min_fix,
            satellites: sample.satellites < checks.min_satellites,
            pdop: sample.pdop > checks.max_pdop,
            horizontal_accuracy: sample.horizontal_accuracy > checks.max_horizontal_accuracy,
            vertical_accuracy: sample.vertical_accuracy > checks.max_vertical_accuracy,
            speed_accuracy: sample.speed_accuracy > checks.max_speed_accuracy,
        };
        self.last_check_us = Some(time_us);
        if self.failures.any() {
            if self.passing_since_us.is_some() {
                warn!("gnss checks failed: {:?}", self.failures);
            }
            self.last_fail_us = Some(time_us);
            self.passing_since_us = None;
            false
        } else {
            self.passing_since_us.get_or_insert(time_us);
            true
        }
    }
    pub fn failures(&self) -> GnssCheckFailures {
        self.failures
    }
    /// Checks have passed continuously for the configured duration
    pub fn checks_passed(&self) -> bool {
        match (self.passing_since_us, self.last_check_us) {
            (Some(since), Some(last)) => {
                last.saturating_sub(since) as f64 * 1e-6 >= self.checks.pass_duration_s
            }
            _ => false,
        }
    }
    /// The most recent sample met the vertical accuracy limit
    pub fn is_vertically_accurate(&self) -> bool {
        self.last_check_us.is_some() && !self.failures.vertical_accuracy
    }
    /// Aiding may start at `now_us`: origin set, checks passing and outside the fail hold-off.
    pub fn can_start(&self, now_us: u64) -> bool {
        let holdoff_us = (self.checks.fail_holdoff_s * 1e6) as u64;
        self.origin.is_some()
            && self.checks_passed()
            && self
                .last_fail_us
                .is_none_or(|t| now_us.saturating_sub(t) >= holdoff_us)
    }
    pub fn origin(&self) -> Option<&MapProjection> {
        self.origin.as_ref()
    }
    pub fn altitude_reference(&self) -> f64 {
        self.altitude_reference
    }

    /// Set the local origin from an aligned sample once the checks allow it.
    ///
    /// The altitude reference is chosen so the sample's height maps onto the current filter height,
    /// and the core's gravity and Earth-rate models are updated for the origin latitude.
    pub fn try_set_origin(&mut self, sample: &GnssSample, core: &mut CoreEstimator) -> bool {
        if self.origin.is_some() || !self.checks_passed() {
            return false;
        }
        let origin = MapProjection::new(sample.latitude, sample.longitude, sample.altitude);
        self.altitude_reference = sample.altitude + core.state().position[2];
        core.set_earth_model(origin.gravity(), origin.earth_rate());
        info!(
            "navigation origin set at lat {:.7}, lon {:.7}, alt ref {:.2} m",
            sample.latitude, sample.longitude, self.altitude_reference
        );
        self.origin = Some(origin);
        true
    }
    /// North and east position of a sample relative to the origin.
    pub fn position_ne(&self, sample: &GnssSample) -> Option<Vector2<f64>> {
        self.origin
            .as_ref()
            .map(|origin| origin.project(sample.latitude, sample.longitude))
    }
    /// Down position of a sample relative to the origin.
    pub fn height_down(&self, sample: &GnssSample) -> Option<f64> {
        self.origin
            .as_ref()
            .map(|_| -(sample.altitude - self.altitude_reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NavigationState;
    use nalgebra::Vector3;

    fn good_sample(time_us: u64) -> GnssSample {
        GnssSample {
            time_us,
            latitude: 47.0,
            longitude: 8.0,
            altitude: 500.0,
            velocity: Vector3::zeros(),
            fix_type: 3,
            satellites: 10,
            pdop: 1.2,
            horizontal_accuracy: 0.8,
            vertical_accuracy: 1.5,
            speed_accuracy: 0.3,
        }
    }

    #[test]
    fn origin_waits_for_pass_duration() {
        let config = EstimatorConfig::default();
        let mut monitor = GnssMonitor::new(&config);
        let mut state = NavigationState::default();
        state.position[2] = -2.0;
        let mut core = CoreEstimator::new(&config, state, 0);
        let delay = config.delays.delay_us(crate::messages::SensorKind::Gnss);
        assert!(monitor.check(&good_sample(delay)));
        assert!(!monitor.try_set_origin(&good_sample(0), &mut core));
        assert!(monitor.check(&good_sample(10_000_000 + delay)));
        assert!(monitor.checks_passed());
        assert!(monitor.try_set_origin(&good_sample(10_000_000), &mut core));
        assert_eq!(monitor.altitude_reference(), 498.0);
        assert_eq!(monitor.height_down(&good_sample(0)), Some(-2.0));
        let ne = monitor.position_ne(&good_sample(0)).unwrap();
        assert!(ne.norm() < 1e-6);
    }

    #[test]
    fn failure_restarts_and_holds_off() {
        let config = EstimatorConfig::default();
        let mut monitor = GnssMonitor::new(&config);
        let mut core = CoreEstimator::new(&config, NavigationState::default(), 0);
        let delay = config.delays.delay_us(crate::messages::SensorKind::Gnss);
        let mut bad = good_sample(delay);
        bad.satellites = 4;
        assert!(!monitor.check(&bad));
        assert!(monitor.failures().satellites);
        assert_eq!(monitor.failures().to_bits(), 0b10);
        monitor.check(&good_sample(1_000_000 + delay));
        monitor.check(&good_sample(11_000_000 + delay));
        assert!(monitor.try_set_origin(&good_sample(11_000_000), &mut core));
        assert!(monitor.can_start(11_000_000));

        let mut bad = good_sample(12_000_000 + delay);
        bad.horizontal_accuracy = 20.0;
        monitor.check(&bad);
        assert!(!monitor.can_start(13_000_000));
        assert!(monitor.is_vertically_accurate());
    }
}
