//! Auxiliary channels of the fusion mode controller.
//!
//! - [`AirDataControl`]: airspeed fusion and the wind states it enables.
//! - [`TerrainEstimator`]: a one-state filter for the terrain vertical position, fed by the range finder.
//! - [`RangeChecks`]: tilt and stuck-sensor checks applied to every aligned range sample.
//! - [`BadAccelMonitor`]: detection of vertical accelerometer data that disagrees with height aiding.

use log::{info, warn};
use nalgebra::Vector2;

use crate::config::{AirspeedConfig, BadAccelConfig, EstimatorConfig, ProcessNoise, RangeConfig};
use crate::ekf::CoreEstimator;
use crate::error::EstimatorResult;
use crate::linearize::{ActiveStates, POSITION};
use crate::measurements::{AirspeedMeasurement, Observation};
use crate::messages::{AirspeedSample, RangeSample};
use crate::status::{Channel, FilterEvent, HeightSource, InnovationRecord};
use crate::NavigationState;

use super::{FilterContext, Freshness};

/// Airspeed fusion and wind state management.
#[derive(Clone, Debug)]
pub struct AirDataControl {
    config: AirspeedConfig,
    initial_wind: f64,
    timeout_us: u64,
    last_airspeed_us: Option<u64>,
}
impl AirDataControl {
    pub fn new(config: &EstimatorConfig) -> Self {
        AirDataControl {
            config: config.airspeed,
            initial_wind: config.initial.wind,
            timeout_us: config.timeouts.airspeed_us(),
            last_airspeed_us: None,
        }
    }

    /// Stop wind estimation when airspeed data times out, start it on the first usable sample in
    /// flight, then fuse the sample.
    pub fn step(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        sample: Option<&AirspeedSample>,
    ) -> EstimatorResult<()> {
        let now = ctx.time_us();
        if let Some(sample) = sample {
            self.last_airspeed_us = Some(sample.time_us);
        }
        let recent = self
            .last_airspeed_us
            .is_some_and(|t| now.saturating_sub(t) < self.timeout_us);
        if ctx.status.wind && (!recent || !ctx.status.in_air) {
            info!("wind estimation stopped at {} us", now);
            ctx.status.wind = false;
            ctx.status.fuse_airspeed = false;
            core.set_active_states(ActiveStates {
                wind: false,
                ..core.active_states()
            });
            ctx.emit(FilterEvent::WindEstimationStopped { time_us: now });
        }
        let Some(sample) = sample else {
            return Ok(());
        };
        if !ctx.status.in_air || sample.true_airspeed < self.config.min_airspeed {
            return Ok(());
        }
        if !ctx.status.wind {
            let state = core.state();
            let yaw = state.yaw();
            let wind = Vector2::new(
                state.velocity[0] - sample.true_airspeed * yaw.cos(),
                state.velocity[1] - sample.true_airspeed * yaw.sin(),
            );
            core.reset_wind(wind, self.initial_wind.powi(2));
            core.set_active_states(ActiveStates {
                wind: true,
                ..core.active_states()
            });
            ctx.status.wind = true;
            ctx.status.fuse_airspeed = true;
            ctx.touch(Channel::Airspeed);
            info!(
                "wind estimation started at {} us: [{:.2}, {:.2}] m/s",
                now, wind[0], wind[1]
            );
            ctx.emit(FilterEvent::WindEstimationStarted { time_us: now });
        }
        let model = AirspeedMeasurement {
            true_airspeed: sample.true_airspeed,
            noise_std: self.config.noise * sample.eas2tas.max(1.0),
        };
        let observation = Observation::new(&model, core.state(), self.config.gate);
        ctx.fuse(core, &observation)?;
        Ok(())
    }
}

/// Variance ceiling of the terrain state, m²
const TERRAIN_VARIANCE_MAX: f64 = 1e4;

/// One-state terrain vertical position filter.
///
/// The terrain is modeled as a random walk whose rate grows with ground speed over sloped ground.
/// Range samples observe the height above ground, `terrain_down - position_down`.
#[derive(Clone, Debug)]
pub struct TerrainEstimator {
    terrain_down: f64,
    variance: f64,
    initialized: bool,
    noise: ProcessNoise,
    range: RangeConfig,
    hagl_valid_us: u64,
    last_fused_us: Option<u64>,
    innovation: f64,
    innovation_variance: f64,
}
impl TerrainEstimator {
    pub fn new(config: &EstimatorConfig) -> Self {
        TerrainEstimator {
            terrain_down: 0.0,
            variance: config.range.noise.powi(2),
            initialized: false,
            noise: config.process_noise,
            range: config.range,
            hagl_valid_us: config.timeouts.hagl_valid_us(),
            last_fused_us: None,
            innovation: 0.0,
            innovation_variance: 0.0,
        }
    }
    pub fn terrain_down(&self) -> f64 {
        self.terrain_down
    }
    pub fn variance(&self) -> f64 {
        self.variance
    }
    /// Height above ground of `state`
    pub fn hagl(&self, state: &NavigationState) -> f64 {
        self.terrain_down - state.position[2]
    }
    pub fn innovation(&self) -> f64 {
        self.innovation
    }
    pub fn innovation_variance(&self) -> f64 {
        self.innovation_variance
    }
    /// Normalized innovation of the last range sample against `gate`
    pub fn test_ratio(&self, gate: f64) -> f64 {
        if self.innovation_variance > 0.0 {
            self.innovation.powi(2) / (gate.powi(2) * self.innovation_variance)
        } else {
            f64::INFINITY
        }
    }
    /// The terrain estimate is backed by a range fusion within the validity interval
    pub fn is_valid(&self, now_us: u64) -> bool {
        self.fused_within(now_us, self.hagl_valid_us)
    }
    pub fn fused_within(&self, now_us: u64, limit_us: u64) -> bool {
        self.initialized
            && self
                .last_fused_us
                .is_some_and(|t| now_us.saturating_sub(t) <= limit_us)
    }
    /// Place the terrain one ground clearance below the vehicle.
    pub fn initialize_on_ground(&mut self, state: &NavigationState) {
        self.terrain_down = state.position[2] + self.range.ground_clearance;
        self.variance = self.range.noise.powi(2);
    }
    fn observation_noise(&self, range: f64) -> f64 {
        (self.range.noise + self.range.noise_scaler * range).powi(2)
    }
    fn initialize_from_range(&mut self, state: &NavigationState, hagl: f64, now_us: u64) {
        self.terrain_down = state.position[2] + hagl;
        self.variance = self.observation_noise(hagl);
        self.initialized = true;
        self.last_fused_us = Some(now_us);
        self.innovation = 0.0;
        self.innovation_variance = self.variance;
    }

    /// Predict the terrain state and fuse the range sample, if any.
    ///
    /// `range` must already have passed [`RangeChecks`].
    pub fn step(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        range: Option<RangeSample>,
        dt: f64,
    ) {
        let now = ctx.time_us();
        let state = *core.state();
        let speed = ground_speed(&state);
        self.variance += dt.powi(2)
            * (self.noise.terrain.powi(2) + (self.noise.terrain_gradient * speed).powi(2));
        self.variance = self.variance.min(TERRAIN_VARIANCE_MAX);

        if let Some(sample) = range {
            let rotation = state.rotation();
            let observed = sample.range * rotation[(2, 2)];
            if !self.initialized {
                self.initialize_from_range(&state, observed, now);
                info!("terrain estimate initialized from range at {} us", now);
            } else {
                let predicted = self.hagl(&state);
                let innovation = observed - predicted;
                let variance = self.variance
                    + core.variance(POSITION.start + 2)
                    + self.observation_noise(sample.range);
                let gate = self.range.gate.max(1.0);
                let test_ratio = innovation.powi(2) / (gate.powi(2) * variance);
                self.innovation = innovation;
                self.innovation_variance = variance;
                let accepted = test_ratio <= 1.0;
                if accepted {
                    let gain = self.variance / variance;
                    self.terrain_down += gain * innovation;
                    self.variance -= gain * self.variance;
                    self.last_fused_us = Some(now);
                    ctx.touch(Channel::TerrainRange);
                } else if !self.is_valid(now) {
                    warn!("terrain estimate reset to range after sustained rejection");
                    self.initialize_from_range(&state, observed, now);
                }
                ctx.innovations.set(
                    Channel::TerrainRange,
                    InnovationRecord {
                        time_us: now,
                        dimension: 1,
                        innovation: [innovation, 0.0, 0.0],
                        variance: [variance, 0.0, 0.0],
                        gate,
                        test_ratio,
                        accepted,
                    },
                );
            }
        }

        if !ctx.status.in_air && !self.initialized {
            self.initialize_on_ground(&state);
        }
        // terrain cannot be above the vehicle
        let floor = state.position[2] + self.range.ground_clearance;
        if self.terrain_down < floor {
            self.terrain_down = floor;
        }
        core.set_terrain_down(self.terrain_down);
    }
}

/// Range variation that proves the sensor is not stuck, m
const STUCK_VARIATION: f64 = 1.0;
/// Time in flight without variation after which the range finder is stuck, us
const STUCK_TIMEOUT_US: u64 = 10_000_000;

/// Tilt and stuck-sensor checks on aligned range samples.
#[derive(Clone, Debug)]
pub struct RangeChecks {
    cos_max_tilt: f64,
    stuck: bool,
    window_start_us: Option<u64>,
    window_min: f64,
    window_max: f64,
}
impl RangeChecks {
    pub fn new(config: &EstimatorConfig) -> Self {
        RangeChecks {
            cos_max_tilt: config.range.cos_max_tilt,
            stuck: false,
            window_start_us: None,
            window_min: 0.0,
            window_max: 0.0,
        }
    }
    pub fn is_stuck(&self) -> bool {
        self.stuck
    }
    /// Returns the sample if it may be used this cycle.
    pub fn check(
        &mut self,
        sample: &RangeSample,
        state: &NavigationState,
        in_air: bool,
    ) -> Option<RangeSample> {
        if !in_air {
            self.stuck = false;
            self.window_start_us = None;
        } else {
            match self.window_start_us {
                None => self.restart_window(sample),
                Some(start) => {
                    self.window_min = self.window_min.min(sample.range);
                    self.window_max = self.window_max.max(sample.range);
                    if self.window_max - self.window_min > STUCK_VARIATION {
                        if self.stuck {
                            info!("range finder data varies again");
                        }
                        self.stuck = false;
                        self.restart_window(sample);
                    } else if sample.time_us.saturating_sub(start) > STUCK_TIMEOUT_US && !self.stuck {
                        warn!("range finder stuck at {:.2} m", sample.range);
                        self.stuck = true;
                    }
                }
            }
        }
        let tilt_ok = state.rotation()[(2, 2)] > self.cos_max_tilt;
        (tilt_ok && !self.stuck && sample.range.is_finite() && sample.range >= 0.0)
            .then_some(*sample)
    }
    fn restart_window(&mut self, sample: &RangeSample) {
        self.window_start_us = Some(sample.time_us);
        self.window_min = sample.range;
        self.window_max = sample.range;
    }
}

/// Detection of accelerometer data that disagrees with vertical aiding.
///
/// The vertical velocity and height innovations are tested jointly. Both large and with the same
/// sign indicates the accelerometer, not the aiding, is wrong: typically clipping or aliasing.
#[derive(Clone, Debug)]
pub struct BadAccelMonitor {
    config: BadAccelConfig,
    nominal_accel_noise: f64,
    bad_since_us: Option<u64>,
    last_bad_us: Option<u64>,
}
impl BadAccelMonitor {
    pub fn new(config: &EstimatorConfig) -> Self {
        BadAccelMonitor {
            config: config.bad_accel,
            nominal_accel_noise: config.process_noise.accel,
            bad_since_us: None,
            last_bad_us: None,
        }
    }
    /// Bad accel detected continuously for longer than the reset delay
    pub fn is_continuously_bad(&self, now_us: u64) -> bool {
        let delay_us = (self.config.reset_delay_s * 1e6) as u64;
        self.bad_since_us
            .is_some_and(|t| now_us.saturating_sub(t) > delay_us)
    }
    /// Bad accel was detected within the probation period
    pub fn in_probation(&self, now_us: u64) -> bool {
        let probation_us = (self.config.probation_s * 1e6) as u64;
        self.last_bad_us
            .is_some_and(|t| now_us.saturating_sub(t) < probation_us)
    }

    pub fn update(&mut self, ctx: &mut FilterContext, freshness: &Freshness, core: &mut CoreEstimator) {
        let now = ctx.time_us();
        let velocity = ctx.innovations.get(Channel::GnssVelocity).copied();
        let height = ctx.innovations.get(Channel::BaroHeight).copied();
        let bad = match (velocity, height) {
            (Some(v), Some(h))
                if ctx.status.height_source == HeightSource::Baro
                    && freshness.baro
                    && freshness.gnss_height
                    && v.dimension == 3 =>
            {
                let limit = self.config.vertical_innovation_limit;
                let product = v.innovation[2] * h.innovation[0];
                product > 0.0
                    && h.innovation[0] < 0.0
                    && product.powi(2) > limit.powi(4) * v.variance[2] * h.variance[0]
            }
            _ => false,
        };
        if bad {
            if self.bad_since_us.is_none() {
                warn!("vertical accelerometer data inconsistent with height aiding");
            }
            self.bad_since_us.get_or_insert(now);
            self.last_bad_us = Some(now);
        } else {
            self.bad_since_us = None;
        }
        ctx.faults.bad_vertical_accel = bad;
        let noise = if self.in_probation(now) {
            self.config.probation_accel_noise
        } else {
            self.nominal_accel_noise
        };
        core.set_accel_noise(noise);
    }
}

/// Horizontal ground speed, m/s
pub(crate) fn ground_speed(state: &NavigationState) -> f64 {
    state.velocity.fixed_rows::<2>(0).norm()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::HeightMeasurement;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Vector3;

    fn context(config: &EstimatorConfig, in_air: bool) -> FilterContext {
        let mut ctx = FilterContext::new(config);
        ctx.status.in_air = in_air;
        ctx
    }

    #[test]
    fn wind_starts_from_airspeed_and_times_out() {
        let config = EstimatorConfig::default();
        let mut ctx = context(&config, true);
        let mut state = NavigationState::default();
        state.velocity = Vector3::new(15.0, 0.0, 0.0);
        let mut core = CoreEstimator::new(&config, state, 0);
        let mut air = AirDataControl::new(&config);
        let sample = AirspeedSample {
            time_us: 0,
            true_airspeed: 12.0,
            eas2tas: 1.0,
        };
        air.step(&mut ctx, &mut core, Some(&sample)).unwrap();
        assert!(ctx.status.wind);
        assert!(core.active_states().wind);
        assert_approx_eq!(core.state().wind[0], 3.0, 1e-9);
        assert!(matches!(
            ctx.events()[0],
            FilterEvent::WindEstimationStarted { time_us: 0 }
        ));

        ctx.set_time_us(11_000_000);
        air.step(&mut ctx, &mut core, None).unwrap();
        assert!(!ctx.status.wind);
        assert!(!ctx.status.fuse_airspeed);
        assert!(!core.active_states().wind);
    }

    #[test]
    fn slow_airspeed_is_ignored_on_ground() {
        let config = EstimatorConfig::default();
        let mut ctx = context(&config, false);
        let mut core = CoreEstimator::new(&config, NavigationState::default(), 0);
        let mut air = AirDataControl::new(&config);
        let sample = AirspeedSample {
            time_us: 0,
            true_airspeed: 20.0,
            eas2tas: 1.0,
        };
        air.step(&mut ctx, &mut core, Some(&sample)).unwrap();
        assert!(!ctx.status.wind);
    }

    #[test]
    fn terrain_initializes_and_tracks_range() {
        let config = EstimatorConfig::default();
        let mut ctx = context(&config, true);
        let mut state = NavigationState::default();
        state.position[2] = -10.0;
        let mut core = CoreEstimator::new(&config, state, 0);
        let mut terrain = TerrainEstimator::new(&config);
        assert!(!terrain.is_valid(0));
        let sample = RangeSample {
            time_us: 0,
            range: 10.0,
        };
        terrain.step(&mut ctx, &mut core, Some(sample), 0.004);
        assert!(terrain.is_valid(0));
        assert_approx_eq!(terrain.terrain_down(), 0.0, 1e-9);
        assert_approx_eq!(terrain.hagl(core.state()), 10.0, 1e-9);
        assert_approx_eq!(core.state().terrain_down, 0.0, 1e-9);

        ctx.set_time_us(100_000);
        let sample = RangeSample {
            time_us: 100_000,
            range: 10.2,
        };
        terrain.step(&mut ctx, &mut core, Some(sample), 0.004);
        assert!(terrain.terrain_down() > 0.0 && terrain.terrain_down() < 0.2);
        let record = ctx.innovations.get(Channel::TerrainRange).unwrap();
        assert!(record.accepted);
        assert_approx_eq!(record.innovation[0], 0.2, 1e-9);
        assert!(!terrain.is_valid(100_000 + config.timeouts.hagl_valid_us() + 1));
    }

    #[test]
    fn terrain_stays_below_vehicle() {
        let config = EstimatorConfig::default();
        let mut ctx = context(&config, false);
        let mut core = CoreEstimator::new(&config, NavigationState::default(), 0);
        let mut terrain = TerrainEstimator::new(&config);
        terrain.step(&mut ctx, &mut core, None, 0.004);
        assert_approx_eq!(terrain.terrain_down(), config.range.ground_clearance, 1e-12);
    }

    #[test]
    fn range_tilt_and_stuck_checks() {
        let config = EstimatorConfig::default();
        let mut checks = RangeChecks::new(&config);
        let level = NavigationState::default();
        let mut tilted = NavigationState::default();
        tilted.attitude = nalgebra::UnitQuaternion::from_euler_angles(1.0, 0.0, 0.0);
        let sample = |time_us, range| RangeSample { time_us, range };
        assert!(checks.check(&sample(0, 3.0), &tilted, true).is_none());
        assert!(checks.check(&sample(0, 3.0), &level, true).is_some());
        for i in 1..=11 {
            checks.check(&sample(i * 1_000_000, 3.0 + 0.01 * i as f64), &level, true);
        }
        assert!(checks.is_stuck());
        assert!(checks.check(&sample(12_000_000, 3.0), &level, true).is_none());
        assert!(checks.check(&sample(12_100_000, 5.0), &level, true).is_some());
        assert!(!checks.is_stuck());
    }

    #[test]
    fn bad_accel_raises_process_noise() {
        let config = EstimatorConfig::default();
        let mut ctx = context(&config, true);
        let mut core = CoreEstimator::new(&config, NavigationState::default(), 0);
        let mut monitor = BadAccelMonitor::new(&config);
        ctx.innovations.set(
            Channel::GnssVelocity,
            InnovationRecord {
                dimension: 3,
                innovation: [0.0, 0.0, -10.0],
                variance: [0.1, 0.1, 0.1],
                ..Default::default()
            },
        );
        let model = HeightMeasurement {
            channel: Channel::BaroHeight,
            down: -10.0,
            noise_std: 0.3,
        };
        let report = core
            .gate(&Observation::new(&model, core.state(), 5.0))
            .unwrap();
        ctx.innovations.set(Channel::BaroHeight, report.record(0));
        let fresh = Freshness {
            baro: true,
            gnss_height: true,
            ..Default::default()
        };
        monitor.update(&mut ctx, &fresh, &mut core);
        assert!(ctx.faults.bad_vertical_accel);
        assert!(monitor.in_probation(0));
        assert!(!monitor.is_continuously_bad(0));
        ctx.set_time_us(600_000);
        monitor.update(&mut ctx, &fresh, &mut core);
        assert!(monitor.is_continuously_bad(600_000));
        assert!(!monitor.in_probation(20_000_000));
    }
}
