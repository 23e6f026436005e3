//! Core estimator: the error-state extended Kalman filter.
//!
//! [`CoreEstimator`] owns the nominal [`NavigationState`] and the 23×23 error covariance of one
//! filter instance. It runs on the delayed time horizon and offers three groups of operations:
//!
//! - **Prediction.** Every inertial sample is integrated into the nominal state with the strapdown
//!   mechanization ([`crate::forward`]). Covariance propagation is deferred and batched: the
//!   specific force increment, elapsed time and rotation magnitude are accumulated and
//!   $P \leftarrow F P F^T + Q$ is applied once either the time or the rotation threshold is reached.
//! - **Fusion.** An [`Observation`] is gated jointly, then fused one axis at a time with the Joseph
//!   form update
//!   $$ P \leftarrow (I - K H) P (I - K H)^T + K R K^T $$
//!   which stays positive semi-definite even when gain rows are zeroed by a state mask. The
//!   accumulated correction is injected into the nominal state once.
//! - **Resets.** Direct state overwrites used by the fusion mode controller. Every reset returns the
//!   [`ResetDelta`] it applied.
//!
//! After every covariance mutation every entry is checked for finiteness before the matrix is
//! symmetrized and its variances are clamped to the configured bounds. A non-finite state or
//! covariance, a non-finite innovation variance, or a velocity or position beyond any reachable
//! value is reported as [`EstimatorError::NumericalFailure`].

use std::fmt::{self, Debug, Display};
use std::ops::Range;

use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector2, Vector3};

use crate::config::{EstimatorConfig, PredictionConfig, ProcessNoise, VarianceBounds};
use crate::error::{EstimatorError, EstimatorResult};
use crate::linalg::{clamp_variances, is_finite, reset_block, symmetrize, zero_rows_and_columns};
use crate::linearize::{
    ACCEL_BIAS, ATTITUDE, ActiveStates, GYRO_BIAS, MAG_BODY, MAG_EARTH, POSITION, STATE_DIM,
    VELOCITY, WIND, apply_correction, process_noise, state_transition_jacobian,
};
use crate::measurements::Observation;
use crate::status::{InnovationRecord, ResetDelta};
use crate::{ImuSample, InertialIncrement, NavigationState, attitude_with_yaw, forward};

/// Largest velocity component the nominal state may hold, m/s
const MAX_SPEED: f64 = 1.0e4;
/// Largest distance from the local origin the nominal state may hold, m
const MAX_DISTANCE: f64 = 1.0e7;

/// Result of one fusion attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FusionOutcome {
    Accepted,
    /// At least one axis failed the gate; the state is untouched
    Rejected { test_ratio: f64 },
    /// The innovation variance fell below the observation variance; the state is untouched
    Degenerate,
}
impl FusionOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FusionOutcome::Accepted)
    }
}

/// Innovation statistics computed by a fusion attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct FusionReport {
    pub outcome: FusionOutcome,
    pub innovation: DVector<f64>,
    /// Innovation variance per axis, before any axis was fused
    pub variance: DVector<f64>,
    /// Largest test ratio across the axes
    pub test_ratio: f64,
    pub gate: f64,
}
impl FusionReport {
    pub fn record(&self, time_us: u64) -> InnovationRecord {
        let mut record = InnovationRecord {
            time_us,
            dimension: self.innovation.len().min(3),
            gate: self.gate,
            test_ratio: self.test_ratio,
            accepted: self.outcome.is_accepted(),
            ..Default::default()
        };
        for i in 0..record.dimension {
            record.innovation[i] = self.innovation[i];
            record.variance[i] = self.variance[i];
        }
        record
    }
}

/// The core error-state Kalman filter of one estimator instance.
#[derive(Clone)]
pub struct CoreEstimator {
    state: NavigationState,
    covariance: DMatrix<f64>,
    time_us: u64,
    noise: ProcessNoise,
    prediction: PredictionConfig,
    bounds: VarianceBounds,
    imu_dt: f64,
    /// Accelerometer noise currently used for prediction; raised while accel data is on probation
    accel_noise: f64,
    active: ActiveStates,
    inhibit_accel_bias: bool,
    gravity: f64,
    earth_rate: Vector3<f64>,
    pending_dt: f64,
    pending_rotation: f64,
    pending_delta_velocity: Vector3<f64>,
}
impl Debug for CoreEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreEstimator")
            .field("time_us", &self.time_us)
            .field("state", &self.state)
            .field("covariance_diagonal", &self.covariance.diagonal().as_slice())
            .field("active", &self.active)
            .field("pending_dt", &self.pending_dt)
            .finish()
    }
}
impl Display for CoreEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoreEstimator {{ t: {} us, {} }}", self.time_us, self.state)
    }
}

impl CoreEstimator {
    /// Create a filter instance at `state` with the configured initial uncertainty.
    ///
    /// Magnetic variances start at the three-axis observation noise; wind states start inactive
    /// with zero covariance.
    pub fn new(config: &EstimatorConfig, state: NavigationState, time_us: u64) -> Self {
        let initial = &config.initial;
        let mut diagonal = DVector::<f64>::zeros(STATE_DIM);
        diagonal[ATTITUDE.start] = initial.tilt.powi(2);
        diagonal[ATTITUDE.start + 1] = initial.tilt.powi(2);
        diagonal[ATTITUDE.start + 2] = initial.yaw.powi(2);
        for i in VELOCITY {
            diagonal[i] = initial.velocity.powi(2);
        }
        diagonal[POSITION.start] = initial.position.powi(2);
        diagonal[POSITION.start + 1] = initial.position.powi(2);
        diagonal[POSITION.start + 2] = initial.height.powi(2);
        for i in GYRO_BIAS {
            diagonal[i] = initial.gyro_bias.powi(2);
        }
        for i in ACCEL_BIAS {
            diagonal[i] = initial.accel_bias.powi(2);
        }
        for i in MAG_EARTH.start..MAG_BODY.end {
            diagonal[i] = config.mag.noise.powi(2);
        }
        CoreEstimator {
            state,
            covariance: DMatrix::from_diagonal(&diagonal),
            time_us,
            noise: config.process_noise,
            prediction: config.prediction,
            bounds: config.variance_bounds,
            imu_dt: config.imu_interval_s(),
            accel_noise: config.process_noise.accel,
            active: ActiveStates::default(),
            inhibit_accel_bias: config.aiding.inhibit_accel_bias,
            gravity: crate::earth::STANDARD_GRAVITY,
            earth_rate: Vector3::zeros(),
            pending_dt: 0.0,
            pending_rotation: 0.0,
            pending_delta_velocity: Vector3::zeros(),
        }
    }

    pub fn state(&self) -> &NavigationState {
        &self.state
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
    pub fn time_us(&self) -> u64 {
        self.time_us
    }
    pub fn variance(&self, index: usize) -> f64 {
        self.covariance[(index, index)]
    }
    /// Sum of the roll and pitch error variances
    pub fn tilt_variance(&self) -> f64 {
        self.variance(ATTITUDE.start) + self.variance(ATTITUDE.start + 1)
    }
    pub fn active_states(&self) -> ActiveStates {
        self.active
    }
    /// Time accumulated since the last covariance propagation, s
    pub fn pending_dt(&self) -> f64 {
        self.pending_dt
    }
    pub fn set_accel_noise(&mut self, accel_noise: f64) {
        self.accel_noise = accel_noise;
    }
    pub fn set_inhibit_accel_bias(&mut self, inhibit: bool) {
        self.inhibit_accel_bias = inhibit;
    }
    /// Local gravity and Earth rate, known once the navigation origin is set.
    pub fn set_earth_model(&mut self, gravity: f64, earth_rate: Vector3<f64>) {
        self.gravity = gravity;
        self.earth_rate = earth_rate;
    }
    pub fn gravity(&self) -> f64 {
        self.gravity
    }
    pub fn earth_rate(&self) -> Vector3<f64> {
        self.earth_rate
    }
    pub fn set_terrain_down(&mut self, terrain_down: f64) {
        self.state.terrain_down = terrain_down;
    }

    /// Enable or disable process noise on the magnetic and wind states.
    ///
    /// Disabling wind estimation removes the wind states from the covariance.
    pub fn set_active_states(&mut self, active: ActiveStates) {
        if self.active.wind && !active.wind {
            zero_rows_and_columns(&mut self.covariance, WIND);
        }
        self.active = active;
    }

    /// Integrate one delayed inertial sample and, when due, propagate the covariance.
    pub fn predict(&mut self, imu: &ImuSample) -> EstimatorResult<InertialIncrement> {
        let increment = forward(&mut self.state, imu, self.gravity, &self.earth_rate);
        self.time_us = imu.time_us;
        self.pending_dt += increment.dt;
        self.pending_rotation += increment.delta_angle.norm();
        self.pending_delta_velocity += increment.delta_velocity_nav;
        if self.pending_dt >= self.prediction.max_dt_s
            || self.pending_rotation >= self.prediction.max_rotation_rad
        {
            self.propagate_covariance()?;
        }
        if !self.state.is_finite() || self.state_diverged() {
            return Err(EstimatorError::numerical("inertial prediction"));
        }
        Ok(increment)
    }

    /// True once velocity or position left the range any vehicle can reach.
    fn state_diverged(&self) -> bool {
        self.state.velocity.amax() > MAX_SPEED || self.state.position.amax() > MAX_DISTANCE
    }

    /// Apply the accumulated covariance propagation now.
    pub fn propagate_covariance(&mut self) -> EstimatorResult<()> {
        if self.pending_dt <= 0.0 {
            return Ok(());
        }
        let rotation = *self.state.rotation().matrix();
        let f = state_transition_jacobian(&rotation, &self.pending_delta_velocity, self.pending_dt);
        let q = process_noise(
            &self.noise,
            self.accel_noise,
            self.pending_dt,
            self.imu_dt,
            self.active,
        );
        self.covariance = &f * &self.covariance * f.transpose() + DMatrix::from_diagonal(&q);
        if !self.active.wind {
            zero_rows_and_columns(&mut self.covariance, WIND);
        }
        self.pending_dt = 0.0;
        self.pending_rotation = 0.0;
        self.pending_delta_velocity = Vector3::zeros();
        self.condition_covariance("covariance propagation")
    }

    /// Check every entry is finite, then symmetrize and clamp to the configured bounds.
    fn condition_covariance(&mut self, context: &str) -> EstimatorResult<()> {
        if !is_finite(&self.covariance) || !self.state.is_finite() {
            return Err(EstimatorError::numerical(context));
        }
        self.covariance = symmetrize(&self.covariance);
        let bounds = self.bounds;
        let mut groups: Vec<(Range<usize>, f64, f64)> = vec![
            (ATTITUDE, bounds.attitude.floor, bounds.attitude.ceiling),
            (VELOCITY, bounds.velocity.floor, bounds.velocity.ceiling),
            (POSITION, bounds.position.floor, bounds.position.ceiling),
            (GYRO_BIAS, bounds.gyro_bias.floor, bounds.gyro_bias.ceiling),
            (ACCEL_BIAS, bounds.accel_bias.floor, bounds.accel_bias.ceiling),
            (MAG_EARTH, bounds.mag_earth.floor, bounds.mag_earth.ceiling),
            (MAG_BODY, bounds.mag_body.floor, bounds.mag_body.ceiling),
        ];
        if self.active.wind {
            groups.push((WIND, bounds.wind.floor, bounds.wind.ceiling));
        }
        for (range, floor, ceiling) in groups {
            clamp_variances(&mut self.covariance, range, floor, ceiling);
        }
        Ok(())
    }

    /// Run the joint innovation gate without modifying anything.
    ///
    /// A non-finite innovation variance means the covariance is already corrupted and is reported
    /// as [`EstimatorError::NumericalFailure`].
    pub fn gate(&self, observation: &Observation) -> EstimatorResult<FusionReport> {
        let n = observation.dimension();
        let h = &observation.jacobian;
        let mut variance = DVector::<f64>::zeros(n);
        let mut test_ratio = 0.0_f64;
        let mut degenerate = false;
        for i in 0..n {
            let row = h.row(i);
            let s = (&row * &self.covariance * row.transpose())[(0, 0)] + observation.noise[i];
            variance[i] = s;
            if !s.is_finite() {
                return Err(EstimatorError::numerical("innovation variance"));
            }
            if s < observation.noise[i] || s <= 0.0 {
                degenerate = true;
                continue;
            }
            let ratio = observation.innovation[i].powi(2) / (observation.gate.powi(2) * s);
            test_ratio = test_ratio.max(ratio);
        }
        let mut report = FusionReport {
            outcome: FusionOutcome::Accepted,
            innovation: observation.innovation.clone(),
            variance,
            test_ratio,
            gate: observation.gate,
        };
        if degenerate {
            report.outcome = FusionOutcome::Degenerate;
        } else if test_ratio > 1.0 {
            report.outcome = FusionOutcome::Rejected { test_ratio };
        }
        Ok(report)
    }

    /// Gate and fuse one observation.
    ///
    /// All axes are tested before anything is modified: if any axis fails
    /// `innovation² > gate² · variance` the whole observation is rejected, and if any innovation
    /// variance is smaller than its observation variance the observation is degenerate. In both
    /// cases the state and covariance are left exactly as they were. Otherwise the axes are fused
    /// sequentially, each against the covariance left by the previous one.
    pub fn fuse(&mut self, observation: &Observation) -> EstimatorResult<FusionReport> {
        let report = self.gate(observation)?;
        if !report.outcome.is_accepted() {
            return Ok(report);
        }
        let n = observation.dimension();
        let h = &observation.jacobian;
        let identity = DMatrix::<f64>::identity(STATE_DIM, STATE_DIM);
        let mut dx = DVector::<f64>::zeros(STATE_DIM);
        for i in 0..n {
            let row = h.row(i).into_owned();
            let r = observation.noise[i];
            let innovation = observation.innovation[i] - (&row * &dx)[(0, 0)];
            let pht = &self.covariance * row.transpose();
            let s = (&row * &pht)[(0, 0)] + r;
            let mut gain = pht / s;
            for j in 0..STATE_DIM {
                if !observation.mask.allows(j)
                    || (self.inhibit_accel_bias && ACCEL_BIAS.contains(&j))
                {
                    gain[j] = 0.0;
                }
            }
            dx += &gain * innovation;
            let a = &identity - &gain * &row;
            self.covariance =
                &a * &self.covariance * a.transpose() + &gain * gain.transpose() * r;
        }
        self.condition_covariance("measurement update")?;
        apply_correction(&mut self.state, &dx);
        if !self.state.is_finite() {
            return Err(EstimatorError::numerical("measurement update"));
        }
        Ok(report)
    }

    /// Overwrite the horizontal velocity and decorrelate it.
    pub fn reset_horizontal_velocity(&mut self, velocity: Vector2<f64>, variance: f64) -> ResetDelta {
        let delta = Vector3::new(
            velocity[0] - self.state.velocity[0],
            velocity[1] - self.state.velocity[1],
            0.0,
        );
        self.state.velocity[0] = velocity[0];
        self.state.velocity[1] = velocity[1];
        reset_block(&mut self.covariance, VELOCITY.start..VELOCITY.start + 2, variance);
        ResetDelta::velocity(delta)
    }
    /// Overwrite the vertical velocity and decorrelate it.
    pub fn reset_vertical_velocity(&mut self, velocity_down: f64, variance: f64) -> ResetDelta {
        let delta = Vector3::new(0.0, 0.0, velocity_down - self.state.velocity[2]);
        self.state.velocity[2] = velocity_down;
        reset_block(&mut self.covariance, VELOCITY.start + 2..VELOCITY.end, variance);
        ResetDelta::velocity(delta)
    }
    /// Overwrite the north and east position and decorrelate them.
    pub fn reset_horizontal_position(&mut self, position: Vector2<f64>, variance: f64) -> ResetDelta {
        let delta = Vector3::new(
            position[0] - self.state.position[0],
            position[1] - self.state.position[1],
            0.0,
        );
        self.state.position[0] = position[0];
        self.state.position[1] = position[1];
        reset_block(&mut self.covariance, POSITION.start..POSITION.start + 2, variance);
        ResetDelta::position(delta)
    }
    /// Overwrite the down position and decorrelate it.
    pub fn reset_vertical_position(&mut self, position_down: f64, variance: f64) -> ResetDelta {
        let delta = Vector3::new(0.0, 0.0, position_down - self.state.position[2]);
        self.state.position[2] = position_down;
        reset_block(&mut self.covariance, POSITION.start + 2..POSITION.end, variance);
        ResetDelta::position(delta)
    }
    /// Replace the yaw while keeping roll and pitch.
    ///
    /// The returned attitude delta is the navigation frame rotation `q_new ⊗ q_old⁻¹`.
    pub fn reset_yaw(&mut self, yaw: f64, variance: f64) -> ResetDelta {
        let previous = self.state.attitude;
        let attitude = attitude_with_yaw(&previous, yaw);
        self.state.attitude = attitude;
        reset_block(&mut self.covariance, ATTITUDE.start + 2..ATTITUDE.end, variance);
        ResetDelta::attitude(attitude * previous.inverse())
    }
    /// Replace the whole attitude, e.g. from an external vision orientation.
    pub fn reset_attitude(&mut self, attitude: UnitQuaternion<f64>, variance: f64) -> ResetDelta {
        let previous = self.state.attitude;
        self.state.attitude = attitude;
        reset_block(&mut self.covariance, ATTITUDE, variance);
        ResetDelta::attitude(attitude * previous.inverse())
    }
    pub fn reset_wind(&mut self, wind: Vector2<f64>, variance: f64) {
        self.state.wind = wind;
        reset_block(&mut self.covariance, WIND, variance);
    }
    pub fn reset_mag_field(&mut self, earth: Vector3<f64>, body: Vector3<f64>, variance: f64) {
        self.state.mag_earth = earth;
        self.state.mag_body = body;
        reset_block(&mut self.covariance, MAG_EARTH.start..MAG_BODY.end, variance);
    }
    /// Covariance block of the magnetic states (earth field then body field).
    pub fn mag_covariance(&self) -> DMatrix<f64> {
        let n = MAG_BODY.end - MAG_EARTH.start;
        self.covariance
            .view((MAG_EARTH.start, MAG_EARTH.start), (n, n))
            .into_owned()
    }
    /// Restore a block saved with [`CoreEstimator::mag_covariance`], decorrelated from other states.
    pub fn restore_mag_covariance(&mut self, block: &DMatrix<f64>) {
        let n = MAG_BODY.end - MAG_EARTH.start;
        if block.shape() != (n, n) {
            return;
        }
        zero_rows_and_columns(&mut self.covariance, MAG_EARTH.start..MAG_BODY.end);
        self.covariance
            .view_mut((MAG_EARTH.start, MAG_EARTH.start), (n, n))
            .copy_from(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::min_eigenvalue;
    use crate::measurements::{
        HeadingMeasurement, HeightMeasurement, MagFieldMeasurement, StateMask, VelocityMeasurement,
    };
    use crate::status::Channel;
    use assert_approx_eq::assert_approx_eq;

    const G: f64 = crate::earth::STANDARD_GRAVITY;

    fn level_filter() -> CoreEstimator {
        let config = EstimatorConfig::default();
        CoreEstimator::new(&config, NavigationState::default(), 0)
    }
    fn rest_imu(time_us: u64) -> ImuSample {
        ImuSample::from_rates(time_us, Vector3::zeros(), Vector3::new(0.0, 0.0, -G), 0.004)
    }
    fn height(down: f64) -> Observation {
        let model = HeightMeasurement {
            channel: Channel::BaroHeight,
            down,
            noise_std: 0.5,
        };
        Observation::new(&model, &NavigationState::default(), 5.0)
    }

    #[test]
    fn covariance_propagation_is_batched() {
        let mut filter = level_filter();
        let p0 = filter.variance(POSITION.start);
        for i in 1..=4 {
            filter.predict(&rest_imu(i * 4000)).unwrap();
        }
        // 16 ms accumulated, below the 20 ms threshold
        assert_eq!(filter.variance(POSITION.start), p0);
        assert_approx_eq!(filter.pending_dt(), 0.016, 1e-12);
        filter.predict(&rest_imu(20_000)).unwrap();
        filter.predict(&rest_imu(24_000)).unwrap();
        assert!(filter.pending_dt() < 0.02);
        assert!(filter.variance(POSITION.start) > p0);
    }
    #[test]
    fn fast_rotation_triggers_propagation() {
        let mut filter = level_filter();
        let imu = ImuSample::from_rates(4000, Vector3::new(0.0, 0.0, 30.0), Vector3::new(0.0, 0.0, -G), 0.004);
        filter.predict(&imu).unwrap();
        assert_eq!(filter.pending_dt(), 0.0);
    }
    #[test]
    fn accepted_update_keeps_covariance_symmetric_and_psd() {
        let mut filter = level_filter();
        for i in 1..=50 {
            filter.predict(&rest_imu(i * 4000)).unwrap();
        }
        let velocity = VelocityMeasurement {
            channel: Channel::GnssVelocity,
            velocity: Vector3::new(0.1, -0.1, 0.05),
            horizontal_noise_std: 0.5,
            vertical_noise_std: 0.7,
        };
        let obs = Observation::new(&velocity, filter.state(), 5.0);
        let report = filter.fuse(&obs).unwrap();
        assert_eq!(report.outcome, FusionOutcome::Accepted);
        let p = filter.covariance();
        assert!((p - p.transpose()).amax() < 1e-12);
        assert!(min_eigenvalue(p) > -1e-9);
        assert_approx_eq!(filter.state().attitude.coords.norm(), 1.0, 1e-12);
        assert!(filter.state().velocity[0] > 0.0);
    }
    #[test]
    fn rejection_is_a_no_op() {
        let mut filter = level_filter();
        let state = *filter.state();
        let covariance = filter.covariance().clone();
        let report = filter.fuse(&height(-100.0)).unwrap();
        assert!(matches!(report.outcome, FusionOutcome::Rejected { test_ratio } if test_ratio > 1.0));
        assert_eq!(*filter.state(), state);
        assert_eq!(*filter.covariance(), covariance);
    }
    #[test]
    fn joint_gate_rejects_whole_sample() {
        let mut filter = level_filter();
        let state = *filter.state();
        // north is consistent, down is not
        let velocity = VelocityMeasurement {
            channel: Channel::GnssVelocity,
            velocity: Vector3::new(0.1, 0.0, 50.0),
            horizontal_noise_std: 0.5,
            vertical_noise_std: 0.5,
        };
        let obs = Observation::new(&velocity, filter.state(), 5.0);
        let report = filter.fuse(&obs).unwrap();
        assert!(!report.outcome.is_accepted());
        assert_eq!(*filter.state(), state);
        let record = report.record(7);
        assert_eq!(record.dimension, 3);
        assert!(!record.accepted);
    }
    #[test]
    fn degenerate_variance_is_detected() {
        let mut filter = level_filter();
        filter.covariance[(8, 8)] = -1.0;
        let state = *filter.state();
        let report = filter.fuse(&height(-1.0)).unwrap();
        assert_eq!(report.outcome, FusionOutcome::Degenerate);
        assert_eq!(*filter.state(), state);
    }
    #[test]
    fn height_update_moves_down_position() {
        let mut filter = level_filter();
        let report = filter.fuse(&height(-2.0)).unwrap();
        assert!(report.outcome.is_accepted());
        // prior variance 4, observation variance 0.25
        assert_approx_eq!(filter.state().position[2], -2.0 * 4.0 / 4.25, 1e-9);
        assert_approx_eq!(filter.variance(8), 4.0 * 0.25 / 4.25, 1e-9);
    }
    #[test]
    fn magnetic_mask_protects_other_states() {
        let config = EstimatorConfig::default();
        let state = NavigationState {
            mag_earth: Vector3::new(0.2, 0.0, 0.4),
            ..Default::default()
        };
        let mut filter = CoreEstimator::new(&config, state, 0);
        let mag = MagFieldMeasurement {
            field: Vector3::new(0.2, 0.05, 0.4),
            noise_std: 0.05,
        };
        let obs = Observation::new(&mag, filter.state(), 5.0).with_mask(StateMask::MagneticOnly);
        let report = filter.fuse(&obs).unwrap();
        assert!(report.outcome.is_accepted());
        assert!(filter.state().attitude.angle() < 1e-15);
        assert!(filter.state().mag_earth[1] != 0.0 || filter.state().mag_body[1] != 0.0);
    }
    #[test]
    fn inhibited_accel_bias_is_not_learned() {
        let mut config = EstimatorConfig::default();
        config.aiding.inhibit_accel_bias = true;
        let mut filter = CoreEstimator::new(&config, NavigationState::default(), 0);
        for i in 1..=100 {
            filter.predict(&rest_imu(i * 4000)).unwrap();
        }
        filter.fuse(&height(-0.5)).unwrap();
        assert_eq!(filter.state().accel_bias, Vector3::zeros());
    }
    #[test]
    fn yaw_reset_delta_reproduces_new_attitude() {
        let config = EstimatorConfig::default();
        let state = NavigationState {
            attitude: UnitQuaternion::from_euler_angles(0.1, 0.05, 0.3),
            ..Default::default()
        };
        let mut filter = CoreEstimator::new(&config, state, 0);
        let delta = filter.reset_yaw(-1.2, 0.01);
        let replayed = delta.attitude * state.attitude;
        assert_approx_eq!(replayed.angle_to(&filter.state().attitude), 0.0, 1e-12);
        let (roll, pitch, yaw) = filter.state().attitude.euler_angles();
        assert_approx_eq!(roll, 0.1, 1e-12);
        assert_approx_eq!(pitch, 0.05, 1e-12);
        assert_approx_eq!(yaw, -1.2, 1e-12);
        assert_eq!(filter.variance(2), 0.01);
    }
    #[test]
    fn position_and_velocity_resets() {
        let mut filter = level_filter();
        let delta = filter.reset_horizontal_position(Vector2::new(3.0, -4.0), 1.0);
        assert_eq!(delta.position, Vector3::new(3.0, -4.0, 0.0));
        let delta = filter.reset_vertical_velocity(0.5, 0.25);
        assert_eq!(delta.velocity, Vector3::new(0.0, 0.0, 0.5));
        assert_eq!(filter.state().velocity[2], 0.5);
        assert_eq!(filter.variance(5), 0.25);
    }
    #[test]
    fn wind_states_zeroed_when_inactive() {
        let mut filter = level_filter();
        filter.set_active_states(ActiveStates {
            mag: false,
            wind: true,
        });
        filter.reset_wind(Vector2::new(3.0, 0.0), 1.0);
        for i in 1..=10 {
            filter.predict(&rest_imu(i * 4000)).unwrap();
        }
        assert!(filter.variance(WIND.start) > 1.0);
        filter.set_active_states(ActiveStates::default());
        assert_eq!(filter.variance(WIND.start), 0.0);
    }
    #[test]
    fn mag_covariance_save_and_restore() {
        let mut filter = level_filter();
        let saved = filter.mag_covariance();
        filter.reset_mag_field(Vector3::new(0.2, 0.0, 0.4), Vector3::zeros(), 1e-2);
        assert_eq!(filter.variance(MAG_EARTH.start), 1e-2);
        filter.restore_mag_covariance(&saved);
        assert_eq!(filter.mag_covariance(), saved);
    }
    #[test]
    fn heading_fusion_turns_the_attitude() {
        let mut filter = level_filter();
        let heading = HeadingMeasurement {
            channel: Channel::MagHeading,
            yaw: 0.2,
            noise_std: 0.05,
        };
        let obs = Observation::new(&heading, filter.state(), 5.0);
        filter.fuse(&obs).unwrap();
        assert!(filter.state().yaw() > 0.15);
        assert_approx_eq!(filter.state().attitude.coords.norm(), 1.0, 1e-12);
    }
    #[test]
    fn infinite_variance_fails_the_gate() {
        let mut filter = level_filter();
        filter.covariance[(8, 8)] = f64::INFINITY;
        let state = *filter.state();
        assert!(matches!(
            filter.fuse(&height(-1.0)),
            Err(EstimatorError::NumericalFailure { .. })
        ));
        assert_eq!(*filter.state(), state);
    }

    #[test]
    fn clamping_does_not_hide_an_infinite_variance() {
        let mut filter = level_filter();
        filter.covariance[(3, 3)] = f64::INFINITY;
        filter.predict(&rest_imu(4000)).unwrap();
        assert!(matches!(
            filter.propagate_covariance(),
            Err(EstimatorError::NumericalFailure { .. })
        ));
        assert!(!is_finite(filter.covariance()));
    }

    #[test]
    fn diverging_state_is_fatal() {
        let mut filter = level_filter();
        let imu = ImuSample::from_rates(4000, Vector3::zeros(), Vector3::new(1e300, 0.0, -G), 0.004);
        assert!(matches!(
            filter.predict(&imu),
            Err(EstimatorError::NumericalFailure { .. })
        ));
    }

    #[test]
    fn non_finite_input_is_fatal() {
        let mut filter = level_filter();
        let imu = ImuSample::from_rates(4000, Vector3::new(f64::NAN, 0.0, 0.0), Vector3::zeros(), 0.004);
        assert!(matches!(
            filter.predict(&imu),
            Err(EstimatorError::NumericalFailure { .. })
        ));
    }
}
