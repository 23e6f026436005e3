//! Output predictor
//!
//! The core estimator runs on the delayed time horizon, so its state is up to the largest sensor
//! delay old. The output predictor integrates every inertial sample as it arrives, on top of the
//! corrected core state, and publishes that undelayed solution.
//!
//! Each integrated sample is kept in a history arena of the same depth as the inertial buffer. When
//! the core has processed an inertial sample, the history entry with the same time is compared with
//! the core state and the difference is fed back:
//!
//! - attitude through a delta-angle correction added to every following inertial sample,
//! - velocity and position through complementary gains `dt / tau`, added to every history entry and
//!   to the published output.
//!
//! A state reset applied by the core is replayed over the whole arena with [`OutputPredictor::apply_reset`]
//! so the published solution moves by exactly the same amount and the feedback loop sees no step.

use std::fmt::{self, Display};

use nalgebra::{UnitQuaternion, Vector3};

use crate::buffer::RingBuffer;
use crate::config::EstimatorConfig;
use crate::messages::Timestamped;
use crate::status::ResetDelta;
use crate::{ImuSample, NavigationState, forward};

/// Upper limit of the complementary filter time constants, s
const MAX_TAU_S: f64 = 10.0;

/// One published navigation solution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputSample {
    pub time_us: u64,
    pub attitude: UnitQuaternion<f64>,
    /// NED velocity, m/s
    pub velocity: Vector3<f64>,
    /// NED position relative to the origin, m
    pub position: Vector3<f64>,
}
impl Default for OutputSample {
    fn default() -> Self {
        OutputSample {
            time_us: 0,
            attitude: UnitQuaternion::identity(),
            velocity: Vector3::zeros(),
            position: Vector3::zeros(),
        }
    }
}
impl Timestamped for OutputSample {
    fn time_us(&self) -> u64 {
        self.time_us
    }
    fn set_time_us(&mut self, time_us: u64) {
        self.time_us = time_us;
    }
}
impl Display for OutputSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.attitude.euler_angles();
        write!(
            f,
            "OutputSample {{ t: {} us, rpy: [{:.2}, {:.2}, {:.2}] deg, v: [{:.3}, {:.3}, {:.3}], p: [{:.3}, {:.3}, {:.3}] }}",
            self.time_us,
            roll.to_degrees(),
            pitch.to_degrees(),
            yaw.to_degrees(),
            self.velocity[0],
            self.velocity[1],
            self.velocity[2],
            self.position[0],
            self.position[1],
            self.position[2]
        )
    }
}
impl OutputSample {
    fn from_state(time_us: u64, state: &NavigationState) -> Self {
        OutputSample {
            time_us,
            attitude: state.attitude,
            velocity: state.velocity,
            position: state.position,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OutputPredictor {
    history: RingBuffer<OutputSample>,
    output: OutputSample,
    gyro_bias: Vector3<f64>,
    accel_bias: Vector3<f64>,
    gravity: f64,
    earth_rate: Vector3<f64>,
    /// Body-frame correction added to every delta angle
    delta_angle_correction: Vector3<f64>,
    velocity_tau_s: f64,
    position_tau_s: f64,
    imu_interval_s: f64,
}

impl OutputPredictor {
    pub fn new(config: &EstimatorConfig) -> Self {
        OutputPredictor {
            history: RingBuffer::with_capacity(config.imu_buffer_length()),
            output: OutputSample::default(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
            gravity: crate::earth::STANDARD_GRAVITY,
            earth_rate: Vector3::zeros(),
            delta_angle_correction: Vector3::zeros(),
            velocity_tau_s: config.output.velocity_tau_s,
            position_tau_s: config.output.position_tau_s,
            imu_interval_s: config.imu_interval_s(),
        }
    }
    /// The most recent published solution
    pub fn output(&self) -> &OutputSample {
        &self.output
    }
    /// Buffered solutions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &OutputSample> + '_ {
        self.history.iter()
    }
    pub fn set_biases(&mut self, gyro_bias: Vector3<f64>, accel_bias: Vector3<f64>) {
        self.gyro_bias = gyro_bias;
        self.accel_bias = accel_bias;
    }
    pub fn set_earth_model(&mut self, gravity: f64, earth_rate: Vector3<f64>) {
        self.gravity = gravity;
        self.earth_rate = earth_rate;
    }

    /// Integrate one undelayed inertial sample and publish the result.
    pub fn update(&mut self, imu: &ImuSample) -> OutputSample {
        let mut state = NavigationState {
            attitude: self.output.attitude,
            velocity: self.output.velocity,
            position: self.output.position,
            gyro_bias: self.gyro_bias,
            accel_bias: self.accel_bias,
            ..Default::default()
        };
        let corrected = ImuSample {
            delta_angle: imu.delta_angle + self.delta_angle_correction,
            ..*imu
        };
        forward(&mut state, &corrected, self.gravity, &self.earth_rate);
        self.output = OutputSample::from_state(imu.time_us, &state);
        self.history.push(self.output);
        self.output
    }

    /// Feed the core state at the delayed horizon back into the published solution.
    pub fn correct(&mut self, core: &NavigationState, core_time_us: u64) {
        while self
            .history
            .oldest()
            .is_some_and(|sample| sample.time_us < core_time_us)
        {
            self.history.pop_oldest();
        }
        let Some(delayed) = self.history.oldest().copied() else {
            return;
        };
        let dt = self.imu_interval_s;

        let error = delayed.attitude.inverse() * core.attitude;
        let delay_s = (self.output.time_us.saturating_sub(core_time_us) as f64 * 1e-6).max(dt);
        self.delta_angle_correction = error.scaled_axis() * (0.5 * dt / delay_s);

        let velocity_gain = dt / self.velocity_tau_s.max(dt).min(MAX_TAU_S);
        let position_gain = dt / self.position_tau_s.max(dt).min(MAX_TAU_S);
        let velocity_correction = (core.velocity - delayed.velocity) * velocity_gain;
        let position_correction = (core.position - delayed.position) * position_gain;
        self.history.apply_to_all(|sample| {
            sample.velocity += velocity_correction;
            sample.position += position_correction;
        });
        self.output.velocity += velocity_correction;
        self.output.position += position_correction;
    }

    /// Replay a core state reset over the whole history and the published solution.
    pub fn apply_reset(&mut self, delta: &ResetDelta) {
        self.history.apply_to_all(|sample| {
            delta.apply(&mut sample.attitude, &mut sample.velocity, &mut sample.position)
        });
        delta.apply(
            &mut self.output.attitude,
            &mut self.output.velocity,
            &mut self.output.position,
        );
    }

    /// Restart the history at the core state and re-integrate the inertial samples newer than it.
    pub fn align<'a, I>(&mut self, core: &NavigationState, core_time_us: u64, newer: I)
    where
        I: IntoIterator<Item = &'a ImuSample>,
    {
        self.history.clear();
        self.delta_angle_correction = Vector3::zeros();
        self.gyro_bias = core.gyro_bias;
        self.accel_bias = core.accel_bias;
        self.output = OutputSample::from_state(core_time_us, core);
        self.history.push(self.output);
        for imu in newer {
            if imu.time_us > core_time_us {
                self.update(imu);
            }
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.output = OutputSample::default();
        self.delta_angle_correction = Vector3::zeros();
        self.gyro_bias = Vector3::zeros();
        self.accel_bias = Vector3::zeros();
    }
}
