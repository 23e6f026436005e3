//! Delayed-horizon navigation estimator
//!
//! This crate implements the onboard state estimator of an autonomous vehicle. It fuses asynchronous,
//! delayed and heterogeneous sensor streams (inertial, GNSS, barometric, magnetic, range finder, optical
//! flow, visual odometry and airspeed) into one consistent navigation state at the inertial sample rate,
//! while surviving individual sensor dropout, noise and disagreement.
//!
//! The estimator is an error-state extended Kalman filter that runs on a *delayed* time horizon: every
//! sensor sample is held in a per-sensor ring buffer until the filter's own inertial time has caught up
//! with the sample's time of validity, so measurements are always fused against the state they actually
//! observed. An output predictor re-integrates the newest inertial samples on top of the delayed estimate
//! to publish an undelayed solution to the vehicle's controllers.
//!
//! This crate is built on top of:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): linear algebra for the filter and mechanization.
//! - [`serde`](https://crates.io/crates/serde): configuration files (JSON, YAML and TOML).
//! - [`log`](https://crates.io/crates/log): mode changes, resets and faults are logged through the `log` facade.
//! - [`thiserror`](https://crates.io/crates/thiserror): the estimator error type.
//!
//! ## Crate overview
//!
//! - [earth]: gravity and Earth-rate models and the local map projection.
//! - [linalg]: covariance hygiene utilities.
//! - [linearize]: analytic Jacobians for the error-state transition and measurement models.
//! - [messages]: sensor sample types pushed by driver collaborators.
//! - [buffer]: per-sensor ring buffers and the time-horizon synchronizer.
//! - [measurements]: observation models that map the navigation state into sensor space.
//! - [ekf]: the core estimator (prediction, gated fusion, state resets).
//! - [health]: debounced channel health tracking.
//! - [status]: control and fault status, innovation records, reset deltas and events.
//! - [control]: the fusion mode controller (one state machine per aiding channel).
//! - [output]: the output predictor.
//! - [estimator]: the owning object that ties the pieces together, one cycle per inertial sample.
//! - [config]: estimator configuration.
//!
//! ## Strapdown mechanization
//!
//! The inertial measurement unit delivers integrated increments: a delta angle $\Delta\theta$ and a delta
//! velocity $\Delta v$ over the sample interval $\Delta t$. After removing the estimated biases the attitude
//! quaternion is advanced with the rotation vector increment,
//!
//! $$
//! q_b^n(+) = q_b^n(-) \otimes \exp\left(\tfrac{1}{2}(\Delta\theta - b_g \Delta t - C_n^b \omega_{ie}^n \Delta t)\right)
//! $$
//!
//! the specific force increment is rotated into the navigation frame with the mid-interval attitude and
//! gravity is added,
//!
//! $$
//! v^n(+) = v^n(-) + C_b^n(\tfrac{1}{2})\,(\Delta v - b_a \Delta t) + g^n \Delta t
//! $$
//!
//! and position is integrated with the trapezoidal rule $p^n(+) = p^n(-) + \tfrac{1}{2}(v^n(-) + v^n(+))\Delta t$.
//! This is the flat-Earth local-level form of Groves' Chapter 5.4 mechanization; transport rate is
//! neglected because the navigation frame is fixed at the origin.
pub mod buffer;
pub mod config;
pub mod control;
pub mod earth;
pub mod ekf;
pub mod error;
pub mod estimator;
pub mod health;
pub mod linalg;
pub mod linearize;
pub mod measurements;
pub mod messages;
pub mod output;
pub mod status;

pub use config::EstimatorConfig;
pub use error::{EstimatorError, EstimatorResult};
pub use estimator::Estimator;

use nalgebra::{Rotation3, UnitQuaternion, Vector2, Vector3};

use std::fmt::{self, Debug, Display};

/// Integrated inertial increment delivered by the IMU collaborator.
///
/// The vectors are in the body frame and are the raw integrals of angular rate and specific force over
/// the sample interval (i.e. gravity is *not* removed). Samples are never mutated after creation.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ImuSample {
    /// Time stamp at the end of the integration interval, microseconds
    pub time_us: u64,
    /// Integrated angular rate, radians, body frame x, y, z axis
    pub delta_angle: Vector3<f64>,
    /// Integrated specific force, m/s, body frame x, y, z axis
    pub delta_velocity: Vector3<f64>,
    /// Integration interval in seconds
    pub dt: f64,
}
impl Display for ImuSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ImuSample {{ t: {} us, dang: [{:.5}, {:.5}, {:.5}], dvel: [{:.4}, {:.4}, {:.4}], dt: {:.4} }}",
            self.time_us,
            self.delta_angle[0],
            self.delta_angle[1],
            self.delta_angle[2],
            self.delta_velocity[0],
            self.delta_velocity[1],
            self.delta_velocity[2],
            self.dt
        )
    }
}
impl ImuSample {
    /// Construct a sample from body rates (rad/s) and specific force (m/s^2) held over `dt`.
    pub fn from_rates(time_us: u64, gyro: Vector3<f64>, accel: Vector3<f64>, dt: f64) -> Self {
        ImuSample {
            time_us,
            delta_angle: gyro * dt,
            delta_velocity: accel * dt,
            dt,
        }
    }
    /// Mean specific force over the interval, m/s^2
    pub fn specific_force(&self) -> Vector3<f64> {
        if self.dt > 0.0 {
            self.delta_velocity / self.dt
        } else {
            Vector3::zeros()
        }
    }
    pub fn is_finite(&self) -> bool {
        self.dt.is_finite()
            && self.delta_angle.iter().all(|v| v.is_finite())
            && self.delta_velocity.iter().all(|v| v.is_finite())
    }
}

/// The navigation state owned by one core estimator instance.
///
/// Position and velocity are expressed in the local NED frame anchored at the navigation origin. The
/// magnetic field states are in gauss; the earth field is expressed in NED and the body field is the
/// sensor's hard-iron bias in body axes. Wind and the magnetic states are always present but are only
/// estimated while the corresponding fusion mode is active.
#[derive(Clone, Copy, PartialEq)]
pub struct NavigationState {
    /// Body to NED rotation
    pub attitude: UnitQuaternion<f64>,
    /// NED velocity, m/s
    pub velocity: Vector3<f64>,
    /// NED position relative to the origin, m
    pub position: Vector3<f64>,
    /// Gyro bias, rad/s
    pub gyro_bias: Vector3<f64>,
    /// Accelerometer bias, m/s^2
    pub accel_bias: Vector3<f64>,
    /// Earth magnetic field, NED, gauss
    pub mag_earth: Vector3<f64>,
    /// Body magnetic field bias, gauss
    pub mag_body: Vector3<f64>,
    /// Horizontal wind velocity, NE, m/s
    pub wind: Vector2<f64>,
    /// Vertical position of the terrain below the vehicle, NED down, m
    pub terrain_down: f64,
}
impl Default for NavigationState {
    fn default() -> Self {
        NavigationState {
            attitude: UnitQuaternion::identity(),
            velocity: Vector3::zeros(),
            position: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
            mag_earth: Vector3::zeros(),
            mag_body: Vector3::zeros(),
            wind: Vector2::zeros(),
            terrain_down: 0.0,
        }
    }
}
impl Debug for NavigationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.attitude.euler_angles();
        f.debug_struct("NavigationState")
            .field(
                "attitude (roll, pitch, yaw in deg)",
                &format_args!(
                    "[{:.2}, {:.2}, {:.2}]",
                    roll.to_degrees(),
                    pitch.to_degrees(),
                    yaw.to_degrees()
                ),
            )
            .field("velocity (m/s)", &self.velocity.as_slice())
            .field("position (m)", &self.position.as_slice())
            .field("gyro_bias (rad/s)", &self.gyro_bias.as_slice())
            .field("accel_bias (m/s^2)", &self.accel_bias.as_slice())
            .field("mag_earth (gauss)", &self.mag_earth.as_slice())
            .field("mag_body (gauss)", &self.mag_body.as_slice())
            .field("wind (m/s)", &self.wind.as_slice())
            .field("terrain_down (m)", &self.terrain_down)
            .finish()
    }
}
impl Display for NavigationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.attitude.euler_angles();
        write!(
            f,
            "NavigationState {{ p: [{:.2}, {:.2}, {:.2}] m, v: [{:.3}, {:.3}, {:.3}] m/s, attitude: [{:.2} deg, {:.2} deg, {:.2} deg] }}",
            self.position[0],
            self.position[1],
            self.position[2],
            self.velocity[0],
            self.velocity[1],
            self.velocity[2],
            roll.to_degrees(),
            pitch.to_degrees(),
            yaw.to_degrees()
        )
    }
}
impl NavigationState {
    /// Body to NED rotation matrix
    pub fn rotation(&self) -> Rotation3<f64> {
        self.attitude.to_rotation_matrix()
    }
    /// 3-2-1 yaw angle in radians
    pub fn yaw(&self) -> f64 {
        self.attitude.euler_angles().2
    }
    /// Height above the terrain estimate, m
    pub fn height_above_ground(&self) -> f64 {
        self.terrain_down - self.position[2]
    }
    pub fn is_finite(&self) -> bool {
        self.attitude.coords.iter().all(|v| v.is_finite())
            && self.velocity.iter().all(|v| v.is_finite())
            && self.position.iter().all(|v| v.is_finite())
            && self.gyro_bias.iter().all(|v| v.is_finite())
            && self.accel_bias.iter().all(|v| v.is_finite())
            && self.mag_earth.iter().all(|v| v.is_finite())
            && self.mag_body.iter().all(|v| v.is_finite())
            && self.wind.iter().all(|v| v.is_finite())
            && self.terrain_down.is_finite()
    }
}

/// Bias-corrected increment produced by one mechanization step.
///
/// The core estimator accumulates these between covariance propagations and the fusion mode controller
/// uses them to monitor vehicle excitation.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InertialIncrement {
    /// Corrected delta angle, body frame, rad
    pub delta_angle: Vector3<f64>,
    /// Corrected delta velocity, body frame, m/s
    pub delta_velocity: Vector3<f64>,
    /// Corrected specific force increment rotated into NED (gravity not included), m/s
    pub delta_velocity_nav: Vector3<f64>,
    pub dt: f64,
}

/// Local-level strapdown mechanization for one inertial sample.
///
/// Advances attitude, velocity and position of `state` in place and returns the corrected increment.
/// Gravity is positive down; `earth_rate` is the Earth rotation rate in NED (zero before a navigation
/// origin is known).
///
/// # Arguments
/// * `state` - the navigation state to propagate
/// * `imu` - the inertial sample
/// * `gravity` - local gravity magnitude in m/s^2
/// * `earth_rate` - Earth rotation rate in the NED frame, rad/s
///
/// # Example
/// ```rust
/// use navfuse::{ImuSample, NavigationState, forward};
/// use nalgebra::Vector3;
/// let mut state = NavigationState::default();
/// // level and at rest: the accelerometer senses the reaction to gravity
/// let imu = ImuSample::from_rates(0, Vector3::zeros(), Vector3::new(0.0, 0.0, -9.80665), 0.01);
/// forward(&mut state, &imu, 9.80665, &Vector3::zeros());
/// assert!(state.velocity.norm() < 1e-12);
/// ```
pub fn forward(
    state: &mut NavigationState,
    imu: &ImuSample,
    gravity: f64,
    earth_rate: &Vector3<f64>,
) -> InertialIncrement {
    let earth_rate_body = state.attitude.inverse_transform_vector(earth_rate);
    let delta_angle = imu.delta_angle - state.gyro_bias * imu.dt - earth_rate_body * imu.dt;
    let delta_velocity = imu.delta_velocity - state.accel_bias * imu.dt;
    let attitude_mid = state.attitude * UnitQuaternion::from_scaled_axis(delta_angle * 0.5);
    let mut attitude = state.attitude * UnitQuaternion::from_scaled_axis(delta_angle);
    attitude.renormalize();
    let delta_velocity_nav = attitude_mid.transform_vector(&delta_velocity);
    let velocity_prev = state.velocity;
    state.velocity += delta_velocity_nav + Vector3::new(0.0, 0.0, gravity * imu.dt);
    state.position += 0.5 * (velocity_prev + state.velocity) * imu.dt;
    state.attitude = attitude;
    InertialIncrement {
        delta_angle,
        delta_velocity,
        delta_velocity_nav,
        dt: imu.dt,
    }
}
/// Replace the yaw of a 3-2-1 attitude while keeping roll and pitch.
pub fn attitude_with_yaw(attitude: &UnitQuaternion<f64>, yaw: f64) -> UnitQuaternion<f64> {
    let (roll, pitch, _) = attitude.euler_angles();
    UnitQuaternion::from_euler_angles(roll, pitch, yaw)
}
/// Wrap an angle to the range $-\pi$ to $\pi$ radians
///
/// This function is generic and can be used with any type that implements the necessary traits.
///
/// # Example
/// ```rust
/// use navfuse::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped_angle = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped_angle + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi<T>(angle: T) -> T
where
    T: PartialOrd + Copy + std::ops::SubAssign + std::ops::AddAssign + From<f64>,
{
    let mut wrapped: T = angle;
    while wrapped > T::from(std::f64::consts::PI) {
        wrapped -= T::from(2.0 * std::f64::consts::PI);
    }
    while wrapped < T::from(-std::f64::consts::PI) {
        wrapped += T::from(2.0 * std::f64::consts::PI);
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    const G: f64 = earth::STANDARD_GRAVITY;

    #[test]
    fn rest_is_stationary() {
        let mut state = NavigationState::default();
        let imu = ImuSample::from_rates(0, Vector3::zeros(), Vector3::new(0.0, 0.0, -G), 0.004);
        for _ in 0..1000 {
            forward(&mut state, &imu, G, &Vector3::zeros());
        }
        assert_approx_eq!(state.velocity.norm(), 0.0, 1e-9);
        assert_approx_eq!(state.position.norm(), 0.0, 1e-9);
    }
    #[test]
    fn free_fall() {
        let mut state = NavigationState::default();
        let imu = ImuSample::from_rates(0, Vector3::zeros(), Vector3::zeros(), 0.01);
        for _ in 0..100 {
            forward(&mut state, &imu, G, &Vector3::zeros());
        }
        assert_approx_eq!(state.velocity[2], G, 1e-9);
        assert_approx_eq!(state.position[2], 0.5 * G, 1e-9);
    }
    #[test]
    fn constant_yaw_rate() {
        let mut state = NavigationState::default();
        let imu = ImuSample::from_rates(
            0,
            Vector3::new(0.0, 0.0, 0.5),
            Vector3::new(0.0, 0.0, -G),
            0.01,
        );
        for _ in 0..100 {
            forward(&mut state, &imu, G, &Vector3::zeros());
        }
        assert_approx_eq!(state.yaw(), 0.5, 1e-9);
        assert_approx_eq!(state.attitude.coords.norm(), 1.0, 1e-12);
    }
    #[test]
    fn biases_are_removed() {
        let mut state = NavigationState {
            gyro_bias: Vector3::new(0.0, 0.0, 0.01),
            accel_bias: Vector3::new(0.1, 0.0, 0.0),
            ..Default::default()
        };
        let imu = ImuSample::from_rates(
            0,
            Vector3::new(0.0, 0.0, 0.01),
            Vector3::new(0.1, 0.0, -G),
            0.01,
        );
        let increment = forward(&mut state, &imu, G, &Vector3::zeros());
        assert_approx_eq!(increment.delta_angle.norm(), 0.0, 1e-15);
        assert_approx_eq!(state.velocity.norm(), 0.0, 1e-12);
    }
    #[test]
    fn yaw_replacement_keeps_tilt() {
        let attitude = UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3);
        let replaced = attitude_with_yaw(&attitude, -1.0);
        let (roll, pitch, yaw) = replaced.euler_angles();
        assert_approx_eq!(roll, 0.1, 1e-12);
        assert_approx_eq!(pitch, -0.2, 1e-12);
        assert_approx_eq!(yaw, -1.0, 1e-12);
    }
    #[test]
    fn wrap_to_pi() {
        assert_approx_eq!(super::wrap_to_pi(3.0 * PI), PI, 1e-12);
        assert_approx_eq!(super::wrap_to_pi(-1.5 * PI), 0.5 * PI, 1e-12);
        assert_approx_eq!(super::wrap_to_pi(0.25_f64), 0.25_f64);
    }
    #[test]
    fn height_above_ground() {
        let state = NavigationState {
            position: Vector3::new(0.0, 0.0, -4.0),
            terrain_down: 1.0,
            ..Default::default()
        };
        assert_approx_eq!(state.height_above_ground(), 5.0);
    }
}
