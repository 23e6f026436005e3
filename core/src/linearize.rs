//! Jacobian and linearization utilities for the error-state filter
//!
//! This module provides the analytic Jacobians of the strapdown error dynamics and of every
//! measurement model, together with the routine that injects an error-state correction back into the
//! nominal [`NavigationState`].
//!
//! # State Ordering
//!
//! The 23-element error state follows the ordering:
//! ```text
//! δx = [δθ (3), δv (3), δp (3), δb_g (3), δb_a (3), δm_I (3), δm_B (3), δw (2)]
//! ```
//! where:
//! - `δθ`: attitude error, a small rotation expressed in the NED frame, rad
//! - `δv`, `δp`: NED velocity (m/s) and position (m) errors
//! - `δb_g`, `δb_a`: gyro (rad/s) and accelerometer (m/s²) bias errors
//! - `δm_I`, `δm_B`: earth (NED) and body magnetic field errors, gauss
//! - `δw`: north and east wind errors, m/s
//!
//! The attitude error is defined on the left, $q_{true} = \exp(\delta\theta) \otimes q$, so the
//! corrected attitude after a measurement update is $q \leftarrow \exp(\delta\theta) \otimes q$.
//!
//! # Error dynamics
//!
//! Over a batched propagation interval $\Delta t$ with accumulated navigation-frame specific force
//! increment $\Delta v^n = \sum C_b^n \Delta v^b$:
//!
//! ```text
//! F = I + | 0          0   0     -C dt   0      |
//!         | -[Δv^n]x   0   0      0     -C dt   |
//!         | 0          I dt 0     0      0      |
//! ```
//! where the remaining (bias, magnetic, wind) blocks are random walks.
//!
//! # References
//!
//! - Sola, J. "Quaternion kinematics for the error-state Kalman filter" (2017), Section 7 (global
//!   angular error)
//! - Groves 2nd ed., Section 14.2.4

use std::ops::Range;

use nalgebra::{DMatrix, DVector, Matrix3, UnitQuaternion, Vector3};

use crate::NavigationState;
use crate::config::ProcessNoise;
use crate::earth::vector_to_skew_symmetric;

pub const STATE_DIM: usize = 23;
pub const ATTITUDE: Range<usize> = 0..3;
pub const VELOCITY: Range<usize> = 3..6;
pub const POSITION: Range<usize> = 6..9;
pub const GYRO_BIAS: Range<usize> = 9..12;
pub const ACCEL_BIAS: Range<usize> = 12..15;
pub const MAG_EARTH: Range<usize> = 15..18;
pub const MAG_BODY: Range<usize> = 18..21;
pub const WIND: Range<usize> = 21..23;

fn set_block(m: &mut DMatrix<f64>, row: usize, col: usize, block: &Matrix3<f64>) {
    m.fixed_view_mut::<3, 3>(row, col).copy_from(block);
}

/// Error-state transition matrix over one batched propagation interval.
///
/// # Arguments
/// * `rotation` - body to NED rotation at the end of the interval
/// * `delta_velocity_nav` - accumulated specific force increment in NED (gravity excluded), m/s
/// * `dt` - length of the interval, s
///
/// # Returns
/// 23×23 transition matrix F
///
/// # Example
/// ```rust
/// use navfuse::linearize::{state_transition_jacobian, STATE_DIM};
/// use nalgebra::{Matrix3, Vector3};
/// let f = state_transition_jacobian(&Matrix3::identity(), &Vector3::new(0.0, 0.0, -0.196), 0.02);
/// assert_eq!(f.nrows(), STATE_DIM);
/// assert!((f[(6, 3)] - 0.02).abs() < 1e-12);
/// ```
pub fn state_transition_jacobian(
    rotation: &Matrix3<f64>,
    delta_velocity_nav: &Vector3<f64>,
    dt: f64,
) -> DMatrix<f64> {
    let mut f = DMatrix::<f64>::identity(STATE_DIM, STATE_DIM);
    set_block(&mut f, ATTITUDE.start, GYRO_BIAS.start, &(-rotation * dt));
    set_block(
        &mut f,
        VELOCITY.start,
        ATTITUDE.start,
        &(-vector_to_skew_symmetric(delta_velocity_nav)),
    );
    set_block(&mut f, VELOCITY.start, ACCEL_BIAS.start, &(-rotation * dt));
    set_block(
        &mut f,
        POSITION.start,
        VELOCITY.start,
        &(Matrix3::identity() * dt),
    );
    f
}

/// Which optional state groups receive process noise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActiveStates {
    pub mag: bool,
    pub wind: bool,
}

/// Diagonal of the process noise covariance for one batched interval.
///
/// The IMU noises are white noise on each inertial sample of length `imu_dt`, so their variance
/// over the interval is `σ² · dt · imu_dt`. Bias, magnetic and wind states are random walks with
/// variance `(σ · dt)²`. Inactive magnetic and wind states receive no noise.
pub fn process_noise(
    noise: &ProcessNoise,
    accel_noise: f64,
    dt: f64,
    imu_dt: f64,
    active: ActiveStates,
) -> DVector<f64> {
    let mut q = DVector::<f64>::zeros(STATE_DIM);
    let gyro_var = noise.gyro.powi(2) * dt * imu_dt;
    let accel_var = accel_noise.powi(2) * dt * imu_dt;
    for i in ATTITUDE {
        q[i] = gyro_var;
    }
    for i in VELOCITY {
        q[i] = accel_var;
    }
    for i in GYRO_BIAS {
        q[i] = (noise.gyro_bias * dt).powi(2);
    }
    for i in ACCEL_BIAS {
        q[i] = (noise.accel_bias * dt).powi(2);
    }
    if active.mag {
        for i in MAG_EARTH {
            q[i] = (noise.mag_earth * dt).powi(2);
        }
        for i in MAG_BODY {
            q[i] = (noise.mag_body * dt).powi(2);
        }
    }
    if active.wind {
        for i in WIND {
            q[i] = (noise.wind * dt).powi(2);
        }
    }
    q
}

/// Jacobian of a measurement that directly observes the listed states.
pub fn selection_jacobian(states: &[usize]) -> DMatrix<f64> {
    let mut h = DMatrix::<f64>::zeros(states.len(), STATE_DIM);
    for (row, &state) in states.iter().enumerate() {
        h[(row, state)] = 1.0;
    }
    h
}

/// Jacobian of the 3-2-1 yaw angle `atan2(R10, R00)` with respect to the attitude error.
///
/// With $d = R_{00}^2 + R_{10}^2$ the attitude block is
/// $[-R_{00}R_{20}/d,\ -R_{10}R_{20}/d,\ 1]$; it degenerates to zero roll/pitch sensitivity when level.
pub fn heading_jacobian(rotation: &Matrix3<f64>) -> DMatrix<f64> {
    let mut h = DMatrix::<f64>::zeros(1, STATE_DIM);
    let d = rotation[(0, 0)].powi(2) + rotation[(1, 0)].powi(2);
    if d > 1e-12 {
        h[(0, 0)] = -rotation[(0, 0)] * rotation[(2, 0)] / d;
        h[(0, 1)] = -rotation[(1, 0)] * rotation[(2, 0)] / d;
    }
    h[(0, 2)] = 1.0;
    h
}

/// Jacobian of the body-frame field prediction $m = C_n^b m_I + m_B$.
pub fn mag_field_jacobian(state: &NavigationState) -> DMatrix<f64> {
    let rotation = state.rotation();
    let r_t = rotation.matrix().transpose();
    let mut h = DMatrix::<f64>::zeros(3, STATE_DIM);
    set_block(
        &mut h,
        0,
        ATTITUDE.start,
        &(r_t * vector_to_skew_symmetric(&state.mag_earth)),
    );
    set_block(&mut h, 0, MAG_EARTH.start, &r_t);
    set_block(&mut h, 0, MAG_BODY.start, &Matrix3::identity());
    h
}

/// Jacobian of the declination of the earth field, `atan2(m_E, m_N)`.
pub fn declination_jacobian(mag_earth: &Vector3<f64>) -> DMatrix<f64> {
    let mut h = DMatrix::<f64>::zeros(1, STATE_DIM);
    let d = mag_earth[0].powi(2) + mag_earth[1].powi(2);
    if d > 1e-12 {
        h[(0, MAG_EARTH.start)] = -mag_earth[1] / d;
        h[(0, MAG_EARTH.start + 1)] = mag_earth[0] / d;
    }
    h
}

/// Jacobian of the true airspeed `|v - w|` (wind has no vertical component).
pub fn airspeed_jacobian(state: &NavigationState) -> DMatrix<f64> {
    let mut h = DMatrix::<f64>::zeros(1, STATE_DIM);
    let relative = Vector3::new(
        state.velocity[0] - state.wind[0],
        state.velocity[1] - state.wind[1],
        state.velocity[2],
    );
    let speed = relative.norm();
    if speed > 1e-6 {
        for i in 0..3 {
            h[(0, VELOCITY.start + i)] = relative[i] / speed;
        }
        h[(0, WIND.start)] = -relative[0] / speed;
        h[(0, WIND.start + 1)] = -relative[1] / speed;
    }
    h
}

/// Jacobian of the optical flow line-of-sight rates with respect to velocity.
///
/// Predicted rates are `[v_b.y / range, -v_b.x / range]` with `v_b = C_n^b v`. Only the velocity
/// terms are kept.
pub fn flow_jacobian(state: &NavigationState, range: f64) -> DMatrix<f64> {
    let rotation = state.rotation();
    let r = rotation.matrix();
    let mut h = DMatrix::<f64>::zeros(2, STATE_DIM);
    for i in 0..3 {
        h[(0, VELOCITY.start + i)] = r[(i, 1)] / range;
        h[(1, VELOCITY.start + i)] = -r[(i, 0)] / range;
    }
    h
}

/// Apply an error-state correction to the nominal state.
///
/// The attitude correction is composed on the left and the quaternion is renormalized; every other
/// group is additive.
///
/// # Example
/// ```rust
/// use navfuse::NavigationState;
/// use navfuse::linearize::{apply_correction, STATE_DIM};
/// use nalgebra::DVector;
/// let mut state = NavigationState::default();
/// let mut dx = DVector::zeros(STATE_DIM);
/// dx[2] = 0.1; // yaw error
/// dx[8] = -1.0; // down position
/// apply_correction(&mut state, &dx);
/// assert!((state.yaw() - 0.1).abs() < 1e-12);
/// assert_eq!(state.position[2], -1.0);
/// ```
pub fn apply_correction(state: &mut NavigationState, dx: &DVector<f64>) {
    let dtheta = dx.fixed_rows::<3>(ATTITUDE.start).into_owned();
    let mut attitude = UnitQuaternion::from_scaled_axis(dtheta) * state.attitude;
    attitude.renormalize();
    state.attitude = attitude;
    state.velocity += dx.fixed_rows::<3>(VELOCITY.start);
    state.position += dx.fixed_rows::<3>(POSITION.start);
    state.gyro_bias += dx.fixed_rows::<3>(GYRO_BIAS.start);
    state.accel_bias += dx.fixed_rows::<3>(ACCEL_BIAS.start);
    state.mag_earth += dx.fixed_rows::<3>(MAG_EARTH.start);
    state.mag_body += dx.fixed_rows::<3>(MAG_BODY.start);
    state.wind += dx.fixed_rows::<2>(WIND.start);
}
