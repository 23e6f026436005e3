//! Observation models for the core estimator.
//!
//! Each sensor observation is a [`MeasurementModel`]: it knows its measured value and noise, how to
//! predict that value from a [`NavigationState`], and the Jacobian of that prediction with respect to
//! the 23-element error state (see [crate::linearize]). The fusion mode controller builds a model
//! from an aligned sensor sample and linearizes it into an [`Observation`], which is what the core
//! estimator actually fuses.
//!
//! Innovations are always *observed minus predicted*. Angular observations wrap their innovation
//! to $[-\pi, \pi]$.

use std::fmt::{self, Display};

use nalgebra::{DMatrix, DVector, Vector2, Vector3};

use crate::linearize::{
    MAG_BODY, MAG_EARTH, POSITION, VELOCITY, airspeed_jacobian,
    declination_jacobian, flow_jacobian, heading_jacobian, mag_field_jacobian, selection_jacobian,
};
use crate::status::Channel;
use crate::{NavigationState, wrap_to_pi};

/// Generic measurement model trait for all observations fused by the core estimator
pub trait MeasurementModel {
    /// Fusion channel the observation belongs to
    fn channel(&self) -> Channel;
    /// Get the dimension of the measurement vector
    fn dimension(&self) -> usize;
    /// Get the measurement in a vector format
    fn vector(&self) -> DVector<f64>;
    /// Observation noise variance of each axis
    fn noise(&self) -> DVector<f64>;
    /// Get the expected measurement from the state. Measurement model function that maps the state
    /// values to measurement space.
    fn expected_measurement(&self, state: &NavigationState) -> DVector<f64>;
    /// Jacobian of the expected measurement with respect to the error state
    fn jacobian(&self, state: &NavigationState) -> DMatrix<f64>;
    /// Observed minus predicted
    fn innovation(&self, state: &NavigationState) -> DVector<f64> {
        self.vector() - self.expected_measurement(state)
    }
}

/// Which states a fusion may correct.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StateMask {
    #[default]
    All,
    /// Only the earth and body magnetic field states
    MagneticOnly,
}
impl StateMask {
    pub fn allows(&self, state: usize) -> bool {
        match self {
            StateMask::All => true,
            StateMask::MagneticOnly => MAG_EARTH.contains(&state) || MAG_BODY.contains(&state),
        }
    }
}

/// A measurement model linearized about the current state, ready for fusion.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub channel: Channel,
    /// Observed minus predicted, per axis
    pub innovation: DVector<f64>,
    /// Observation noise variance, per axis
    pub noise: DVector<f64>,
    /// `dimension × 23` Jacobian
    pub jacobian: DMatrix<f64>,
    /// Innovation gate in standard deviations
    pub gate: f64,
    pub mask: StateMask,
}
impl Observation {
    pub fn new<M: MeasurementModel + ?Sized>(model: &M, state: &NavigationState, gate: f64) -> Self {
        Observation {
            channel: model.channel(),
            innovation: model.innovation(state),
            noise: model.noise(),
            jacobian: model.jacobian(state),
            gate,
            mask: StateMask::All,
        }
    }
    pub fn with_mask(mut self, mask: StateMask) -> Self {
        self.mask = mask;
        self
    }
    pub fn dimension(&self) -> usize {
        self.innovation.len()
    }
}

/// NED velocity, e.g. from a GNSS receiver.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VelocityMeasurement {
    pub channel: Channel,
    pub velocity: Vector3<f64>,
    /// Horizontal noise standard deviation, m/s
    pub horizontal_noise_std: f64,
    /// Vertical noise standard deviation, m/s
    pub vertical_noise_std: f64,
}
impl Display for VelocityMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VelocityMeasurement(v: [{:.3}, {:.3}, {:.3}], horiz_noise: {}, vert_noise: {})",
            self.velocity[0],
            self.velocity[1],
            self.velocity[2],
            self.horizontal_noise_std,
            self.vertical_noise_std
        )
    }
}
impl MeasurementModel for VelocityMeasurement {
    fn channel(&self) -> Channel {
        self.channel
    }
    fn dimension(&self) -> usize {
        3
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.velocity.as_slice())
    }
    fn noise(&self) -> DVector<f64> {
        let h = self.horizontal_noise_std.powi(2);
        DVector::from_vec(vec![h, h, self.vertical_noise_std.powi(2)])
    }
    fn expected_measurement(&self, state: &NavigationState) -> DVector<f64> {
        DVector::from_column_slice(state.velocity.as_slice())
    }
    fn jacobian(&self, _state: &NavigationState) -> DMatrix<f64> {
        selection_jacobian(&[VELOCITY.start, VELOCITY.start + 1, VELOCITY.start + 2])
    }
}

/// North and east position relative to the origin.
///
/// Used for GNSS and vision positions and for the last-known-position pseudo-measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HorizontalPositionMeasurement {
    pub channel: Channel,
    pub position: Vector2<f64>,
    pub noise_std: f64,
}
impl Display for HorizontalPositionMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HorizontalPositionMeasurement({}: [{:.2}, {:.2}], noise: {})",
            self.channel, self.position[0], self.position[1], self.noise_std
        )
    }
}
impl MeasurementModel for HorizontalPositionMeasurement {
    fn channel(&self) -> Channel {
        self.channel
    }
    fn dimension(&self) -> usize {
        2
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.position.as_slice())
    }
    fn noise(&self) -> DVector<f64> {
        DVector::from_element(2, self.noise_std.powi(2))
    }
    fn expected_measurement(&self, state: &NavigationState) -> DVector<f64> {
        DVector::from_vec(vec![state.position[0], state.position[1]])
    }
    fn jacobian(&self, _state: &NavigationState) -> DMatrix<f64> {
        selection_jacobian(&[POSITION.start, POSITION.start + 1])
    }
}

/// Vertical position (NED down) already converted from the sensor's native height.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeightMeasurement {
    pub channel: Channel,
    pub down: f64,
    pub noise_std: f64,
}
impl MeasurementModel for HeightMeasurement {
    fn channel(&self) -> Channel {
        self.channel
    }
    fn dimension(&self) -> usize {
        1
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_element(1, self.down)
    }
    fn noise(&self) -> DVector<f64> {
        DVector::from_element(1, self.noise_std.powi(2))
    }
    fn expected_measurement(&self, state: &NavigationState) -> DVector<f64> {
        DVector::from_element(1, state.position[2])
    }
    fn jacobian(&self, _state: &NavigationState) -> DMatrix<f64> {
        selection_jacobian(&[POSITION.start + 2])
    }
}

/// 3-2-1 yaw angle, from the magnetometer or an external vision system.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeadingMeasurement {
    pub channel: Channel,
    /// Yaw relative to true north, rad
    pub yaw: f64,
    pub noise_std: f64,
}
impl MeasurementModel for HeadingMeasurement {
    fn channel(&self) -> Channel {
        self.channel
    }
    fn dimension(&self) -> usize {
        1
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_element(1, self.yaw)
    }
    fn noise(&self) -> DVector<f64> {
        DVector::from_element(1, self.noise_std.powi(2))
    }
    fn expected_measurement(&self, state: &NavigationState) -> DVector<f64> {
        DVector::from_element(1, state.yaw())
    }
    fn jacobian(&self, state: &NavigationState) -> DMatrix<f64> {
        heading_jacobian(state.rotation().matrix())
    }
    fn innovation(&self, state: &NavigationState) -> DVector<f64> {
        DVector::from_element(1, wrap_to_pi(self.yaw - state.yaw()))
    }
}

/// Yaw implied by a body-frame magnetometer reading at the current tilt.
///
/// The measured field is rotated into a level frame with the current roll and pitch and its
/// horizontal direction is compared with the declination.
pub fn magnetic_yaw(state: &NavigationState, field: &Vector3<f64>, declination: f64) -> f64 {
    let (roll, pitch, _) = state.attitude.euler_angles();
    let level = nalgebra::Rotation3::from_euler_angles(roll, pitch, 0.0);
    let field_level = level * field;
    wrap_to_pi(declination - field_level[1].atan2(field_level[0]))
}

/// Body-frame three-axis magnetometer field.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MagFieldMeasurement {
    pub field: Vector3<f64>,
    pub noise_std: f64,
}
impl Display for MagFieldMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MagFieldMeasurement([{:.4}, {:.4}, {:.4}] gauss, noise: {})",
            self.field[0], self.field[1], self.field[2], self.noise_std
        )
    }
}
impl MeasurementModel for MagFieldMeasurement {
    fn channel(&self) -> Channel {
        Channel::Magnetometer
    }
    fn dimension(&self) -> usize {
        3
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.field.as_slice())
    }
    fn noise(&self) -> DVector<f64> {
        DVector::from_element(3, self.noise_std.powi(2))
    }
    fn expected_measurement(&self, state: &NavigationState) -> DVector<f64> {
        let m = state.attitude.inverse_transform_vector(&state.mag_earth) + state.mag_body;
        DVector::from_column_slice(m.as_slice())
    }
    fn jacobian(&self, state: &NavigationState) -> DMatrix<f64> {
        mag_field_jacobian(state)
    }
}

/// Declination of the earth field state, used to constrain its direction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeclinationMeasurement {
    pub declination: f64,
    pub noise_std: f64,
}
impl MeasurementModel for DeclinationMeasurement {
    fn channel(&self) -> Channel {
        Channel::Declination
    }
    fn dimension(&self) -> usize {
        1
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_element(1, self.declination)
    }
    fn noise(&self) -> DVector<f64> {
        DVector::from_element(1, self.noise_std.powi(2))
    }
    fn expected_measurement(&self, state: &NavigationState) -> DVector<f64> {
        DVector::from_element(1, state.mag_earth[1].atan2(state.mag_earth[0]))
    }
    fn jacobian(&self, state: &NavigationState) -> DMatrix<f64> {
        declination_jacobian(&state.mag_earth)
    }
    fn innovation(&self, state: &NavigationState) -> DVector<f64> {
        let predicted = state.mag_earth[1].atan2(state.mag_earth[0]);
        DVector::from_element(1, wrap_to_pi(self.declination - predicted))
    }
}

/// True airspeed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AirspeedMeasurement {
    pub true_airspeed: f64,
    pub noise_std: f64,
}
impl MeasurementModel for AirspeedMeasurement {
    fn channel(&self) -> Channel {
        Channel::Airspeed
    }
    fn dimension(&self) -> usize {
        1
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_element(1, self.true_airspeed)
    }
    fn noise(&self) -> DVector<f64> {
        DVector::from_element(1, self.noise_std.powi(2))
    }
    fn expected_measurement(&self, state: &NavigationState) -> DVector<f64> {
        let relative = Vector3::new(
            state.velocity[0] - state.wind[0],
            state.velocity[1] - state.wind[1],
            state.velocity[2],
        );
        DVector::from_element(1, relative.norm())
    }
    fn jacobian(&self, state: &NavigationState) -> DMatrix<f64> {
        airspeed_jacobian(state)
    }
}

/// Optical flow line-of-sight rates with the body rotation removed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OpticalFlowMeasurement {
    /// Line-of-sight rate about the sensor x and y axes, rad/s
    pub rate: Vector2<f64>,
    pub noise_std: f64,
    /// Distance to the ground along the sensor axis, m
    pub range: f64,
}
impl MeasurementModel for OpticalFlowMeasurement {
    fn channel(&self) -> Channel {
        Channel::OpticalFlow
    }
    fn dimension(&self) -> usize {
        2
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.rate.as_slice())
    }
    fn noise(&self) -> DVector<f64> {
        DVector::from_element(2, self.noise_std.powi(2))
    }
    fn expected_measurement(&self, state: &NavigationState) -> DVector<f64> {
        let v_body = state.attitude.inverse_transform_vector(&state.velocity);
        DVector::from_vec(vec![v_body[1] / self.range, -v_body[0] / self.range])
    }
    fn jacobian(&self, state: &NavigationState) -> DMatrix<f64> {
        flow_jacobian(state, self.range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linearize::{self, STATE_DIM};
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::UnitQuaternion;
    use std::f64::consts::PI;

    #[test]
    fn innovation_sign_is_observed_minus_predicted() {
        let state = NavigationState {
            position: Vector3::new(1.0, 2.0, -10.0),
            ..Default::default()
        };
        let height = HeightMeasurement {
            channel: Channel::BaroHeight,
            down: -12.0,
            noise_std: 2.0,
        };
        assert_approx_eq!(height.innovation(&state)[0], -2.0);
        let obs = Observation::new(&height, &state, 5.0);
        assert_eq!(obs.jacobian[(0, POSITION.start + 2)], 1.0);
        assert_approx_eq!(obs.noise[0], 4.0);
        assert_eq!(obs.dimension(), 1);
        assert_eq!(obs.mask, StateMask::All);
    }
    #[test]
    fn heading_innovation_wraps() {
        let state = NavigationState {
            attitude: UnitQuaternion::from_euler_angles(0.0, 0.0, PI - 0.05),
            ..Default::default()
        };
        let heading = HeadingMeasurement {
            channel: Channel::MagHeading,
            yaw: -PI + 0.05,
            noise_std: 0.3,
        };
        assert_approx_eq!(heading.innovation(&state)[0], 0.1, 1e-9);
    }
    #[test]
    fn magnetic_yaw_recovers_heading() {
        let yaw = 0.7;
        let declination = 0.1;
        let state = NavigationState {
            attitude: UnitQuaternion::from_euler_angles(0.1, -0.05, yaw),
            ..Default::default()
        };
        let earth = UnitQuaternion::from_euler_angles(0.0, 0.0, declination)
            .transform_vector(&Vector3::new(0.2, 0.0, 0.4));
        let body = state.attitude.inverse_transform_vector(&earth);
        assert_approx_eq!(magnetic_yaw(&state, &body, declination), yaw, 1e-9);
    }
    #[test]
    fn mag_field_prediction() {
        let state = NavigationState {
            attitude: UnitQuaternion::from_euler_angles(0.0, 0.0, PI / 2.0),
            mag_earth: Vector3::new(0.2, 0.0, 0.4),
            mag_body: Vector3::new(0.01, 0.0, 0.0),
            ..Default::default()
        };
        let model = MagFieldMeasurement {
            field: Vector3::zeros(),
            noise_std: 0.05,
        };
        let m = model.expected_measurement(&state);
        // facing east, north points to the body's left (-y)
        assert_approx_eq!(m[0], 0.01, 1e-12);
        assert_approx_eq!(m[1], -0.2, 1e-12);
        assert_approx_eq!(m[2], 0.4, 1e-12);
    }
    #[test]
    fn flow_prediction() {
        let state = NavigationState {
            velocity: Vector3::new(2.0, 0.0, 0.0),
            ..Default::default()
        };
        let model = OpticalFlowMeasurement {
            rate: Vector2::zeros(),
            noise_std: 0.15,
            range: 4.0,
        };
        let predicted = model.expected_measurement(&state);
        assert_approx_eq!(predicted[0], 0.0);
        assert_approx_eq!(predicted[1], -0.5);
        assert_eq!(model.jacobian(&state).ncols(), STATE_DIM);
    }
    #[test]
    fn magnetic_mask() {
        assert!(StateMask::MagneticOnly.allows(MAG_EARTH.start));
        assert!(StateMask::MagneticOnly.allows(MAG_BODY.end - 1));
        assert!(!StateMask::MagneticOnly.allows(0));
        assert!(!StateMask::MagneticOnly.allows(linearize::WIND.start));
        assert!(StateMask::All.allows(0));
    }
    #[test]
    fn airspeed_relative_to_wind() {
        let state = NavigationState {
            velocity: Vector3::new(10.0, 0.0, 0.0),
            wind: Vector2::new(-2.0, 0.0),
            ..Default::default()
        };
        let model = AirspeedMeasurement {
            true_airspeed: 12.5,
            noise_std: 1.4,
        };
        assert_approx_eq!(model.innovation(&state)[0], 0.5);
    }
}
