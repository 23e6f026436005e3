//! Sensor sample types pushed into the estimator by external driver collaborators.
//!
//! Every sample carries the time stamp at which the driver produced it, in microseconds on the same
//! clock as the inertial samples. The estimator converts that stamp to a time of validity by
//! subtracting the configured per-sensor delay when the sample is buffered (see [crate::buffer]).
//! Samples are plain `Copy` values: created on ingestion, stored in their ring buffer and dropped on
//! overwrite or consumption.

use std::fmt::{self, Display};

use nalgebra::{UnitQuaternion, Vector2, Vector3};

/// Anything stored in a time-aligned ring buffer.
pub trait Timestamped {
    fn time_us(&self) -> u64;
    fn set_time_us(&mut self, time_us: u64);
}

/// Sensor channels that feed the estimator besides the IMU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Magnetometer,
    Barometer,
    Gnss,
    RangeFinder,
    OpticalFlow,
    Vision,
    Airspeed,
}
impl SensorKind {
    pub const COUNT: usize = 7;
    pub const ALL: [SensorKind; SensorKind::COUNT] = [
        SensorKind::Magnetometer,
        SensorKind::Barometer,
        SensorKind::Gnss,
        SensorKind::RangeFinder,
        SensorKind::OpticalFlow,
        SensorKind::Vision,
        SensorKind::Airspeed,
    ];
    pub fn index(self) -> usize {
        self as usize
    }
    pub fn name(self) -> &'static str {
        match self {
            SensorKind::Magnetometer => "magnetometer",
            SensorKind::Barometer => "barometer",
            SensorKind::Gnss => "gnss",
            SensorKind::RangeFinder => "range finder",
            SensorKind::OpticalFlow => "optical flow",
            SensorKind::Vision => "vision",
            SensorKind::Airspeed => "airspeed",
        }
    }
}
impl Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// GNSS receiver solution.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GnssSample {
    pub time_us: u64,
    /// WGS84 latitude, degrees
    pub latitude: f64,
    /// WGS84 longitude, degrees
    pub longitude: f64,
    /// Altitude, meters
    pub altitude: f64,
    /// NED velocity, m/s
    pub velocity: Vector3<f64>,
    /// 0-1: no fix, 2: 2D fix, 3: 3D fix, 4+: differential/RTK
    pub fix_type: u8,
    pub satellites: u8,
    /// Position dilution of precision
    pub pdop: f64,
    /// 1-sigma horizontal position accuracy, m
    pub horizontal_accuracy: f64,
    /// 1-sigma vertical position accuracy, m
    pub vertical_accuracy: f64,
    /// 1-sigma speed accuracy, m/s
    pub speed_accuracy: f64,
}
/// Barometric altitude.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BaroSample {
    pub time_us: u64,
    /// Pressure altitude, meters, positive up
    pub height: f64,
}
/// Magnetometer measurement.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MagSample {
    pub time_us: u64,
    /// Body-frame magnetic field, gauss
    pub field: Vector3<f64>,
}
/// Downward-facing range finder distance.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RangeSample {
    pub time_us: u64,
    /// Distance along the sensor axis, m
    pub range: f64,
}
/// Optical flow sensor output integrated over `dt`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FlowSample {
    pub time_us: u64,
    /// Integrated line-of-sight rotation about the sensor x and y axes, rad
    pub flow: Vector2<f64>,
    /// Integrated body rotation measured by the sensor's gyro, rad
    pub body_rotation: Vector3<f64>,
    /// Integration period, s
    pub dt: f64,
    /// 0 (unusable) .. 255 (best)
    pub quality: u8,
}
/// External vision pose.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VisionSample {
    pub time_us: u64,
    /// NED position, m
    pub position: Vector3<f64>,
    /// Body to NED rotation
    pub attitude: UnitQuaternion<f64>,
    /// 1-sigma position error, m
    pub position_error: f64,
    /// 1-sigma angular error, rad
    pub angle_error: f64,
}
impl Default for VisionSample {
    fn default() -> Self {
        VisionSample {
            time_us: 0,
            position: Vector3::zeros(),
            attitude: UnitQuaternion::identity(),
            position_error: 0.1,
            angle_error: 0.05,
        }
    }
}
/// Airspeed sensor output.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AirspeedSample {
    pub time_us: u64,
    /// True airspeed, m/s
    pub true_airspeed: f64,
    /// Equivalent to true airspeed ratio
    pub eas2tas: f64,
}

macro_rules! impl_timestamped {
    ($($ty:ty),*) => {
        $(impl Timestamped for $ty {
            fn time_us(&self) -> u64 {
                self.time_us
            }
            fn set_time_us(&mut self, time_us: u64) {
                self.time_us = time_us;
            }
        })*
    };
}
impl_timestamped!(
    GnssSample,
    BaroSample,
    MagSample,
    RangeSample,
    FlowSample,
    VisionSample,
    AirspeedSample,
    crate::ImuSample
);

/// One sample from any non-inertial sensor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SensorSample {
    Gnss(GnssSample),
    Baro(BaroSample),
    Mag(MagSample),
    Range(RangeSample),
    Flow(FlowSample),
    Vision(VisionSample),
    Airspeed(AirspeedSample),
}
impl SensorSample {
    pub fn kind(&self) -> SensorKind {
        match self {
            SensorSample::Gnss(_) => SensorKind::Gnss,
            SensorSample::Baro(_) => SensorKind::Barometer,
            SensorSample::Mag(_) => SensorKind::Magnetometer,
            SensorSample::Range(_) => SensorKind::RangeFinder,
            SensorSample::Flow(_) => SensorKind::OpticalFlow,
            SensorSample::Vision(_) => SensorKind::Vision,
            SensorSample::Airspeed(_) => SensorKind::Airspeed,
        }
    }
    pub fn time_us(&self) -> u64 {
        match self {
            SensorSample::Gnss(s) => s.time_us,
            SensorSample::Baro(s) => s.time_us,
            SensorSample::Mag(s) => s.time_us,
            SensorSample::Range(s) => s.time_us,
            SensorSample::Flow(s) => s.time_us,
            SensorSample::Vision(s) => s.time_us,
            SensorSample::Airspeed(s) => s.time_us,
        }
    }
    /// Reason the sample cannot be used, if any.
    pub fn validate(&self) -> Result<(), &'static str> {
        let finite = |v: &[f64]| v.iter().all(|x| x.is_finite());
        match self {
            SensorSample::Gnss(s) => {
                if !finite(&[s.latitude, s.longitude, s.altitude]) || !finite(s.velocity.as_slice()) {
                    return Err("non-finite position or velocity");
                }
                if !(-90.0..=90.0).contains(&s.latitude) {
                    return Err("latitude out of range");
                }
            }
            SensorSample::Baro(s) => {
                if !s.height.is_finite() {
                    return Err("non-finite height");
                }
            }
            SensorSample::Mag(s) => {
                if !finite(s.field.as_slice()) {
                    return Err("non-finite field");
                }
            }
            SensorSample::Range(s) => {
                if !s.range.is_finite() || s.range < 0.0 {
                    return Err("range must be finite and non-negative");
                }
            }
            SensorSample::Flow(s) => {
                if !finite(s.flow.as_slice()) || !finite(s.body_rotation.as_slice()) {
                    return Err("non-finite flow");
                }
                if !(s.dt > 0.0) {
                    return Err("integration period must be positive");
                }
            }
            SensorSample::Vision(s) => {
                if !finite(s.position.as_slice()) || !finite(s.attitude.coords.as_slice()) {
                    return Err("non-finite pose");
                }
            }
            SensorSample::Airspeed(s) => {
                if !s.true_airspeed.is_finite() || !s.eas2tas.is_finite() {
                    return Err("non-finite airspeed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_time() {
        let sample = SensorSample::Baro(BaroSample {
            time_us: 42,
            height: 10.0,
        });
        assert_eq!(sample.kind(), SensorKind::Barometer);
        assert_eq!(sample.time_us(), 42);
        assert_eq!(SensorKind::ALL[sample.kind().index()], SensorKind::Barometer);
    }
    #[test]
    fn validation() {
        let bad = SensorSample::Range(RangeSample {
            time_us: 0,
            range: -1.0,
        });
        assert!(bad.validate().is_err());
        let bad = SensorSample::Mag(MagSample {
            time_us: 0,
            field: Vector3::new(f64::NAN, 0.0, 0.0),
        });
        assert!(bad.validate().is_err());
        let bad = SensorSample::Flow(FlowSample::default());
        assert!(bad.validate().is_err());
        let good = SensorSample::Vision(VisionSample::default());
        assert!(good.validate().is_ok());
    }
    #[test]
    fn timestamped() {
        let mut sample = GnssSample::default();
        sample.set_time_us(1_000);
        assert_eq!(Timestamped::time_us(&sample), 1_000);
    }
}
