//! Estimator configuration.
//!
//! All tuning lives in [`EstimatorConfig`], grouped by concern. Every group implements `Default` with
//! the stock tuning and is `#[serde(default)]`, so a configuration file only needs to list the values it
//! changes. Files are read and written as JSON, YAML or TOML depending on their extension.
//!
//! ## Example
//!
//! ```
//! use navfuse::EstimatorConfig;
//! use navfuse::status::HeightSource;
//!
//! let mut config = EstimatorConfig::default();
//! config.height_source = HeightSource::Gnss;
//! config.range.aid = true;
//! assert!(config.validate().is_ok());
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EstimatorError, EstimatorResult};
use crate::health::HealthLimits;
use crate::messages::SensorKind;
use crate::status::{Channel, HeightSource};

/// Largest sensor delay the buffers are sized for, ms
pub const MAX_DELAY_MS: f64 = 500.0;

/// Which aiding sources may be used.
///
/// The bit layout of [`AidingMask::to_bits`] is the conventional fusion mode mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AidingMask {
    pub gnss: bool,
    pub optical_flow: bool,
    pub inhibit_accel_bias: bool,
    pub vision_position: bool,
    pub vision_yaw: bool,
}
impl Default for AidingMask {
    fn default() -> Self {
        AidingMask {
            gnss: true,
            optical_flow: false,
            inhibit_accel_bias: false,
            vision_position: false,
            vision_yaw: false,
        }
    }
}
impl AidingMask {
    pub const USE_GPS: u32 = 1;
    pub const USE_OF: u32 = 2;
    pub const INHIBIT_ACC_BIAS: u32 = 4;
    pub const USE_EVPOS: u32 = 8;
    pub const USE_EVYAW: u32 = 16;

    pub fn to_bits(&self) -> u32 {
        let mut bits = 0;
        if self.gnss {
            bits |= Self::USE_GPS;
        }
        if self.optical_flow {
            bits |= Self::USE_OF;
        }
        if self.inhibit_accel_bias {
            bits |= Self::INHIBIT_ACC_BIAS;
        }
        if self.vision_position {
            bits |= Self::USE_EVPOS;
        }
        if self.vision_yaw {
            bits |= Self::USE_EVYAW;
        }
        bits
    }
    pub fn from_bits(bits: u32) -> Self {
        AidingMask {
            gnss: bits & Self::USE_GPS != 0,
            optical_flow: bits & Self::USE_OF != 0,
            inhibit_accel_bias: bits & Self::INHIBIT_ACC_BIAS != 0,
            vision_position: bits & Self::USE_EVPOS != 0,
            vision_yaw: bits & Self::USE_EVYAW != 0,
        }
    }
}

/// How magnetometer data is used for heading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MagFusionType {
    /// Heading on the ground and during low excitation, three-axis in flight
    #[default]
    Auto,
    /// Always fuse the magnetic heading
    Heading,
    /// Always fuse the three-axis field once airborne
    ThreeAxis,
    /// As `Auto`; fixed-wing vehicles only correct the magnetic states with three-axis data
    AutoFixedWing,
    /// Never use the magnetometer
    None,
}

/// Magnetometer observation tuning and the auto-selection thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MagConfig {
    pub fusion: MagFusionType,
    /// Heading observation noise, rad
    pub heading_noise: f64,
    pub heading_gate: f64,
    /// Three-axis observation noise, gauss
    pub noise: f64,
    pub gate: f64,
    /// Magnetic declination, degrees
    pub declination_deg: f64,
    /// Fuse the declination as an observation whenever three-axis fusion is active
    pub fuse_declination: bool,
    /// Horizontal manoeuvre acceleration gate, m/s^2
    pub acc_gate: f64,
    /// Yaw rate gate for bias observability, rad/s
    pub yaw_rate_gate: f64,
}
impl Default for MagConfig {
    fn default() -> Self {
        MagConfig {
            fusion: MagFusionType::Auto,
            heading_noise: 0.3,
            heading_gate: 2.6,
            noise: 0.05,
            gate: 3.0,
            declination_deg: 0.0,
            fuse_declination: false,
            acc_gate: 0.5,
            yaw_rate_gate: 0.25,
        }
    }
}

/// Measurement delays relative to the IMU, ms.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorDelays {
    pub mag_ms: f64,
    pub baro_ms: f64,
    pub gnss_ms: f64,
    pub airspeed_ms: f64,
    pub flow_ms: f64,
    pub range_ms: f64,
    pub vision_ms: f64,
}
impl Default for SensorDelays {
    fn default() -> Self {
        SensorDelays {
            mag_ms: 0.0,
            baro_ms: 0.0,
            gnss_ms: 110.0,
            airspeed_ms: 100.0,
            flow_ms: 5.0,
            range_ms: 5.0,
            vision_ms: 100.0,
        }
    }
}
impl SensorDelays {
    pub fn delay_ms(&self, kind: SensorKind) -> f64 {
        match kind {
            SensorKind::Magnetometer => self.mag_ms,
            SensorKind::Barometer => self.baro_ms,
            SensorKind::Gnss => self.gnss_ms,
            SensorKind::RangeFinder => self.range_ms,
            SensorKind::OpticalFlow => self.flow_ms,
            SensorKind::Vision => self.vision_ms,
            SensorKind::Airspeed => self.airspeed_ms,
        }
    }
    pub fn delay_us(&self, kind: SensorKind) -> u64 {
        (self.delay_ms(kind).max(0.0) * 1e3).round() as u64
    }
    /// Largest configured delay, ms
    pub fn max_ms(&self) -> f64 {
        SensorKind::ALL
            .iter()
            .map(|k| self.delay_ms(*k))
            .fold(0.0, f64::max)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// Nominal interval between inertial samples, ms
    pub interval_ms: f64,
}
impl Default for ImuConfig {
    fn default() -> Self {
        ImuConfig { interval_ms: 4.0 }
    }
}

/// Thresholds for batching covariance propagation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Accumulated time that triggers a propagation, s
    pub max_dt_s: f64,
    /// Accumulated rotation magnitude that triggers a propagation, rad
    pub max_rotation_rad: f64,
}
impl Default for PredictionConfig {
    fn default() -> Self {
        PredictionConfig {
            max_dt_s: 0.02,
            max_rotation_rad: 0.1,
        }
    }
}

/// IMU noise and state process noise.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessNoise {
    /// Rate gyro noise, rad/s
    pub gyro: f64,
    /// Accelerometer noise, m/s^2
    pub accel: f64,
    /// Gyro bias random walk, rad/s^2
    pub gyro_bias: f64,
    /// Accelerometer bias random walk, m/s^3
    pub accel_bias: f64,
    /// Earth field random walk, gauss/s
    pub mag_earth: f64,
    /// Body field random walk, gauss/s
    pub mag_body: f64,
    /// Wind random walk, m/s^2
    pub wind: f64,
    /// Terrain vertical position random walk, m/s
    pub terrain: f64,
    /// Terrain gradient used to scale terrain noise with ground speed, m/m
    pub terrain_gradient: f64,
}
impl Default for ProcessNoise {
    fn default() -> Self {
        ProcessNoise {
            gyro: 1.5e-2,
            accel: 0.35,
            gyro_bias: 1.0e-3,
            accel_bias: 6.0e-3,
            mag_earth: 1.0e-3,
            mag_body: 1.0e-4,
            wind: 0.1,
            terrain: 5.0,
            terrain_gradient: 0.5,
        }
    }
}

/// One-sigma uncertainties used when the filter is initialized.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialUncertainty {
    /// Tilt error after leveling from the gravity vector, rad
    pub tilt: f64,
    /// Yaw error, rad
    pub yaw: f64,
    pub velocity: f64,
    pub position: f64,
    /// Vertical position, m
    pub height: f64,
    pub gyro_bias: f64,
    pub accel_bias: f64,
    pub wind: f64,
}
impl Default for InitialUncertainty {
    fn default() -> Self {
        InitialUncertainty {
            tilt: 0.1,
            yaw: 0.5,
            velocity: 0.5,
            position: 0.5,
            height: 2.0,
            gyro_bias: 0.1,
            accel_bias: 0.2,
            wind: 1.0,
        }
    }
}

/// Quality checks a GNSS receiver must pass before it may set the origin and aid the filter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GnssChecks {
    pub min_fix: u8,
    pub min_satellites: u8,
    pub max_pdop: f64,
    pub max_horizontal_accuracy: f64,
    pub max_vertical_accuracy: f64,
    pub max_speed_accuracy: f64,
    /// Checks must pass continuously this long, s
    pub pass_duration_s: f64,
    /// Aiding cannot start this soon after a failed check, s
    pub fail_holdoff_s: f64,
}
impl Default for GnssChecks {
    fn default() -> Self {
        GnssChecks {
            min_fix: 3,
            min_satellites: 6,
            max_pdop: 2.0,
            max_horizontal_accuracy: 5.0,
            max_vertical_accuracy: 8.0,
            max_speed_accuracy: 1.0,
            pass_duration_s: 10.0,
            fail_holdoff_s: 5.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GnssConfig {
    /// Minimum velocity observation noise, m/s
    pub velocity_noise: f64,
    /// Minimum position observation noise, m
    pub position_noise: f64,
    pub velocity_gate: f64,
    pub position_gate: f64,
    pub checks: GnssChecks,
}
impl Default for GnssConfig {
    fn default() -> Self {
        GnssConfig {
            velocity_noise: 0.5,
            position_noise: 0.5,
            velocity_gate: 5.0,
            position_gate: 5.0,
            checks: GnssChecks::default(),
        }
    }
}

/// Barometric height tuning. The gate also applies to GNSS height.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaroConfig {
    pub noise: f64,
    pub gate: f64,
}
impl Default for BaroConfig {
    fn default() -> Self {
        BaroConfig {
            noise: 2.0,
            gate: 5.0,
        }
    }
}

/// Range finder tuning, including the range-aid conditions.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    /// Observation noise, m
    pub noise: f64,
    /// Additional noise per meter of range, m/m
    pub noise_scaler: f64,
    pub gate: f64,
    /// Cosine of the largest tilt at which range data is used
    pub cos_max_tilt: f64,
    /// Range reported when the vehicle rests on the ground, m
    pub ground_clearance: f64,
    /// Allow the range finder to become the height source at low height and speed
    pub aid: bool,
    pub max_hagl: f64,
    pub max_velocity: f64,
    /// Gate for the height above ground consistency test used by range aiding
    pub aid_gate: f64,
}
impl Default for RangeConfig {
    fn default() -> Self {
        RangeConfig {
            noise: 0.1,
            noise_scaler: 0.0,
            gate: 5.0,
            cos_max_tilt: 0.7071,
            ground_clearance: 0.1,
            aid: false,
            max_hagl: 5.0,
            max_velocity: 1.0,
            aid_gate: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub gate: f64,
    /// Lower bound on the reported position error, m
    pub min_position_noise: f64,
    /// Lower bound on the reported angle error, rad
    pub min_angle_noise: f64,
}
impl Default for VisionConfig {
    fn default() -> Self {
        VisionConfig {
            gate: 5.0,
            min_position_noise: 0.01,
            min_angle_noise: 0.01,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Observation noise at best quality, rad/s
    pub noise: f64,
    /// Observation noise at the minimum usable quality, rad/s
    pub noise_quality_min: f64,
    /// Minimum usable quality
    pub quality_min: u8,
    pub gate: f64,
}
impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            noise: 0.15,
            noise_quality_min: 0.5,
            quality_min: 1,
            gate: 3.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AirspeedConfig {
    /// Equivalent airspeed noise, m/s
    pub noise: f64,
    pub gate: f64,
    /// Airspeed below this is not fused, m/s
    pub min_airspeed: f64,
}
impl Default for AirspeedConfig {
    fn default() -> Self {
        AirspeedConfig {
            noise: 1.4,
            gate: 5.0,
            min_airspeed: 5.0,
        }
    }
}

/// Behavior without horizontal aiding.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoAidConfig {
    /// Observation noise of the last-known-position pseudo-measurement in flight, m
    pub noise: f64,
    /// Observation noise of the pseudo-measurement on the ground or before tilt alignment, m
    pub on_ground_noise: f64,
    /// Dead reckoning time after which GNSS aiding is hard reset, s
    pub no_gnss_timeout_s: f64,
    /// Time without aiding fusion after which the filter is dead reckoning, s
    pub no_aid_timeout_s: f64,
    /// Interval between pseudo-measurements, s
    pub fake_position_interval_s: f64,
    pub fake_position_gate: f64,
    /// A pseudo-measurement gap longer than this restarts dead reckoning, s
    pub restart_gap_s: f64,
}
impl Default for NoAidConfig {
    fn default() -> Self {
        NoAidConfig {
            noise: 10.0,
            on_ground_noise: 0.5,
            no_gnss_timeout_s: 7.0,
            no_aid_timeout_s: 1.0,
            fake_position_interval_s: 0.2,
            fake_position_gate: 100.0,
            restart_gap_s: 0.4,
        }
    }
}

/// Nominal sensor intervals and the per-channel staleness multipliers applied to them.
///
/// The multipliers differ per channel and are kept separate on purpose.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub gnss_interval_s: f64,
    pub baro_interval_s: f64,
    pub range_interval_s: f64,
    pub vision_interval_s: f64,
    pub baro_faulty_multiplier: f64,
    pub gnss_height_faulty_multiplier: f64,
    pub range_faulty_multiplier: f64,
    pub vision_fresh_multiplier: f64,
    pub gnss_stopped_multiplier: f64,
    pub vision_stopped_multiplier: f64,
    pub flow_stopped_s: f64,
    pub airspeed_s: f64,
    pub hagl_valid_s: f64,
    /// No height fusion for this long allows a height reset, s
    pub height_fusion_s: f64,
}
impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            gnss_interval_s: 0.5,
            baro_interval_s: 0.2,
            range_interval_s: 0.2,
            vision_interval_s: 0.2,
            baro_faulty_multiplier: 2.0,
            gnss_height_faulty_multiplier: 2.0,
            range_faulty_multiplier: 2.0,
            vision_fresh_multiplier: 2.0,
            gnss_stopped_multiplier: 20.0,
            vision_stopped_multiplier: 25.0,
            flow_stopped_s: 5.0,
            airspeed_s: 10.0,
            hagl_valid_s: 5.0,
            height_fusion_s: 5.0,
        }
    }
}
fn seconds_to_us(s: f64) -> u64 {
    (s.max(0.0) * 1e6).round() as u64
}
impl TimeoutConfig {
    pub fn baro_faulty_us(&self) -> u64 {
        seconds_to_us(self.baro_faulty_multiplier * self.baro_interval_s)
    }
    pub fn gnss_height_faulty_us(&self) -> u64 {
        seconds_to_us(self.gnss_height_faulty_multiplier * self.gnss_interval_s)
    }
    pub fn range_faulty_us(&self) -> u64 {
        seconds_to_us(self.range_faulty_multiplier * self.range_interval_s)
    }
    pub fn vision_fresh_us(&self) -> u64 {
        seconds_to_us(self.vision_fresh_multiplier * self.vision_interval_s)
    }
    pub fn gnss_stopped_us(&self) -> u64 {
        seconds_to_us(self.gnss_stopped_multiplier * self.gnss_interval_s)
    }
    pub fn vision_stopped_us(&self) -> u64 {
        seconds_to_us(self.vision_stopped_multiplier * self.vision_interval_s)
    }
    pub fn flow_stopped_us(&self) -> u64 {
        seconds_to_us(self.flow_stopped_s)
    }
    pub fn airspeed_us(&self) -> u64 {
        seconds_to_us(self.airspeed_s)
    }
    pub fn hagl_valid_us(&self) -> u64 {
        seconds_to_us(self.hagl_valid_s)
    }
    pub fn height_fusion_us(&self) -> u64 {
        seconds_to_us(self.height_fusion_s)
    }
}

/// Sensor positions in body axes relative to the vehicle reference point, m.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorOffsets {
    pub imu: [f64; 3],
    pub gnss: [f64; 3],
    pub range: [f64; 3],
    pub flow: [f64; 3],
    pub vision: [f64; 3],
}

/// Output predictor complementary filter time constants.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub velocity_tau_s: f64,
    pub position_tau_s: f64,
}
impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            velocity_tau_s: 0.25,
            position_tau_s: 0.25,
        }
    }
}

/// Allowed range of a state group's variances.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VarianceBound {
    pub floor: f64,
    pub ceiling: f64,
}
impl VarianceBound {
    pub const fn new(floor: f64, ceiling: f64) -> Self {
        VarianceBound { floor, ceiling }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarianceBounds {
    pub attitude: VarianceBound,
    pub velocity: VarianceBound,
    pub position: VarianceBound,
    pub gyro_bias: VarianceBound,
    pub accel_bias: VarianceBound,
    pub mag_earth: VarianceBound,
    pub mag_body: VarianceBound,
    pub wind: VarianceBound,
}
impl Default for VarianceBounds {
    fn default() -> Self {
        VarianceBounds {
            attitude: VarianceBound::new(1e-9, 1.0),
            velocity: VarianceBound::new(1e-6, 1e6),
            position: VarianceBound::new(1e-6, 1e6),
            gyro_bias: VarianceBound::new(1e-12, 0.01),
            accel_bias: VarianceBound::new(1e-12, 0.04),
            mag_earth: VarianceBound::new(1e-9, 0.01),
            mag_body: VarianceBound::new(1e-9, 0.01),
            wind: VarianceBound::new(1e-6, 1e6),
        }
    }
}

/// Debounce limits for channel health, with optional per-channel overrides.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub default: HealthLimits,
    pub overrides: BTreeMap<Channel, HealthLimits>,
}
impl HealthConfig {
    pub fn limits(&self, channel: Channel) -> HealthLimits {
        self.overrides
            .get(&channel)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Detection of accelerometer data inconsistent with vertical aiding.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BadAccelConfig {
    /// Combined vertical velocity and position test limit, standard deviations
    pub vertical_innovation_limit: f64,
    /// Continuous bad accel time after which the height may be reset, s
    pub reset_delay_s: f64,
    /// Time bad accel must stay absent before the data is trusted again, s
    pub probation_s: f64,
    /// Accelerometer noise used during probation, m/s^2
    pub probation_accel_noise: f64,
    /// Height reset requires the vertical position standard deviation to exceed this, m
    pub height_reset_limit: f64,
}
impl Default for BadAccelConfig {
    fn default() -> Self {
        BadAccelConfig {
            vertical_innovation_limit: 4.5,
            reset_delay_s: 0.5,
            probation_s: 10.0,
            probation_accel_noise: 4.9,
            height_reset_limit: 0.0,
        }
    }
}

/// Complete estimator configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub aiding: AidingMask,
    /// Primary height source
    pub height_source: HeightSource,
    pub mag: MagConfig,
    pub delays: SensorDelays,
    pub imu: ImuConfig,
    pub prediction: PredictionConfig,
    pub process_noise: ProcessNoise,
    pub initial: InitialUncertainty,
    pub gnss: GnssConfig,
    pub baro: BaroConfig,
    pub range: RangeConfig,
    pub vision: VisionConfig,
    pub flow: FlowConfig,
    pub airspeed: AirspeedConfig,
    pub no_aid: NoAidConfig,
    pub timeouts: TimeoutConfig,
    pub offsets: SensorOffsets,
    pub output: OutputConfig,
    pub variance_bounds: VarianceBounds,
    pub health: HealthConfig,
    pub bad_accel: BadAccelConfig,
}

impl EstimatorConfig {
    /// Number of inertial samples held so the core runs behind the slowest sensor.
    pub fn imu_buffer_length(&self) -> usize {
        let interval = self.imu.interval_ms.max(1e-3);
        (self.delays.max_ms() / interval).ceil() as usize + 1
    }
    /// Depth of each sensor buffer; matches the inertial buffer so no sensor can outrun it.
    pub fn observation_buffer_length(&self) -> usize {
        self.imu_buffer_length().max(2)
    }
    pub fn imu_interval_s(&self) -> f64 {
        self.imu.interval_ms * 1e-3
    }

    /// Check every parameter for a usable value.
    pub fn validate(&self) -> EstimatorResult<()> {
        fn positive(name: &str, value: f64) -> EstimatorResult<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(EstimatorError::configuration(name, format!("must be positive, got {value}")))
            }
        }
        fn non_negative(name: &str, value: f64) -> EstimatorResult<()> {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(EstimatorError::configuration(
                    name,
                    format!("must be non-negative, got {value}"),
                ))
            }
        }
        positive("imu.interval_ms", self.imu.interval_ms)?;
        positive("prediction.max_dt_s", self.prediction.max_dt_s)?;
        positive("prediction.max_rotation_rad", self.prediction.max_rotation_rad)?;
        for kind in SensorKind::ALL {
            let delay = self.delays.delay_ms(kind);
            non_negative(&format!("delays.{}", kind.name()), delay)?;
            if delay > MAX_DELAY_MS {
                return Err(EstimatorError::configuration(
                    format!("delays.{}", kind.name()),
                    format!("{delay} ms exceeds the {MAX_DELAY_MS} ms limit"),
                ));
            }
        }
        let noise = &self.process_noise;
        positive("process_noise.gyro", noise.gyro)?;
        positive("process_noise.accel", noise.accel)?;
        non_negative("process_noise.gyro_bias", noise.gyro_bias)?;
        non_negative("process_noise.accel_bias", noise.accel_bias)?;
        non_negative("process_noise.mag_earth", noise.mag_earth)?;
        non_negative("process_noise.mag_body", noise.mag_body)?;
        non_negative("process_noise.wind", noise.wind)?;
        non_negative("process_noise.terrain", noise.terrain)?;
        non_negative("process_noise.terrain_gradient", noise.terrain_gradient)?;
        let initial = &self.initial;
        for (name, value) in [
            ("initial.tilt", initial.tilt),
            ("initial.yaw", initial.yaw),
            ("initial.velocity", initial.velocity),
            ("initial.position", initial.position),
            ("initial.height", initial.height),
            ("initial.gyro_bias", initial.gyro_bias),
            ("initial.accel_bias", initial.accel_bias),
            ("initial.wind", initial.wind),
        ] {
            positive(name, value)?;
        }
        for (name, value) in [
            ("gnss.velocity_noise", self.gnss.velocity_noise),
            ("gnss.position_noise", self.gnss.position_noise),
            ("gnss.velocity_gate", self.gnss.velocity_gate),
            ("gnss.position_gate", self.gnss.position_gate),
            ("baro.noise", self.baro.noise),
            ("baro.gate", self.baro.gate),
            ("mag.heading_noise", self.mag.heading_noise),
            ("mag.heading_gate", self.mag.heading_gate),
            ("mag.noise", self.mag.noise),
            ("mag.gate", self.mag.gate),
            ("mag.acc_gate", self.mag.acc_gate),
            ("mag.yaw_rate_gate", self.mag.yaw_rate_gate),
            ("range.noise", self.range.noise),
            ("range.gate", self.range.gate),
            ("range.max_hagl", self.range.max_hagl),
            ("range.max_velocity", self.range.max_velocity),
            ("range.aid_gate", self.range.aid_gate),
            ("vision.gate", self.vision.gate),
            ("vision.min_position_noise", self.vision.min_position_noise),
            ("vision.min_angle_noise", self.vision.min_angle_noise),
            ("flow.noise", self.flow.noise),
            ("flow.noise_quality_min", self.flow.noise_quality_min),
            ("flow.gate", self.flow.gate),
            ("airspeed.noise", self.airspeed.noise),
            ("airspeed.gate", self.airspeed.gate),
            ("no_aid.noise", self.no_aid.noise),
            ("no_aid.on_ground_noise", self.no_aid.on_ground_noise),
            ("no_aid.no_gnss_timeout_s", self.no_aid.no_gnss_timeout_s),
            ("no_aid.no_aid_timeout_s", self.no_aid.no_aid_timeout_s),
            ("no_aid.fake_position_interval_s", self.no_aid.fake_position_interval_s),
            ("no_aid.fake_position_gate", self.no_aid.fake_position_gate),
            ("timeouts.gnss_interval_s", self.timeouts.gnss_interval_s),
            ("timeouts.baro_interval_s", self.timeouts.baro_interval_s),
            ("timeouts.range_interval_s", self.timeouts.range_interval_s),
            ("timeouts.vision_interval_s", self.timeouts.vision_interval_s),
            ("timeouts.flow_stopped_s", self.timeouts.flow_stopped_s),
            ("timeouts.airspeed_s", self.timeouts.airspeed_s),
            ("timeouts.hagl_valid_s", self.timeouts.hagl_valid_s),
            ("timeouts.height_fusion_s", self.timeouts.height_fusion_s),
            ("output.velocity_tau_s", self.output.velocity_tau_s),
            ("output.position_tau_s", self.output.position_tau_s),
            ("bad_accel.vertical_innovation_limit", self.bad_accel.vertical_innovation_limit),
            ("bad_accel.probation_accel_noise", self.bad_accel.probation_accel_noise),
        ] {
            positive(name, value)?;
        }
        non_negative("range.ground_clearance", self.range.ground_clearance)?;
        non_negative("range.noise_scaler", self.range.noise_scaler)?;
        non_negative("bad_accel.reset_delay_s", self.bad_accel.reset_delay_s)?;
        non_negative("bad_accel.probation_s", self.bad_accel.probation_s)?;
        non_negative("bad_accel.height_reset_limit", self.bad_accel.height_reset_limit)?;
        non_negative("gnss.checks.pass_duration_s", self.gnss.checks.pass_duration_s)?;
        non_negative("gnss.checks.fail_holdoff_s", self.gnss.checks.fail_holdoff_s)?;
        if !(self.range.cos_max_tilt > 0.0 && self.range.cos_max_tilt <= 1.0) {
            return Err(EstimatorError::configuration(
                "range.cos_max_tilt",
                "must be in (0, 1]",
            ));
        }
        let bounds = &self.variance_bounds;
        for (name, bound) in [
            ("variance_bounds.attitude", bounds.attitude),
            ("variance_bounds.velocity", bounds.velocity),
            ("variance_bounds.position", bounds.position),
            ("variance_bounds.gyro_bias", bounds.gyro_bias),
            ("variance_bounds.accel_bias", bounds.accel_bias),
            ("variance_bounds.mag_earth", bounds.mag_earth),
            ("variance_bounds.mag_body", bounds.mag_body),
            ("variance_bounds.wind", bounds.wind),
        ] {
            non_negative(name, bound.floor)?;
            if !(bound.ceiling > bound.floor) {
                return Err(EstimatorError::configuration(
                    name,
                    "ceiling must exceed floor",
                ));
            }
        }
        let health_limits = std::iter::once(("health.default".to_string(), self.health.default))
            .chain(
                self.health
                    .overrides
                    .iter()
                    .map(|(c, l)| (format!("health.overrides.{}", c.name()), *l)),
            );
        for (name, limits) in health_limits {
            if limits.fail_limit < 1 || limits.pass_limit < 1 {
                return Err(EstimatorError::configuration(name, "limits must be at least 1"));
            }
        }
        Ok(())
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        let ext = p
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match ext.as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        let ext = p
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match ext.as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_validate() {
        let config = EstimatorConfig::default();
        assert!(config.validate().is_ok());
        // 110 ms of GNSS delay at 4 ms per sample
        assert_eq!(config.imu_buffer_length(), 29);
        assert_eq!(config.observation_buffer_length(), 29);
    }
    #[test]
    fn aiding_mask_bits() {
        let mask = AidingMask {
            gnss: true,
            vision_yaw: true,
            ..AidingMask::from_bits(0)
        };
        assert_eq!(mask.to_bits(), 17);
        assert_eq!(AidingMask::from_bits(17), mask);
        assert_eq!(AidingMask::default().to_bits(), AidingMask::USE_GPS);
    }
    #[test]
    fn staleness_limits() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.baro_faulty_us(), 400_000);
        assert_eq!(timeouts.gnss_height_faulty_us(), 1_000_000);
        assert_eq!(timeouts.gnss_stopped_us(), 10_000_000);
        assert_eq!(timeouts.vision_stopped_us(), 5_000_000);
        assert_eq!(timeouts.vision_fresh_us(), 400_000);
    }
    #[test]
    fn invalid_values_are_named() {
        let mut config = EstimatorConfig::default();
        config.baro.noise = 0.0;
        match config.validate() {
            Err(EstimatorError::InvalidConfiguration { parameter, .. }) => {
                assert_eq!(parameter, "baro.noise")
            }
            other => panic!("unexpected {other:?}"),
        }
        let mut config = EstimatorConfig::default();
        config.delays.vision_ms = 600.0;
        assert!(config.validate().is_err());
        let mut config = EstimatorConfig::default();
        config.health.overrides.insert(
            Channel::Airspeed,
            HealthLimits {
                fail_limit: 0,
                pass_limit: 1,
            },
        );
        assert!(config.validate().is_err());
    }
    #[test]
    fn health_overrides() {
        let mut config = HealthConfig::default();
        let strict = HealthLimits {
            fail_limit: 1,
            pass_limit: 10,
        };
        config.overrides.insert(Channel::GnssPosition, strict);
        assert_eq!(config.limits(Channel::GnssPosition), strict);
        assert_eq!(config.limits(Channel::BaroHeight), HealthLimits::default());
    }
    #[test]
    fn file_round_trips() {
        let dir = tempdir().unwrap();
        let mut config = EstimatorConfig::default();
        config.height_source = HeightSource::Range;
        config.mag.fusion = MagFusionType::ThreeAxis;
        config.delays.gnss_ms = 200.0;
        config.health.default.fail_limit = 8;
        for name in ["config.json", "config.yaml", "config.toml"] {
            let path = dir.path().join(name);
            config.to_file(&path).unwrap();
            let read = EstimatorConfig::from_file(&path).unwrap();
            assert_eq!(read, config, "round trip through {name}");
        }
        let bad = dir.path().join("config.txt");
        let err = config.to_file(&bad).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "height_source = \"gnss\"\n[baro]\nnoise = 3.0\n").unwrap();
        let config = EstimatorConfig::from_file(&path).unwrap();
        assert_eq!(config.height_source, HeightSource::Gnss);
        assert_eq!(config.baro.noise, 3.0);
        assert_eq!(config.baro.gate, 5.0);
        assert_eq!(config.gnss, GnssConfig::default());
    }
}
