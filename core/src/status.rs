//! Status records shared between the fusion mode controller and external consumers.
//!
//! - [`ControlStatus`]: which aiding sources and modes are active. The height source, horizontal aiding
//!   source and heading mode are single enum fields, so "exactly one active" holds by construction;
//!   [`ControlStatus::to_bits`] expands them into the conventional flag word for telemetry.
//! - [`FaultStatus`]: per-channel unhealthy flags backed by a [`HealthTracker`] each, plus numerical
//!   fault flags for updates whose innovation variance collapsed.
//! - [`InnovationRecord`]: the last fusion attempt of every channel, kept for diagnostics.
//! - [`ResetDelta`] / [`ResetStatus`]: the exact jumps applied by state resets, replayed by the output
//!   predictor and exposed for any external mirror.
//! - [`FilterEvent`]: discrete state changes, drained by the owner of the estimator.

use std::fmt::{self, Display};

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::config::HealthConfig;
use crate::health::{HealthTracker, HealthTransition};

/// Fusion channels tracked individually for innovations and health.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    GnssVelocity,
    GnssPosition,
    BaroHeight,
    GnssHeight,
    RangeHeight,
    VisionHeight,
    VisionPosition,
    MagHeading,
    Magnetometer,
    Declination,
    VisionYaw,
    OpticalFlow,
    Airspeed,
    TerrainRange,
    FakePosition,
}
impl Channel {
    pub const COUNT: usize = 15;
    pub const ALL: [Channel; Channel::COUNT] = [
        Channel::GnssVelocity,
        Channel::GnssPosition,
        Channel::BaroHeight,
        Channel::GnssHeight,
        Channel::RangeHeight,
        Channel::VisionHeight,
        Channel::VisionPosition,
        Channel::MagHeading,
        Channel::Magnetometer,
        Channel::Declination,
        Channel::VisionYaw,
        Channel::OpticalFlow,
        Channel::Airspeed,
        Channel::TerrainRange,
        Channel::FakePosition,
    ];
    pub fn index(self) -> usize {
        self as usize
    }
    pub fn bit(self) -> u32 {
        1 << self.index()
    }
    pub fn name(self) -> &'static str {
        match self {
            Channel::GnssVelocity => "gnss velocity",
            Channel::GnssPosition => "gnss position",
            Channel::BaroHeight => "baro height",
            Channel::GnssHeight => "gnss height",
            Channel::RangeHeight => "range height",
            Channel::VisionHeight => "vision height",
            Channel::VisionPosition => "vision position",
            Channel::MagHeading => "magnetic heading",
            Channel::Magnetometer => "magnetometer",
            Channel::Declination => "declination",
            Channel::VisionYaw => "vision yaw",
            Channel::OpticalFlow => "optical flow",
            Channel::Airspeed => "airspeed",
            Channel::TerrainRange => "terrain range",
            Channel::FakePosition => "fake position",
        }
    }
}
impl Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sensor providing the vertical position reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeightSource {
    #[default]
    Baro,
    Gnss,
    Range,
    Vision,
}
impl HeightSource {
    pub fn channel(self) -> Channel {
        match self {
            HeightSource::Baro => Channel::BaroHeight,
            HeightSource::Gnss => Channel::GnssHeight,
            HeightSource::Range => Channel::RangeHeight,
            HeightSource::Vision => Channel::VisionHeight,
        }
    }
}

/// Source constraining horizontal position and velocity drift.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HorizontalAiding {
    /// Dead reckoning
    #[default]
    None,
    Gnss,
    Vision,
    OpticalFlow,
}

/// Source of heading information.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HeadingMode {
    #[default]
    None,
    MagneticHeading,
    Magnetic3D,
    VisionYaw,
    /// Fixed-wing yaw realignment from the GNSS course; heading fusion continues meanwhile
    GnssCourseRealign,
}
impl HeadingMode {
    /// True when the magnetometer heading is being fused
    pub fn fuses_mag_heading(self) -> bool {
        matches!(
            self,
            HeadingMode::MagneticHeading | HeadingMode::GnssCourseRealign
        )
    }
}

/// Active aiding flags, exclusively owned by the estimator's filter context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlStatus {
    pub tilt_align: bool,
    pub yaw_align: bool,
    pub height_source: HeightSource,
    pub horizontal: HorizontalAiding,
    pub heading: HeadingMode,
    /// Declination is being fused as an observation
    pub mag_declination: bool,
    pub in_air: bool,
    /// Wind states are being estimated
    pub wind: bool,
    pub fuse_airspeed: bool,
    pub fixed_wing: bool,
    pub mag_fault: bool,
    /// Three-axis magnetometer updates only correct the magnetic field states
    pub update_mag_states_only: bool,
    /// Range finder is used as the height source because range-aid conditions hold
    pub range_aid: bool,
    pub range_stuck: bool,
    pub dead_reckoning: bool,
}
impl ControlStatus {
    /// Pack into the conventional status word.
    ///
    /// Bit order: tilt_align, yaw_align, gps, opt_flow, mag_hdg, mag_3D, mag_dec, in_air, wind,
    /// baro_hgt, rng_hgt, gps_hgt, ev_pos, ev_yaw, ev_hgt, fuse_beta, update_mag_states_only,
    /// fixed_wing, mag_fault, fuse_aspd, gnd_effect, rng_stuck, dead_reckoning, range_aid.
    pub fn to_bits(&self) -> u32 {
        let flags = [
            self.tilt_align,
            self.yaw_align,
            self.horizontal == HorizontalAiding::Gnss,
            self.horizontal == HorizontalAiding::OpticalFlow,
            self.heading.fuses_mag_heading(),
            self.heading == HeadingMode::Magnetic3D,
            self.mag_declination,
            self.in_air,
            self.wind,
            self.height_source == HeightSource::Baro,
            self.height_source == HeightSource::Range,
            self.height_source == HeightSource::Gnss,
            self.horizontal == HorizontalAiding::Vision,
            self.heading == HeadingMode::VisionYaw,
            self.height_source == HeightSource::Vision,
            false,
            self.update_mag_states_only,
            self.fixed_wing,
            self.mag_fault,
            self.fuse_airspeed,
            false,
            self.range_stuck,
            self.dead_reckoning,
            self.range_aid,
        ];
        flags
            .iter()
            .enumerate()
            .fold(0u32, |bits, (i, set)| if *set { bits | (1 << i) } else { bits })
    }
}

/// Per-channel health and numerical fault flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultStatus {
    trackers: [HealthTracker; Channel::COUNT],
    numerical: u32,
    /// Vertical accelerometer data judged inconsistent with height and vertical velocity aiding
    pub bad_vertical_accel: bool,
}
impl Default for FaultStatus {
    fn default() -> Self {
        FaultStatus::new(&HealthConfig::default())
    }
}
impl FaultStatus {
    pub fn new(config: &HealthConfig) -> Self {
        let mut trackers = [HealthTracker::default(); Channel::COUNT];
        for channel in Channel::ALL {
            trackers[channel.index()] = HealthTracker::new(config.limits(channel));
        }
        FaultStatus {
            trackers,
            numerical: 0,
            bad_vertical_accel: false,
        }
    }
    /// Record the gate result of one fusion attempt.
    pub fn record(&mut self, channel: Channel, passed: bool) -> Option<HealthTransition> {
        self.trackers[channel.index()].record(passed)
    }
    pub fn tracker(&self, channel: Channel) -> &HealthTracker {
        &self.trackers[channel.index()]
    }
    pub fn is_healthy(&self, channel: Channel) -> bool {
        self.trackers[channel.index()].is_healthy()
    }
    /// Forget the failure history of a channel, e.g. after it has been reset to.
    pub fn reset_channel(&mut self, channel: Channel) {
        self.trackers[channel.index()].reset();
    }
    pub fn set_numerical(&mut self, channel: Channel, faulty: bool) {
        if faulty {
            self.numerical |= channel.bit();
        } else {
            self.numerical &= !channel.bit();
        }
    }
    pub fn is_numerically_faulty(&self, channel: Channel) -> bool {
        self.numerical & channel.bit() != 0
    }
    /// No numerical fusion faults on any channel
    pub fn is_clear(&self) -> bool {
        self.numerical == 0
    }
    pub fn unhealthy_bits(&self) -> u32 {
        Channel::ALL
            .iter()
            .filter(|c| !self.is_healthy(**c))
            .fold(0, |bits, c| bits | c.bit())
    }
    pub fn numerical_bits(&self) -> u32 {
        self.numerical
    }
}

/// Outcome of the last fusion attempt on a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InnovationRecord {
    pub time_us: u64,
    /// Number of valid axes in `innovation` and `variance`
    pub dimension: usize,
    /// Observed minus predicted
    pub innovation: [f64; 3],
    pub variance: [f64; 3],
    pub gate: f64,
    /// Largest innovation² / (gate² · variance) across the axes
    pub test_ratio: f64,
    pub accepted: bool,
}

/// Latest innovation record per channel.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InnovationRecords {
    records: [Option<InnovationRecord>; Channel::COUNT],
}
impl InnovationRecords {
    pub fn get(&self, channel: Channel) -> Option<&InnovationRecord> {
        self.records[channel.index()].as_ref()
    }
    pub fn set(&mut self, channel: Channel, record: InnovationRecord) {
        self.records[channel.index()] = Some(record);
    }
    pub fn clear(&mut self) {
        self.records = [None; Channel::COUNT];
    }
}

/// Exact correction applied by a state reset.
///
/// The attitude change is a left (navigation frame) rotation: `q_new = attitude * q_old`. Velocity
/// and position changes are additive in NED.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResetDelta {
    pub attitude: UnitQuaternion<f64>,
    pub velocity: Vector3<f64>,
    pub position: Vector3<f64>,
}
impl Default for ResetDelta {
    fn default() -> Self {
        ResetDelta {
            attitude: UnitQuaternion::identity(),
            velocity: Vector3::zeros(),
            position: Vector3::zeros(),
        }
    }
}
impl ResetDelta {
    pub fn attitude(change: UnitQuaternion<f64>) -> Self {
        ResetDelta {
            attitude: change,
            ..Default::default()
        }
    }
    pub fn velocity(change: Vector3<f64>) -> Self {
        ResetDelta {
            velocity: change,
            ..Default::default()
        }
    }
    pub fn position(change: Vector3<f64>) -> Self {
        ResetDelta {
            position: change,
            ..Default::default()
        }
    }
    /// Delta equivalent to applying `self` and then `next`.
    pub fn then(&self, next: &ResetDelta) -> ResetDelta {
        ResetDelta {
            attitude: next.attitude * self.attitude,
            velocity: self.velocity + next.velocity,
            position: self.position + next.position,
        }
    }
    pub fn apply(
        &self,
        attitude: &mut UnitQuaternion<f64>,
        velocity: &mut Vector3<f64>,
        position: &mut Vector3<f64>,
    ) {
        *attitude = self.attitude * *attitude;
        attitude.renormalize();
        *velocity += self.velocity;
        *position += self.position;
    }
    pub fn is_identity(&self) -> bool {
        self.attitude.angle() == 0.0
            && self.velocity == Vector3::zeros()
            && self.position == Vector3::zeros()
    }
}

/// Reset counters and the most recent reset delta, for external mirrors.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ResetStatus {
    pub attitude_counter: u8,
    pub velocity_ne_counter: u8,
    pub velocity_d_counter: u8,
    pub position_ne_counter: u8,
    pub position_d_counter: u8,
    /// Total number of reset events
    pub events: u32,
    pub last: ResetDelta,
    /// Every reset applied during the cycle at `cycle_time_us`, composed in order
    pub cycle: ResetDelta,
    pub cycle_time_us: u64,
}
impl ResetStatus {
    /// Count a reset applied at `time_us` and fold it into that cycle's composed delta.
    pub fn record(&mut self, time_us: u64, delta: &ResetDelta) {
        if delta.attitude.angle() != 0.0 {
            self.attitude_counter = self.attitude_counter.wrapping_add(1);
        }
        if delta.velocity[0] != 0.0 || delta.velocity[1] != 0.0 {
            self.velocity_ne_counter = self.velocity_ne_counter.wrapping_add(1);
        }
        if delta.velocity[2] != 0.0 {
            self.velocity_d_counter = self.velocity_d_counter.wrapping_add(1);
        }
        if delta.position[0] != 0.0 || delta.position[1] != 0.0 {
            self.position_ne_counter = self.position_ne_counter.wrapping_add(1);
        }
        if delta.position[2] != 0.0 {
            self.position_d_counter = self.position_d_counter.wrapping_add(1);
        }
        if self.events > 0 && self.cycle_time_us == time_us {
            self.cycle = self.cycle.then(delta);
        } else {
            self.cycle = *delta;
            self.cycle_time_us = time_us;
        }
        self.events = self.events.wrapping_add(1);
        self.last = *delta;
    }
}

/// Why a state reset happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetReason {
    GnssStart,
    GnssTimeout,
    GnssUnhealthy,
    VisionStart,
    VisionTimeout,
    FlowStart,
    HeightTimeout,
    MagHeading,
    VisionYaw,
    GnssCourse,
    DeadReckoningStart,
}

/// Discrete state changes, queued for the owner of the estimator.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterEvent {
    Initialized { time_us: u64 },
    TiltAligned { time_us: u64 },
    YawAligned { time_us: u64, mode: HeadingMode },
    HeightSourceChanged {
        time_us: u64,
        from: HeightSource,
        to: HeightSource,
    },
    AidingStarted {
        time_us: u64,
        source: HorizontalAiding,
    },
    AidingStopped {
        time_us: u64,
        source: HorizontalAiding,
    },
    HeadingModeChanged {
        time_us: u64,
        from: HeadingMode,
        to: HeadingMode,
    },
    StateReset {
        time_us: u64,
        reason: ResetReason,
        delta: ResetDelta,
    },
    /// No aiding: last-known-position pseudo-measurements start
    NavigationStopped { time_us: u64 },
    ChannelUnhealthy { time_us: u64, channel: Channel },
    ChannelRecovered { time_us: u64, channel: Channel },
    WindEstimationStarted { time_us: u64 },
    WindEstimationStopped { time_us: u64 },
    Reinitialized { time_us: u64, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn exclusive_flags_in_bits() {
        let status = ControlStatus {
            tilt_align: true,
            height_source: HeightSource::Range,
            horizontal: HorizontalAiding::Gnss,
            heading: HeadingMode::Magnetic3D,
            ..Default::default()
        };
        let bits = status.to_bits();
        assert_eq!(bits & 1, 1);
        assert_eq!(bits & (1 << 2), 1 << 2);
        assert_eq!(bits & (1 << 5), 1 << 5);
        assert_eq!(bits & (1 << 10), 1 << 10);
        assert_eq!(bits & (1 << 9), 0);
        assert_eq!(bits & (1 << 11), 0);
        assert_eq!(bits & (1 << 14), 0);
    }
    #[test]
    fn fault_status_tracks_channels() {
        let mut faults = FaultStatus::default();
        for _ in 0..HealthConfig::default().default.fail_limit {
            faults.record(Channel::GnssPosition, false);
        }
        assert!(!faults.is_healthy(Channel::GnssPosition));
        assert!(faults.is_healthy(Channel::GnssVelocity));
        assert_eq!(faults.unhealthy_bits(), Channel::GnssPosition.bit());
        faults.set_numerical(Channel::Magnetometer, true);
        assert!(!faults.is_clear());
        faults.set_numerical(Channel::Magnetometer, false);
        assert!(faults.is_clear());
        faults.reset_channel(Channel::GnssPosition);
        assert_eq!(faults.unhealthy_bits(), 0);
    }
    #[test]
    fn reset_delta_composition() {
        let first = ResetDelta::attitude(UnitQuaternion::from_euler_angles(0.0, 0.0, 0.2));
        let second = ResetDelta {
            attitude: UnitQuaternion::from_euler_angles(0.0, 0.0, 0.3),
            velocity: Vector3::new(1.0, 0.0, 0.0),
            position: Vector3::new(0.0, 0.0, -2.0),
        };
        let combined = first.then(&second);
        let mut q = UnitQuaternion::identity();
        let mut v = Vector3::zeros();
        let mut p = Vector3::zeros();
        combined.apply(&mut q, &mut v, &mut p);
        assert_approx_eq!(q.euler_angles().2, 0.5, 1e-12);
        assert_eq!(v, Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(p, Vector3::new(0.0, 0.0, -2.0));
        assert!(ResetDelta::default().is_identity());
    }
    #[test]
    fn reset_counters() {
        let mut status = ResetStatus::default();
        status.record(4_000, &ResetDelta::position(Vector3::new(0.0, 0.0, 1.0)));
        status.record(8_000, &ResetDelta::velocity(Vector3::new(1.0, 0.0, 0.0)));
        assert_eq!(status.position_d_counter, 1);
        assert_eq!(status.position_ne_counter, 0);
        assert_eq!(status.velocity_ne_counter, 1);
        assert_eq!(status.events, 2);
        // a new cycle starts a new composed delta
        assert_eq!(status.cycle_time_us, 8_000);
        assert_eq!(status.cycle, status.last);
    }
    #[test]
    fn resets_in_one_cycle_are_composed() {
        let mut status = ResetStatus::default();
        let height = ResetDelta::position(Vector3::new(0.0, 0.0, -3.0));
        let yaw = ResetDelta::attitude(UnitQuaternion::from_euler_angles(0.0, 0.0, 0.4));
        let horizontal = ResetDelta::position(Vector3::new(2.0, 1.0, 0.0));
        status.record(12_000, &height);
        status.record(12_000, &yaw);
        status.record(12_000, &horizontal);
        assert_eq!(status.events, 3);
        assert_eq!(status.last, horizontal);
        let expected = height.then(&yaw).then(&horizontal);
        assert_eq!(status.cycle, expected);
        assert_eq!(status.cycle.position, Vector3::new(2.0, 1.0, -3.0));
        assert_approx_eq!(status.cycle.attitude.euler_angles().2, 0.4, 1e-12);
    }
}
