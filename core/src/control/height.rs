//! Height source selection, height fusion and height timeout resets.
//!
//! Two transition tables drive the height channel:
//!
//! - the *selection* table of the configured primary source picks the active source every cycle from
//!   data readiness, latched fault flags and the range-aid state,
//! - the *timeout* table picks a source to reset the vertical position to when height fusion has
//!   stopped constraining the filter or the accelerometer is misbehaving.
//!
//! Every source's raw measurement is converted to a down position relative to the origin. The fused
//! value is the raw value plus a sensor offset. On a normal source change the offset is recomputed
//! from the first sample of the new source so that its measurement equals the current filter height:
//!
//! $$
//! o = p_d - h_{raw}
//! $$
//!
//! A timeout reset instead uses the calibrated offset of the target source and moves the filter.

use log::{info, warn};
use nalgebra::Vector3;

use crate::buffer::AlignedSamples;
use crate::config::{
    BadAccelConfig, BaroConfig, EstimatorConfig, GnssConfig, InitialUncertainty, RangeConfig,
    SensorOffsets, TimeoutConfig, VisionConfig,
};
use crate::ekf::CoreEstimator;
use crate::error::EstimatorResult;
use crate::linearize::POSITION;
use crate::measurements::{HeightMeasurement, Observation};
use crate::messages::{BaroSample, GnssSample, RangeSample, VisionSample};
use crate::status::{FilterEvent, HeightSource, HorizontalAiding, ResetReason};
use crate::NavigationState;

use super::auxiliary::{BadAccelMonitor, TerrainEstimator, ground_speed};
use super::gnss::GnssMonitor;
use super::{FilterContext, Freshness, Transition, select};

/// Baro offset tracking rate, 1/s
const BARO_OFFSET_RATE: f64 = 0.1;
/// Baro offset tracking rate limit, m/s
const BARO_OFFSET_RATE_LIMIT: f64 = 0.1;
/// Fraction of the range-aid limits that must be met to enter range aiding
const RANGE_AID_ENTRY_FRACTION: f64 = 0.7;
/// HAGL test ratio that must be met to enter range aiding
const RANGE_AID_ENTRY_RATIO: f64 = 0.01;
/// HAGL test ratio that must be met to stay in range aiding
const RANGE_AID_STAY_RATIO: f64 = 1.0;
/// On the ground without range data, the ground clearance is fused at this interval, us
const ON_GROUND_RANGE_INTERVAL_US: u64 = 400_000;

/// Inputs of the height source selection table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SelectionGuards {
    pub baro_ready: bool,
    pub baro_faulty: bool,
    pub gnss_ready: bool,
    pub gnss_faulty: bool,
    pub range_ready: bool,
    pub range_faulty: bool,
    pub vision_ready: bool,
    pub vision_fresh: bool,
    pub range_aid: bool,
}

fn range_aid_ready(g: &SelectionGuards) -> bool {
    g.range_aid && g.range_ready && !g.range_faulty
}
/// Range aiding is active but this cycle has no range sample: hold the range source
fn holding_range(g: &SelectionGuards) -> bool {
    g.range_aid && !g.range_ready && !g.range_faulty
}
fn baro_usable(g: &SelectionGuards) -> bool {
    g.baro_ready && !g.baro_faulty
}
fn gnss_usable(g: &SelectionGuards) -> bool {
    g.gnss_ready && !g.gnss_faulty
}
fn baro_primary(g: &SelectionGuards) -> bool {
    baro_usable(g) && !holding_range(g)
}
fn gnss_primary(g: &SelectionGuards) -> bool {
    gnss_usable(g) && !holding_range(g)
}
fn range_not_faulty(g: &SelectionGuards) -> bool {
    !g.range_faulty
}
fn vision_usable(g: &SelectionGuards) -> bool {
    g.vision_ready && g.vision_fresh
}

type Selection = Transition<HeightSource, SelectionGuards>;

pub const BARO_PRIMARY: &[Selection] = &[
    Transition { from: None, guard: range_aid_ready, to: HeightSource::Range, action: () },
    Transition { from: None, guard: baro_primary, to: HeightSource::Baro, action: () },
    Transition {
        from: Some(HeightSource::Gnss),
        guard: gnss_usable,
        to: HeightSource::Gnss,
        action: (),
    },
];
pub const GNSS_PRIMARY: &[Selection] = &[
    Transition { from: None, guard: range_aid_ready, to: HeightSource::Range, action: () },
    Transition { from: None, guard: gnss_primary, to: HeightSource::Gnss, action: () },
    Transition {
        from: Some(HeightSource::Baro),
        guard: baro_usable,
        to: HeightSource::Baro,
        action: (),
    },
];
pub const RANGE_PRIMARY: &[Selection] = &[
    Transition { from: None, guard: range_not_faulty, to: HeightSource::Range, action: () },
    Transition { from: None, guard: baro_usable, to: HeightSource::Baro, action: () },
];
pub const VISION_PRIMARY: &[Selection] = &[
    Transition { from: None, guard: vision_usable, to: HeightSource::Vision, action: () },
    Transition {
        from: Some(HeightSource::Baro),
        guard: baro_usable,
        to: HeightSource::Baro,
        action: (),
    },
];

/// Selection table of a primary height source.
pub fn selection_table(primary: HeightSource) -> &'static [Selection] {
    match primary {
        HeightSource::Baro => BARO_PRIMARY,
        HeightSource::Gnss => GNSS_PRIMARY,
        HeightSource::Range => RANGE_PRIMARY,
        HeightSource::Vision => VISION_PRIMARY,
    }
}

/// Inputs of the height timeout table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeoutGuards {
    pub baro_available: bool,
    pub baro_consistent: bool,
    pub baro_faulty: bool,
    pub gnss_available: bool,
    pub gnss_accurate: bool,
    pub gnss_faulty: bool,
    /// Bad accelerometer data was detected recently
    pub bad_accel_probation: bool,
    pub range_available: bool,
    pub vision_available: bool,
}

fn reset_baro_to_gnss(g: &TimeoutGuards) -> bool {
    g.gnss_available && g.gnss_accurate && !g.gnss_faulty && !g.bad_accel_probation
}
fn baro_lost_gnss_available(g: &TimeoutGuards) -> bool {
    g.gnss_available && !g.baro_available
}
fn baro_available(g: &TimeoutGuards) -> bool {
    g.baro_available
}
fn reset_gnss_to_baro(g: &TimeoutGuards) -> bool {
    g.baro_consistent && g.baro_available && !g.baro_faulty && !g.gnss_accurate
}
fn gnss_lost_baro_available(g: &TimeoutGuards) -> bool {
    !g.gnss_available && g.baro_available
}
fn gnss_available(g: &TimeoutGuards) -> bool {
    g.gnss_available
}
fn range_lost_baro_available(g: &TimeoutGuards) -> bool {
    !g.range_available && g.baro_available
}
fn range_available(g: &TimeoutGuards) -> bool {
    g.range_available
}
fn vision_lost_baro_available(g: &TimeoutGuards) -> bool {
    !g.vision_available && g.baro_available
}
fn vision_available(g: &TimeoutGuards) -> bool {
    g.vision_available
}

type TimeoutReset = Transition<HeightSource, TimeoutGuards>;

/// Reset target per active source, in priority order.
pub const TIMEOUT_TABLE: &[TimeoutReset] = &[
    Transition {
        from: Some(HeightSource::Baro),
        guard: reset_baro_to_gnss,
        to: HeightSource::Gnss,
        action: (),
    },
    Transition {
        from: Some(HeightSource::Baro),
        guard: baro_lost_gnss_available,
        to: HeightSource::Gnss,
        action: (),
    },
    Transition {
        from: Some(HeightSource::Baro),
        guard: baro_available,
        to: HeightSource::Baro,
        action: (),
    },
    Transition {
        from: Some(HeightSource::Gnss),
        guard: reset_gnss_to_baro,
        to: HeightSource::Baro,
        action: (),
    },
    Transition {
        from: Some(HeightSource::Gnss),
        guard: gnss_lost_baro_available,
        to: HeightSource::Baro,
        action: (),
    },
    Transition {
        from: Some(HeightSource::Gnss),
        guard: gnss_available,
        to: HeightSource::Gnss,
        action: (),
    },
    Transition {
        from: Some(HeightSource::Range),
        guard: range_lost_baro_available,
        to: HeightSource::Baro,
        action: (),
    },
    Transition {
        from: Some(HeightSource::Range),
        guard: range_available,
        to: HeightSource::Range,
        action: (),
    },
    Transition {
        from: Some(HeightSource::Vision),
        guard: vision_lost_baro_available,
        to: HeightSource::Baro,
        action: (),
    },
    Transition {
        from: Some(HeightSource::Vision),
        guard: vision_available,
        to: HeightSource::Vision,
        action: (),
    },
];

/// Latched height source faults, set when a timeout reset moves away from a source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeightFaults {
    pub baro: bool,
    pub gnss: bool,
    pub range: bool,
    pub vision: bool,
}
impl HeightFaults {
    pub fn get(&self, source: HeightSource) -> bool {
        match source {
            HeightSource::Baro => self.baro,
            HeightSource::Gnss => self.gnss,
            HeightSource::Range => self.range,
            HeightSource::Vision => self.vision,
        }
    }
    pub fn set(&mut self, source: HeightSource, faulty: bool) {
        match source {
            HeightSource::Baro => self.baro = faulty,
            HeightSource::Gnss => self.gnss = faulty,
            HeightSource::Range => self.range = faulty,
            HeightSource::Vision => self.vision = faulty,
        }
    }
}

/// The height channel state machine.
#[derive(Clone, Debug)]
pub struct HeightControl {
    primary: HeightSource,
    baro: BaroConfig,
    gnss: GnssConfig,
    range: RangeConfig,
    vision: VisionConfig,
    timeouts: TimeoutConfig,
    bad_accel: BadAccelConfig,
    initial: InitialUncertainty,
    gnss_offset: Vector3<f64>,
    range_offset: Vector3<f64>,
    vision_offset: Vector3<f64>,
    /// Baro height at the origin, m
    baro_origin: f64,
    /// Offset added to the raw down position of the active source, m
    sensor_offset: f64,
    /// The offset must be recomputed from the next sample of the active source
    offset_pending: bool,
    faults: HeightFaults,
    range_aid: bool,
    last_baro: Option<BaroSample>,
    last_gnss: Option<GnssSample>,
    last_range: Option<RangeSample>,
    last_vision: Option<VisionSample>,
}

impl HeightControl {
    pub fn new(config: &EstimatorConfig) -> Self {
        let offsets: &SensorOffsets = &config.offsets;
        let imu = Vector3::from(offsets.imu);
        HeightControl {
            primary: config.height_source,
            baro: config.baro,
            gnss: config.gnss,
            range: config.range,
            vision: config.vision,
            timeouts: config.timeouts,
            bad_accel: config.bad_accel,
            initial: config.initial,
            gnss_offset: Vector3::from(offsets.gnss) - imu,
            range_offset: Vector3::from(offsets.range) - imu,
            vision_offset: Vector3::from(offsets.vision) - imu,
            baro_origin: 0.0,
            sensor_offset: 0.0,
            offset_pending: false,
            faults: HeightFaults::default(),
            range_aid: false,
            last_baro: None,
            last_gnss: None,
            last_range: None,
            last_vision: None,
        }
    }
    /// Define the baro height of the origin from the newest baro sample at initialization.
    pub fn initialize(&mut self, baro_height: Option<f64>, state: &NavigationState) {
        self.baro_origin = baro_height.unwrap_or(0.0) + state.position[2];
        self.sensor_offset = 0.0;
        self.offset_pending = false;
    }
    pub fn faults(&self) -> HeightFaults {
        self.faults
    }
    pub fn sensor_offset(&self) -> f64 {
        self.sensor_offset
    }
    pub fn baro_origin(&self) -> f64 {
        self.baro_origin
    }
    pub fn range_aid(&self) -> bool {
        self.range_aid
    }

    fn baro_down(&self, sample: &BaroSample) -> f64 {
        -(sample.height - self.baro_origin)
    }
    fn gnss_down(
        &self,
        sample: &GnssSample,
        gnss: &GnssMonitor,
        state: &NavigationState,
    ) -> Option<f64> {
        let lever = state.rotation() * self.gnss_offset;
        gnss.height_down(sample).map(|down| down - lever[2])
    }
    /// Negative height above ground of the vehicle reference point, from a slant range
    fn range_down(&self, range: f64, state: &NavigationState) -> f64 {
        let rotation = state.rotation();
        let lever = rotation * self.range_offset;
        -(range * rotation[(2, 2)] + lever[2])
    }
    fn vision_down(&self, sample: &VisionSample, state: &NavigationState) -> f64 {
        let lever = state.rotation() * self.vision_offset;
        sample.position[2] - lever[2]
    }
    /// Offset that maps a source onto the origin without continuity adjustment.
    fn calibrated_offset(&self, source: HeightSource, terrain: &TerrainEstimator) -> f64 {
        match source {
            HeightSource::Range => terrain.terrain_down(),
            _ => 0.0,
        }
    }
    fn noise_std(
        &self,
        source: HeightSource,
        range: Option<f64>,
        gnss: Option<&GnssSample>,
        vision: Option<&VisionSample>,
    ) -> f64 {
        match source {
            HeightSource::Baro => self.baro.noise,
            HeightSource::Gnss => {
                1.5 * gnss
                    .map_or(self.gnss.position_noise, |g| g.vertical_accuracy)
                    .max(self.gnss.position_noise)
            }
            HeightSource::Range => self.range.noise + self.range.noise_scaler * range.unwrap_or(0.0),
            HeightSource::Vision => vision
                .map_or(self.vision.min_position_noise, |v| v.position_error)
                .max(self.vision.min_position_noise),
        }
    }
    fn gate(&self, source: HeightSource) -> f64 {
        match source {
            HeightSource::Baro | HeightSource::Gnss => self.baro.gate,
            HeightSource::Range => self.range.gate,
            HeightSource::Vision => self.vision.gate,
        }
    }

    /// Reset the vertical position to a new source when height aiding has stopped constraining the
    /// filter, or the accelerometer has been bad for longer than the reset delay.
    pub fn check_timeouts(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        freshness: &Freshness,
        gnss: &GnssMonitor,
        terrain: &TerrainEstimator,
        bad_accel: &BadAccelMonitor,
    ) -> EstimatorResult<()> {
        let now = ctx.time_us();
        let current = ctx.status.height_source;
        let variance = core.variance(POSITION.start + 2);
        if !(variance > self.bad_accel.height_reset_limit.powi(2)) {
            return Ok(());
        }
        let stale = ctx.since_fused_us(current.channel()) > self.timeouts.height_fusion_us();
        if !(stale || bad_accel.is_continuously_bad(now)) {
            return Ok(());
        }
        let state = *core.state();
        let baro_consistent = self.last_baro.is_some_and(|sample| {
            let innovation = self.baro_down(&sample) - state.position[2];
            innovation.powi(2) < (self.baro.noise.powi(2) + variance) * self.baro.gate.powi(2)
        });
        let guards = TimeoutGuards {
            baro_available: freshness.baro && self.last_baro.is_some(),
            baro_consistent,
            baro_faulty: self.faults.baro,
            gnss_available: freshness.gnss_height
                && gnss.origin().is_some()
                && self.last_gnss.is_some(),
            gnss_accurate: gnss.is_vertically_accurate(),
            gnss_faulty: self.faults.gnss,
            bad_accel_probation: bad_accel.in_probation(now),
            range_available: freshness.range
                && !ctx.status.range_stuck
                && self.last_range.is_some(),
            vision_available: freshness.vision && self.last_vision.is_some(),
        };
        let Some(target) = select(TIMEOUT_TABLE, current, &guards).map(|row| row.to) else {
            return Ok(());
        };
        let raw = match target {
            HeightSource::Baro => self.last_baro.map(|s| self.baro_down(&s)),
            HeightSource::Gnss => self
                .last_gnss
                .and_then(|s| self.gnss_down(&s, gnss, &state)),
            HeightSource::Range => self.last_range.map(|s| self.range_down(s.range, &state)),
            HeightSource::Vision => self.last_vision.map(|s| self.vision_down(&s, &state)),
        };
        let Some(raw) = raw else {
            return Ok(());
        };
        self.faults.set(target, false);
        if target != current {
            self.faults.set(current, true);
        }
        self.sensor_offset = self.calibrated_offset(target, terrain);
        self.offset_pending = false;
        let height = raw + self.sensor_offset;
        let noise = self.noise_std(
            target,
            self.last_range.map(|s| s.range),
            self.last_gnss.as_ref(),
            self.last_vision.as_ref(),
        );
        let mut delta = core.reset_vertical_position(height, noise.powi(2));
        let velocity_down = match self.last_gnss {
            Some(sample) if freshness.gnss_height => {
                (sample.velocity[2], sample.speed_accuracy.max(self.gnss.velocity_noise).powi(2))
            }
            _ => (0.0, self.initial.velocity.powi(2)),
        };
        delta = delta.then(&core.reset_vertical_velocity(velocity_down.0, velocity_down.1));
        warn!(
            "height timeout: reset to {:?} height {:.2} m (was {:?})",
            target, height, current
        );
        ctx.record_reset(ResetReason::HeightTimeout, delta);
        if target != current {
            ctx.emit(FilterEvent::HeightSourceChanged {
                time_us: now,
                from: current,
                to: target,
            });
        }
        ctx.status.height_source = target;
        ctx.touch(target.channel());
        Ok(())
    }

    /// Evaluate the range-aid hysteresis.
    ///
    /// Entry needs every condition met with margin; once aiding, only the plain limits apply.
    fn update_range_aid(
        &self,
        ctx: &FilterContext,
        state: &NavigationState,
        terrain: &TerrainEstimator,
    ) -> bool {
        if !self.range.aid {
            return false;
        }
        let now = ctx.time_us();
        let eligible = terrain.is_valid(now)
            && ctx.status.horizontal != HorizontalAiding::None
            && !self.faults.range
            && !ctx.status.range_stuck
            && ctx.faults.is_clear();
        if !eligible {
            return false;
        }
        let hagl = terrain.hagl(state);
        let speed = ground_speed(state);
        let ratio = terrain.test_ratio(self.range.aid_gate);
        let (fraction, ratio_limit) = if self.range_aid {
            (1.0, RANGE_AID_STAY_RATIO)
        } else {
            (RANGE_AID_ENTRY_FRACTION, RANGE_AID_ENTRY_RATIO)
        };
        hagl < fraction * self.range.max_hagl
            && speed < fraction * self.range.max_velocity
            && ratio < ratio_limit
    }

    /// Select the active height source and fuse its sample.
    ///
    /// Returns true when a height observation was applied this cycle.
    pub fn step(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        samples: &AlignedSamples,
        range: Option<RangeSample>,
        gnss: &GnssMonitor,
        terrain: &TerrainEstimator,
        freshness: &Freshness,
    ) -> EstimatorResult<bool> {
        let now = ctx.time_us();
        let state = *core.state();
        let current = ctx.status.height_source;

        if let Some(sample) = samples.baro {
            if current != HeightSource::Baro {
                let dt = self
                    .last_baro
                    .map_or(0.0, |last| sample.time_us.saturating_sub(last.time_us) as f64 * 1e-6);
                let error = sample.height + state.position[2] - self.baro_origin;
                self.baro_origin += (BARO_OFFSET_RATE * error)
                    .clamp(-BARO_OFFSET_RATE_LIMIT, BARO_OFFSET_RATE_LIMIT)
                    * dt;
            }
            self.last_baro = Some(sample);
        }
        if let Some(sample) = samples.gnss {
            self.last_gnss = Some(sample);
        }
        if let Some(sample) = range {
            self.last_range = Some(sample);
        }
        if let Some(sample) = samples.vision {
            self.last_vision = Some(sample);
        }

        self.range_aid = self.update_range_aid(ctx, &state, terrain);
        ctx.status.range_aid = self.range_aid;

        let gnss_sample = samples.gnss.filter(|_| gnss.origin().is_some());
        let guards = SelectionGuards {
            baro_ready: samples.baro.is_some(),
            baro_faulty: self.faults.baro,
            gnss_ready: gnss_sample.is_some(),
            gnss_faulty: self.faults.gnss,
            range_ready: range.is_some(),
            range_faulty: self.faults.range,
            vision_ready: samples.vision.is_some(),
            vision_fresh: freshness.vision,
            range_aid: self.range_aid,
        };
        let source = select(selection_table(self.primary), current, &guards)
            .map_or(current, |t| t.to);
        if source != current {
            info!("height source changed from {:?} to {:?} at {} us", current, source, now);
            ctx.status.height_source = source;
            ctx.emit(FilterEvent::HeightSourceChanged {
                time_us: now,
                from: current,
                to: source,
            });
            self.offset_pending = true;
        }

        let raw = match source {
            HeightSource::Baro => samples.baro.map(|s| self.baro_down(&s)),
            HeightSource::Gnss => gnss_sample.and_then(|s| self.gnss_down(&s, gnss, &state)),
            HeightSource::Range => match range {
                Some(sample) => Some(self.range_down(sample.range, &state)),
                None => {
                    let on_ground_due = !ctx.status.in_air
                        && ctx.since_fused_us(source.channel()) > ON_GROUND_RANGE_INTERVAL_US;
                    on_ground_due.then_some(-self.range.ground_clearance)
                }
            },
            HeightSource::Vision => samples.vision.map(|s| self.vision_down(&s, &state)),
        };
        let Some(raw) = raw else {
            return Ok(false);
        };
        if self.offset_pending {
            self.sensor_offset = state.position[2] - raw;
            self.offset_pending = false;
        }
        let model = HeightMeasurement {
            channel: source.channel(),
            down: raw + self.sensor_offset,
            noise_std: self.noise_std(
                source,
                range.map(|s| s.range),
                gnss_sample.as_ref(),
                samples.vision.as_ref(),
            ),
        };
        let observation = Observation::new(&model, &state, self.gate(source));
        ctx.fuse(core, &observation)
    }
}
