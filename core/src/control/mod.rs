//! Fusion mode controller.
//!
//! Once per inertial sample, after prediction, the controller decides which aligned sensor samples
//! are fused, which aiding sources are active, and when the state must be reset. Its decisions are
//! split into one finite state machine per aiding channel:
//!
//! - [height]: the active height source and the height timeout resets,
//! - [horizontal]: the horizontal aiding source (GNSS, vision, optical flow or dead reckoning),
//! - [heading]: the heading source and the magnetometer fusion mode,
//!
//! plus the auxiliary channels in [auxiliary] (wind and airspeed, terrain, range finder checks and
//! the bad vertical accelerometer monitor) and the GNSS receiver checks in [gnss].
//!
//! Every state machine is written as a declared table of [`Transition`]s that is evaluated with
//! [`select`]. Guards are computed into a plain struct first, so every transition can be tested on
//! its own by building a guard value by hand.
//!
//! All mutable status, timers and queued events live in one [`FilterContext`] that is owned by the
//! estimator and handed to the controller by reference each cycle.

pub mod auxiliary;
pub mod gnss;
pub mod heading;
pub mod height;
pub mod horizontal;

use std::fmt::{self, Debug};

use log::{info, warn};
use nalgebra::{Vector2, Vector3};

use crate::buffer::SensorBuffers;
use crate::config::EstimatorConfig;
use crate::ekf::{CoreEstimator, FusionOutcome};
use crate::error::EstimatorResult;
use crate::health::HealthTransition;
use crate::linearize::ActiveStates;
use crate::measurements::Observation;
use crate::messages::SensorKind;
use crate::status::{
    Channel, ControlStatus, FaultStatus, FilterEvent, HeadingMode, HorizontalAiding,
    InnovationRecords, ResetDelta, ResetReason, ResetStatus,
};
use crate::InertialIncrement;

use auxiliary::{AirDataControl, BadAccelMonitor, RangeChecks, TerrainEstimator};
use gnss::GnssMonitor;
use heading::HeadingControl;
use height::HeightControl;
use horizontal::HorizontalControl;

/// Sum of the roll and pitch error variances below which tilt alignment is complete, (3 deg)²
pub const TILT_ALIGN_VARIANCE: f64 = 0.05235 * 0.05235;

/// Channels whose accepted fusion constrains horizontal drift.
pub const AIDING_CHANNELS: [Channel; 4] = [
    Channel::GnssVelocity,
    Channel::GnssPosition,
    Channel::VisionPosition,
    Channel::OpticalFlow,
];

/// One row of a state machine transition table.
///
/// A row matches when the machine is in `from` (any state when `None`) and `guard` holds. Rows are
/// evaluated in order and the first match wins, so the order of a table encodes priority.
pub struct Transition<S, G, A = ()> {
    pub from: Option<S>,
    pub guard: fn(&G) -> bool,
    pub to: S,
    pub action: A,
}
impl<S: Debug, G, A: Debug> Debug for Transition<S, G, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("action", &self.action)
            .finish()
    }
}

/// First row of `table` that matches `state` and `guards`.
pub fn select<'a, S, G, A>(
    table: &'a [Transition<S, G, A>],
    state: S,
    guards: &G,
) -> Option<&'a Transition<S, G, A>>
where
    S: Copy + PartialEq,
{
    table
        .iter()
        .find(|row| row.from.is_none_or(|from| from == state) && (row.guard)(guards))
}

/// Data freshness at the delayed time horizon.
///
/// Every limit is the channel's own multiple of its nominal interval.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Freshness {
    pub baro: bool,
    pub gnss_height: bool,
    pub range: bool,
    /// Vision arriving often enough to start using it
    pub vision: bool,
    pub gnss_stopped: bool,
    pub vision_stopped: bool,
    pub flow_stopped: bool,
}
impl Freshness {
    pub fn evaluate(buffers: &SensorBuffers, now_us: u64, config: &EstimatorConfig) -> Self {
        let timeouts = &config.timeouts;
        let within = |kind: SensorKind, limit_us: u64| {
            buffers.age_us(kind, now_us).is_some_and(|age| age < limit_us)
        };
        Freshness {
            baro: within(SensorKind::Barometer, timeouts.baro_faulty_us()),
            gnss_height: within(SensorKind::Gnss, timeouts.gnss_height_faulty_us()),
            range: within(SensorKind::RangeFinder, timeouts.range_faulty_us()),
            vision: within(SensorKind::Vision, timeouts.vision_fresh_us()),
            gnss_stopped: !within(SensorKind::Gnss, timeouts.gnss_stopped_us()),
            vision_stopped: !within(SensorKind::Vision, timeouts.vision_stopped_us()),
            flow_stopped: !within(SensorKind::OpticalFlow, timeouts.flow_stopped_us()),
        }
    }
}

/// Status, timers and event queue of one estimator instance.
#[derive(Clone)]
pub struct FilterContext {
    pub status: ControlStatus,
    pub faults: FaultStatus,
    pub innovations: InnovationRecords,
    pub resets: ResetStatus,
    events: Vec<FilterEvent>,
    /// Time of the last applied fusion per channel
    last_fused_us: [Option<u64>; Channel::COUNT],
    /// Resets not yet replayed by the output predictor
    pending_reset: Option<ResetDelta>,
    /// The output predictor must be realigned to the core state
    pub align_output: bool,
    /// Horizontal position held while dead reckoning
    pub last_known_position: Vector2<f64>,
    time_us: u64,
}
impl Debug for FilterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterContext")
            .field("time_us", &self.time_us)
            .field("status", &self.status)
            .field("resets", &self.resets)
            .field("queued_events", &self.events.len())
            .finish()
    }
}
impl FilterContext {
    pub fn new(config: &EstimatorConfig) -> Self {
        FilterContext {
            status: ControlStatus::default(),
            faults: FaultStatus::new(&config.health),
            innovations: InnovationRecords::default(),
            resets: ResetStatus::default(),
            events: Vec::new(),
            last_fused_us: [None; Channel::COUNT],
            pending_reset: None,
            align_output: false,
            last_known_position: Vector2::zeros(),
            time_us: 0,
        }
    }
    pub fn time_us(&self) -> u64 {
        self.time_us
    }
    pub fn set_time_us(&mut self, time_us: u64) {
        self.time_us = time_us;
    }
    pub fn emit(&mut self, event: FilterEvent) {
        self.events.push(event);
    }
    pub fn events(&self) -> &[FilterEvent] {
        &self.events
    }
    pub fn drain_events(&mut self) -> Vec<FilterEvent> {
        std::mem::take(&mut self.events)
    }
    pub fn last_fused_us(&self, channel: Channel) -> Option<u64> {
        self.last_fused_us[channel.index()]
    }
    /// Time since `channel` was last fused; `u64::MAX` if it never was.
    pub fn since_fused_us(&self, channel: Channel) -> u64 {
        self.last_fused_us(channel)
            .map_or(u64::MAX, |t| self.time_us.saturating_sub(t))
    }
    /// Restart the fusion timer of `channel` as if it had just been fused.
    pub fn touch(&mut self, channel: Channel) {
        self.last_fused_us[channel.index()] = Some(self.time_us);
    }
    /// True when none of `channels` was fused within `limit_us`.
    pub fn all_stale(&self, channels: &[Channel], limit_us: u64) -> bool {
        channels.iter().all(|c| self.since_fused_us(*c) > limit_us)
    }

    /// Record a state reset for the status mirror, the output predictor and the event queue.
    pub fn record_reset(&mut self, reason: ResetReason, delta: ResetDelta) {
        warn!("state reset ({:?}) at {} us", reason, self.time_us);
        self.resets.record(self.time_us, &delta);
        self.pending_reset = Some(match self.pending_reset {
            Some(pending) => pending.then(&delta),
            None => delta,
        });
        self.emit(FilterEvent::StateReset {
            time_us: self.time_us,
            reason,
            delta,
        });
    }
    pub fn take_pending_reset(&mut self) -> Option<ResetDelta> {
        self.pending_reset.take()
    }

    /// Fuse `observation` through the health tracker of its channel.
    ///
    /// A healthy channel's observation is gated and, if it passes, applied. An unhealthy channel's
    /// observation is only gated: passes count towards recovery but nothing is applied. Returns true
    /// when the observation was applied.
    pub fn fuse(
        &mut self,
        core: &mut CoreEstimator,
        observation: &Observation,
    ) -> EstimatorResult<bool> {
        let channel = observation.channel;
        let healthy = self.faults.is_healthy(channel);
        let report = if healthy {
            core.fuse(observation)?
        } else {
            core.gate(observation)?
        };
        self.innovations.set(channel, report.record(self.time_us));
        if report.outcome == FusionOutcome::Degenerate {
            warn!("{} fusion skipped: innovation variance below observation variance", channel);
            self.faults.set_numerical(channel, true);
            return Ok(false);
        }
        self.faults.set_numerical(channel, false);
        let passed = report.outcome.is_accepted();
        match self.faults.record(channel, passed) {
            Some(HealthTransition::BecameUnhealthy) => {
                warn!("{} marked unhealthy after repeated gate failures", channel);
                self.emit(FilterEvent::ChannelUnhealthy {
                    time_us: self.time_us,
                    channel,
                });
            }
            Some(HealthTransition::BecameHealthy) => {
                info!("{} healthy again", channel);
                self.emit(FilterEvent::ChannelRecovered {
                    time_us: self.time_us,
                    channel,
                });
            }
            None => {}
        }
        let applied = passed && healthy;
        if applied {
            self.touch(channel);
        }
        Ok(applied)
    }
}

/// The fusion mode controller: one state machine per aiding channel plus the auxiliary monitors.
#[derive(Clone, Debug)]
pub struct FusionController {
    config: EstimatorConfig,
    pub(crate) gnss: GnssMonitor,
    height: HeightControl,
    horizontal: HorizontalControl,
    heading: HeadingControl,
    air_data: AirDataControl,
    terrain: TerrainEstimator,
    range_checks: RangeChecks,
    bad_accel: BadAccelMonitor,
}
impl FusionController {
    pub fn new(config: &EstimatorConfig) -> Self {
        FusionController {
            config: config.clone(),
            gnss: GnssMonitor::new(config),
            height: HeightControl::new(config),
            horizontal: HorizontalControl::new(config),
            heading: HeadingControl::new(config),
            air_data: AirDataControl::new(config),
            terrain: TerrainEstimator::new(config),
            range_checks: RangeChecks::new(config),
            bad_accel: BadAccelMonitor::new(config),
        }
    }
    pub fn gnss(&self) -> &GnssMonitor {
        &self.gnss
    }
    pub fn height(&self) -> &HeightControl {
        &self.height
    }
    pub fn horizontal(&self) -> &HorizontalControl {
        &self.horizontal
    }
    pub fn heading(&self) -> &HeadingControl {
        &self.heading
    }
    pub fn terrain(&self) -> &TerrainEstimator {
        &self.terrain
    }
    pub fn bad_accel(&self) -> &BadAccelMonitor {
        &self.bad_accel
    }
    /// Seed the controller at filter initialization.
    pub fn initialize(&mut self, baro_height: Option<f64>, core: &CoreEstimator) {
        self.height.initialize(baro_height, core.state());
        self.heading.initialize(core.state());
        self.terrain.initialize_on_ground(core.state());
    }

    /// Run one control cycle at the core's delayed time, after prediction.
    ///
    /// # Arguments
    /// * `ctx` - status, timers and events of this estimator instance
    /// * `core` - the core estimator, already predicted to the delayed time
    /// * `buffers` - sensor buffers; aligned samples are popped from them
    /// * `increment` - the bias-corrected increment of the inertial sample just predicted
    pub fn run(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        buffers: &mut SensorBuffers,
        increment: &InertialIncrement,
    ) -> EstimatorResult<()> {
        let now = core.time_us();
        ctx.set_time_us(now);
        self.heading.monitor_excitation(core.state(), increment);

        if !ctx.status.tilt_align && core.tilt_variance() < TILT_ALIGN_VARIANCE {
            ctx.status.tilt_align = true;
            info!(
                "tilt alignment complete at {} us (height source {:?})",
                now, ctx.status.height_source
            );
            ctx.emit(FilterEvent::TiltAligned { time_us: now });
            self.heading.align_yaw(ctx, core);
        }

        let freshness = Freshness::evaluate(buffers, now, &self.config);
        let samples = buffers.pop_aligned(now);
        if let Some(sample) = samples.gnss {
            self.gnss.try_set_origin(&sample, core);
        }
        let range = samples
            .range
            .and_then(|sample| self.range_checks.check(&sample, core.state(), ctx.status.in_air));
        ctx.status.range_stuck = self.range_checks.is_stuck();

        self.height.check_timeouts(
            ctx,
            core,
            &freshness,
            &self.gnss,
            &self.terrain,
            &self.bad_accel,
        )?;
        self.heading.step(
            ctx,
            core,
            samples.mag.as_ref(),
            samples.vision.as_ref(),
            samples.gnss.as_ref(),
            &freshness,
        )?;
        self.horizontal.step(
            ctx,
            core,
            &mut self.heading,
            &self.gnss,
            &self.terrain,
            &samples,
            increment,
            &freshness,
        )?;
        self.air_data.step(ctx, core, samples.airspeed.as_ref())?;

        let height_fused = self.height.step(
            ctx,
            core,
            &samples,
            range,
            &self.gnss,
            &self.terrain,
            &freshness,
        )?;
        self.bad_accel.update(ctx, &freshness, core);

        self.horizontal.dead_reckon(ctx, core, height_fused)?;

        self.terrain.step(ctx, core, range, increment.dt);

        let no_aid_us = (self.config.no_aid.no_aid_timeout_s * 1e6) as u64;
        ctx.status.dead_reckoning = ctx.all_stale(&AIDING_CHANNELS, no_aid_us)
            || ctx.status.horizontal == HorizontalAiding::None;

        core.set_active_states(ActiveStates {
            mag: ctx.status.heading == HeadingMode::Magnetic3D,
            wind: ctx.status.wind,
        });
        Ok(())
    }
}

/// Velocity of a point offset from the IMU, caused by body rotation, in NED.
pub(crate) fn lever_arm_velocity(
    rotation: &nalgebra::Rotation3<f64>,
    rate: &Vector3<f64>,
    offset: &Vector3<f64>,
) -> Vector3<f64> {
    rotation * rate.cross(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NavigationState;
    use crate::measurements::HeightMeasurement;

    #[derive(Default)]
    struct Guards {
        a: bool,
        b: bool,
    }
    fn guard_a(g: &Guards) -> bool {
        g.a
    }
    fn guard_b(g: &Guards) -> bool {
        g.b
    }
    const TABLE: &[Transition<u8, Guards>] = &[
        Transition {
            from: Some(0),
            guard: guard_a,
            to: 1,
            action: (),
        },
        Transition {
            from: None,
            guard: guard_b,
            to: 2,
            action: (),
        },
    ];

    #[test]
    fn first_matching_row_wins() {
        let guards = Guards { a: true, b: true };
        assert_eq!(select(TABLE, 0, &guards).map(|t| t.to), Some(1));
        assert_eq!(select(TABLE, 1, &guards).map(|t| t.to), Some(2));
        assert!(select(TABLE, 1, &Guards::default()).is_none());
    }

    fn height(down: f64) -> Observation {
        let model = HeightMeasurement {
            channel: Channel::BaroHeight,
            down,
            noise_std: 0.1,
        };
        Observation::new(&model, &NavigationState::default(), 3.0)
    }

    #[test]
    fn unhealthy_channel_is_tested_but_not_applied() {
        let mut config = EstimatorConfig::default();
        config.health.default.fail_limit = 2;
        config.health.default.pass_limit = 1;
        let mut ctx = FilterContext::new(&config);
        let mut core = CoreEstimator::new(&config, NavigationState::default(), 0);
        assert!(!ctx.fuse(&mut core, &height(-100.0)).unwrap());
        assert!(!ctx.fuse(&mut core, &height(-100.0)).unwrap());
        assert!(!ctx.faults.is_healthy(Channel::BaroHeight));
        assert!(matches!(
            ctx.drain_events().as_slice(),
            [FilterEvent::ChannelUnhealthy { channel: Channel::BaroHeight, .. }]
        ));
        let before = *core.state();
        // passes the gate, restores health, but is not applied
        assert!(!ctx.fuse(&mut core, &height(-0.1)).unwrap());
        assert_eq!(*core.state(), before);
        assert!(ctx.faults.is_healthy(Channel::BaroHeight));
        assert!(ctx.fuse(&mut core, &height(-0.1)).unwrap());
        assert_eq!(ctx.last_fused_us(Channel::BaroHeight), Some(0));
    }

    #[test]
    fn resets_accumulate_until_taken() {
        let config = EstimatorConfig::default();
        let mut ctx = FilterContext::new(&config);
        ctx.record_reset(
            ResetReason::GnssStart,
            ResetDelta::position(Vector3::new(1.0, 0.0, 0.0)),
        );
        ctx.record_reset(
            ResetReason::GnssStart,
            ResetDelta::position(Vector3::new(0.0, 2.0, 0.0)),
        );
        assert_eq!(ctx.resets.position_ne_counter, 2);
        assert_eq!(ctx.resets.cycle.position, Vector3::new(1.0, 2.0, 0.0));
        assert_eq!(ctx.resets.last.position, Vector3::new(0.0, 2.0, 0.0));
        let pending = ctx.take_pending_reset().unwrap();
        assert_eq!(pending.position, Vector3::new(1.0, 2.0, 0.0));
        assert!(ctx.take_pending_reset().is_none());
        assert_eq!(ctx.drain_events().len(), 2);
    }

    #[test]
    fn fusion_timers() {
        let config = EstimatorConfig::default();
        let mut ctx = FilterContext::new(&config);
        assert_eq!(ctx.since_fused_us(Channel::GnssPosition), u64::MAX);
        ctx.set_time_us(1_000_000);
        ctx.touch(Channel::GnssPosition);
        ctx.set_time_us(3_000_000);
        assert_eq!(ctx.since_fused_us(Channel::GnssPosition), 2_000_000);
        assert!(ctx.all_stale(&AIDING_CHANNELS, 1_000_000));
        assert!(!ctx.all_stale(&AIDING_CHANNELS, 2_000_000));
    }
}
