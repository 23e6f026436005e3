//! Horizontal aiding: GNSS, external vision or optical flow, and dead reckoning without them.
//!
//! Exactly one source constrains horizontal drift at a time. A source starts only from dead
//! reckoning, except that GNSS may take over from optical flow. Starting a source resets the
//! horizontal position (and usually velocity) to it, and every reset is recorded for the output
//! predictor. While no source is active, the last known position is fused as a pseudo-measurement
//! to bound the drift.

use log::{info, warn};
use nalgebra::{Vector2, Vector3};

use crate::buffer::AlignedSamples;
use crate::config::{
    AidingMask, EstimatorConfig, FlowConfig, GnssConfig, InitialUncertainty, NoAidConfig,
    RangeConfig, VisionConfig,
};
use crate::ekf::CoreEstimator;
use crate::error::EstimatorResult;
use crate::measurements::{
    HorizontalPositionMeasurement, Observation, OpticalFlowMeasurement, VelocityMeasurement,
};
use crate::messages::{FlowSample, GnssSample, VisionSample};
use crate::status::{Channel, FilterEvent, HorizontalAiding, ResetDelta, ResetReason};
use crate::{InertialIncrement, NavigationState};

use super::auxiliary::TerrainEstimator;
use super::gnss::GnssMonitor;
use super::heading::HeadingControl;
use super::{AIDING_CHANNELS, FilterContext, Freshness, Transition, lever_arm_velocity, select};

/// HAGL must have been fused this recently to start optical flow, us
const FLOW_START_HAGL_US: u64 = 500_000;
/// Cosine of the largest tilt at which optical flow is used
const FLOW_MIN_R22: f64 = 0.7071;
/// Flow velocity at start is only trusted this far above the ground clearance, m
const FLOW_START_MIN_HEIGHT: f64 = 0.3;
/// Flow integration period below which the start velocity is not trusted, s
const FLOW_START_MIN_DT: f64 = 0.05;
/// Largest interval between vision samples used to difference a velocity, s
const VISION_VELOCITY_MAX_DT: f64 = 1.0;

/// Inputs of the horizontal aiding table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HorizontalGuards {
    pub tilt_align: bool,
    pub gnss_mask: bool,
    /// Origin set, checks passed outside the hold-off and a sample arrived this cycle
    pub gnss_can_start: bool,
    pub gnss_stopped: bool,
    pub vision_mask: bool,
    pub vision_ready: bool,
    pub vision_stopped: bool,
    pub flow_mask: bool,
    /// Usable flow this cycle and a recently fused height above ground
    pub flow_ready: bool,
    pub flow_stopped: bool,
}

fn gnss_stopped(g: &HorizontalGuards) -> bool {
    g.gnss_stopped
}
fn vision_stopped(g: &HorizontalGuards) -> bool {
    g.vision_stopped
}
fn flow_stopped(g: &HorizontalGuards) -> bool {
    g.flow_stopped
}
fn start_gnss(g: &HorizontalGuards) -> bool {
    g.tilt_align && g.gnss_mask && g.gnss_can_start
}
fn start_vision(g: &HorizontalGuards) -> bool {
    g.tilt_align && g.vision_mask && g.vision_ready
}
fn start_flow(g: &HorizontalGuards) -> bool {
    g.tilt_align && g.flow_mask && g.flow_ready
}

type HorizontalTransition = Transition<HorizontalAiding, HorizontalGuards>;

pub const HORIZONTAL_TABLE: &[HorizontalTransition] = &[
    Transition {
        from: Some(HorizontalAiding::Gnss),
        guard: gnss_stopped,
        to: HorizontalAiding::None,
        action: (),
    },
    Transition {
        from: Some(HorizontalAiding::Vision),
        guard: vision_stopped,
        to: HorizontalAiding::None,
        action: (),
    },
    Transition {
        from: Some(HorizontalAiding::OpticalFlow),
        guard: flow_stopped,
        to: HorizontalAiding::None,
        action: (),
    },
    Transition {
        from: Some(HorizontalAiding::None),
        guard: start_gnss,
        to: HorizontalAiding::Gnss,
        action: (),
    },
    Transition {
        from: Some(HorizontalAiding::None),
        guard: start_vision,
        to: HorizontalAiding::Vision,
        action: (),
    },
    Transition {
        from: Some(HorizontalAiding::None),
        guard: start_flow,
        to: HorizontalAiding::OpticalFlow,
        action: (),
    },
    Transition {
        from: Some(HorizontalAiding::OpticalFlow),
        guard: start_gnss,
        to: HorizontalAiding::Gnss,
        action: (),
    },
];

/// Observation noise of a flow sample, interpolated between the worst and best quality.
pub fn flow_noise(config: &FlowConfig, quality: u8) -> f64 {
    let span = f64::from(255u8.saturating_sub(config.quality_min).max(1));
    let weight = (f64::from(quality.saturating_sub(config.quality_min)) / span).clamp(0.0, 1.0);
    config.noise_quality_min + (config.noise - config.noise_quality_min) * weight
}

/// The horizontal aiding state machine.
#[derive(Clone, Debug)]
pub struct HorizontalControl {
    aiding: AidingMask,
    gnss: GnssConfig,
    vision: VisionConfig,
    flow: FlowConfig,
    range: RangeConfig,
    no_aid: NoAidConfig,
    initial: InitialUncertainty,
    gnss_offset: Vector3<f64>,
    vision_offset: Vector3<f64>,
    flow_offset: Vector3<f64>,
    last_vision: Option<VisionSample>,
    last_fake_us: Option<u64>,
}

impl HorizontalControl {
    pub fn new(config: &EstimatorConfig) -> Self {
        let imu = Vector3::from(config.offsets.imu);
        HorizontalControl {
            aiding: config.aiding,
            gnss: config.gnss,
            vision: config.vision,
            flow: config.flow,
            range: config.range,
            no_aid: config.no_aid,
            initial: config.initial,
            gnss_offset: Vector3::from(config.offsets.gnss) - imu,
            vision_offset: Vector3::from(config.offsets.vision) - imu,
            flow_offset: Vector3::from(config.offsets.flow) - imu,
            last_vision: None,
            last_fake_us: None,
        }
    }
    fn no_gnss_timeout_us(&self) -> u64 {
        (self.no_aid.no_gnss_timeout_s * 1e6) as u64
    }
    fn gnss_position_noise(&self, sample: &GnssSample) -> f64 {
        let lower = self.gnss.position_noise.max(0.01);
        let upper = self.no_aid.noise.max(lower);
        sample.horizontal_accuracy.clamp(lower, upper)
    }
    fn gnss_velocity_noise(&self, sample: &GnssSample) -> f64 {
        sample.speed_accuracy.max(self.gnss.velocity_noise)
    }
    fn vision_noise(&self, sample: &VisionSample) -> f64 {
        sample.position_error.max(self.vision.min_position_noise)
    }
    /// GNSS position and velocity moved from the antenna to the IMU.
    fn gnss_at_imu(
        &self,
        gnss: &GnssMonitor,
        sample: &GnssSample,
        state: &NavigationState,
        increment: &InertialIncrement,
    ) -> Option<(Vector2<f64>, Vector3<f64>)> {
        let rotation = state.rotation();
        let lever = rotation * self.gnss_offset;
        let rate = if increment.dt > 0.0 {
            increment.delta_angle / increment.dt
        } else {
            Vector3::zeros()
        };
        let velocity = sample.velocity - lever_arm_velocity(&rotation, &rate, &self.gnss_offset);
        gnss.position_ne(sample)
            .map(|ne| (ne - Vector2::new(lever[0], lever[1]), velocity))
    }
    fn vision_at_imu(&self, sample: &VisionSample, state: &NavigationState) -> Vector2<f64> {
        let lever = state.rotation() * self.vision_offset;
        Vector2::new(sample.position[0] - lever[0], sample.position[1] - lever[1])
    }
    fn flow_usable(&self, sample: &FlowSample, state: &NavigationState) -> bool {
        sample.quality >= self.flow.quality_min
            && sample.dt > 0.0
            && state.rotation()[(2, 2)] > FLOW_MIN_R22
    }
    /// Distance from the flow sensor to the ground along its axis, assuming flat ground.
    fn flow_range(&self, terrain: &TerrainEstimator, state: &NavigationState) -> f64 {
        terrain.hagl(state).max(self.range.ground_clearance) / state.rotation()[(2, 2)]
    }
    /// Line-of-sight rate with the body rotation and the sensor's lever-arm motion removed.
    fn flow_rate(&self, sample: &FlowSample, increment: &InertialIncrement, range: f64) -> Vector2<f64> {
        let compensated = (sample.flow - sample.body_rotation.fixed_rows::<2>(0)) / sample.dt;
        let rate = if increment.dt > 0.0 {
            increment.delta_angle / increment.dt
        } else {
            Vector3::zeros()
        };
        let lever = rate.cross(&self.flow_offset);
        compensated - Vector2::new(lever[1] / range, -lever[0] / range)
    }

    fn reset_to_gnss(
        &self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        position: Vector2<f64>,
        velocity: Option<Vector3<f64>>,
        sample: &GnssSample,
    ) -> ResetDelta {
        let mut delta = ResetDelta::default();
        if let Some(velocity) = velocity {
            let variance = self.gnss_velocity_noise(sample).powi(2);
            let horizontal = core.reset_horizontal_velocity(Vector2::new(velocity[0], velocity[1]), variance);
            let vertical = core.reset_vertical_velocity(velocity[2], variance);
            delta = horizontal.then(&vertical);
        }
        let variance = self.gnss_position_noise(sample).powi(2);
        delta = delta.then(&core.reset_horizontal_position(position, variance));
        for channel in [Channel::GnssPosition, Channel::GnssVelocity] {
            ctx.touch(channel);
            ctx.faults.reset_channel(channel);
        }
        delta
    }

    fn reset_to_vision(
        &self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        sample: &VisionSample,
    ) -> ResetDelta {
        let state = *core.state();
        let position = self.vision_at_imu(sample, &state);
        let noise = self.vision_noise(sample);
        let previous = self.last_vision.and_then(|last| {
            let dt = sample.time_us.saturating_sub(last.time_us) as f64 * 1e-6;
            (dt > 0.0 && dt <= VISION_VELOCITY_MAX_DT).then_some((last, dt))
        });
        let (velocity, variance) = match previous {
            Some((last, dt)) => (
                (position - self.vision_at_imu(&last, &state)) / dt,
                2.0 * noise.powi(2) / dt.powi(2),
            ),
            None => (Vector2::zeros(), self.initial.velocity.powi(2)),
        };
        let delta = core
            .reset_horizontal_velocity(velocity, variance)
            .then(&core.reset_horizontal_position(position, noise.powi(2)));
        ctx.touch(Channel::VisionPosition);
        ctx.faults.reset_channel(Channel::VisionPosition);
        delta
    }

    fn reset_to_flow(
        &self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        terrain: &TerrainEstimator,
        sample: &FlowSample,
        increment: &InertialIncrement,
    ) -> ResetDelta {
        let state = *core.state();
        let range = self.flow_range(terrain, &state);
        let measurable = range - self.range.ground_clearance > FLOW_START_MIN_HEIGHT
            && sample.dt > FLOW_START_MIN_DT;
        let velocity = if measurable {
            let rate = self.flow_rate(sample, increment, range);
            let body = Vector3::new(-rate[1] * range, rate[0] * range, 0.0);
            let nav = state.rotation() * body;
            Vector2::new(nav[0], nav[1])
        } else {
            Vector2::zeros()
        };
        let variance = range.powi(2) * flow_noise(&self.flow, sample.quality).powi(2);
        let mut delta = core.reset_horizontal_velocity(velocity, variance);
        let position = if ctx.status.in_air {
            (ctx.last_known_position, self.no_aid.noise.powi(2))
        } else {
            (Vector2::zeros(), self.no_aid.on_ground_noise.powi(2))
        };
        delta = delta.then(&core.reset_horizontal_position(position.0, position.1));
        ctx.touch(Channel::OpticalFlow);
        ctx.faults.reset_channel(Channel::OpticalFlow);
        ctx.align_output = true;
        delta
    }

    #[allow(clippy::too_many_arguments)]
    fn start(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        heading: &mut HeadingControl,
        gnss: &GnssMonitor,
        terrain: &TerrainEstimator,
        samples: &AlignedSamples,
        increment: &InertialIncrement,
        from: HorizontalAiding,
        to: HorizontalAiding,
    ) {
        if !ctx.status.yaw_align && !heading.reset_mag_heading(ctx, core) {
            return;
        }
        let state = *core.state();
        let started = match to {
            HorizontalAiding::Gnss => samples.gnss.and_then(|sample| {
                let (position, velocity) = self.gnss_at_imu(gnss, &sample, &state, increment)?;
                let velocity = (from != HorizontalAiding::OpticalFlow).then_some(velocity);
                let delta = self.reset_to_gnss(ctx, core, position, velocity, &sample);
                Some((ResetReason::GnssStart, delta))
            }),
            HorizontalAiding::Vision => samples
                .vision
                .map(|sample| (ResetReason::VisionStart, self.reset_to_vision(ctx, core, &sample))),
            HorizontalAiding::OpticalFlow => samples.flow.map(|sample| {
                let delta = self.reset_to_flow(ctx, core, terrain, &sample, increment);
                (ResetReason::FlowStart, delta)
            }),
            HorizontalAiding::None => None,
        };
        let Some((reason, delta)) = started else {
            return;
        };
        ctx.record_reset(reason, delta);
        info!("starting {:?} aiding (was {:?})", to, from);
        ctx.status.horizontal = to;
        ctx.emit(FilterEvent::AidingStarted {
            time_us: ctx.time_us(),
            source: to,
        });
    }

    fn stop(&mut self, ctx: &mut FilterContext) {
        let source = ctx.status.horizontal;
        info!("{:?} aiding data stopped", source);
        ctx.status.horizontal = HorizontalAiding::None;
        ctx.emit(FilterEvent::AidingStopped {
            time_us: ctx.time_us(),
            source,
        });
    }

    /// Reset to the active source when it has not been fused for too long or was declared unhealthy.
    fn check_hard_resets(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        heading: &mut HeadingControl,
        gnss: &GnssMonitor,
        samples: &AlignedSamples,
        increment: &InertialIncrement,
    ) {
        let timeout_us = self.no_gnss_timeout_us();
        match ctx.status.horizontal {
            HorizontalAiding::Gnss => {
                let Some(sample) = samples.gnss else {
                    return;
                };
                let timed_out = ctx.all_stale(&AIDING_CHANNELS, timeout_us)
                    || ctx.since_fused_us(Channel::GnssPosition) > 2 * timeout_us;
                let unhealthy = gnss.checks_passed()
                    && !(ctx.faults.is_healthy(Channel::GnssPosition)
                        && ctx.faults.is_healthy(Channel::GnssVelocity));
                if !(timed_out || unhealthy) {
                    return;
                }
                if ctx.status.fixed_wing {
                    heading.realign_from_course(ctx, core, &sample);
                }
                let state = *core.state();
                let Some((position, velocity)) = self.gnss_at_imu(gnss, &sample, &state, increment)
                else {
                    return;
                };
                let delta = self.reset_to_gnss(ctx, core, position, Some(velocity), &sample);
                let reason = if timed_out {
                    warn!("gnss fusion timeout: reset to gnss");
                    ResetReason::GnssTimeout
                } else {
                    warn!("gnss channel unhealthy: reset to gnss");
                    ResetReason::GnssUnhealthy
                };
                ctx.record_reset(reason, delta);
            }
            HorizontalAiding::Vision => {
                let Some(sample) = samples.vision else {
                    return;
                };
                let timed_out = !ctx.faults.is_healthy(Channel::VisionPosition)
                    || ctx.since_fused_us(Channel::VisionPosition) > timeout_us;
                if timed_out {
                    warn!("vision position fusion timeout: reset to vision");
                    let delta = self.reset_to_vision(ctx, core, &sample);
                    ctx.record_reset(ResetReason::VisionTimeout, delta);
                }
            }
            _ => {}
        }
    }

    /// Fuse the active source's observations.
    fn fuse(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        gnss: &GnssMonitor,
        terrain: &TerrainEstimator,
        samples: &AlignedSamples,
        increment: &InertialIncrement,
    ) -> EstimatorResult<()> {
        let state = *core.state();
        let mut applied = false;
        match ctx.status.horizontal {
            HorizontalAiding::Gnss => {
                if let Some(sample) = samples.gnss {
                    if let Some((position, velocity)) =
                        self.gnss_at_imu(gnss, &sample, &state, increment)
                    {
                        let noise = self.gnss_velocity_noise(&sample);
                        let model = VelocityMeasurement {
                            channel: Channel::GnssVelocity,
                            velocity,
                            horizontal_noise_std: noise,
                            vertical_noise_std: noise,
                        };
                        let observation = Observation::new(&model, &state, self.gnss.velocity_gate);
                        applied |= ctx.fuse(core, &observation)?;
                        let model = HorizontalPositionMeasurement {
                            channel: Channel::GnssPosition,
                            position,
                            noise_std: self.gnss_position_noise(&sample),
                        };
                        let observation =
                            Observation::new(&model, core.state(), self.gnss.position_gate);
                        applied |= ctx.fuse(core, &observation)?;
                    }
                }
            }
            HorizontalAiding::Vision => {
                if let Some(sample) = samples.vision {
                    let model = HorizontalPositionMeasurement {
                        channel: Channel::VisionPosition,
                        position: self.vision_at_imu(&sample, &state),
                        noise_std: self.vision_noise(&sample),
                    };
                    let observation = Observation::new(&model, &state, self.vision.gate);
                    applied |= ctx.fuse(core, &observation)?;
                }
            }
            HorizontalAiding::OpticalFlow => {
                let usable = samples
                    .flow
                    .filter(|sample| self.flow_usable(sample, &state))
                    .filter(|_| terrain.is_valid(ctx.time_us()));
                if let Some(sample) = usable {
                    let range = self.flow_range(terrain, &state);
                    let model = OpticalFlowMeasurement {
                        rate: self.flow_rate(&sample, increment, range),
                        noise_std: flow_noise(&self.flow, sample.quality),
                        range,
                    };
                    let observation = Observation::new(&model, &state, self.flow.gate);
                    applied |= ctx.fuse(core, &observation)?;
                }
            }
            HorizontalAiding::None => {}
        }
        if applied {
            let position = core.state().position;
            ctx.last_known_position = Vector2::new(position[0], position[1]);
        }
        Ok(())
    }

    /// Select the horizontal source, apply starts, stops and hard resets, and fuse its data.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        heading: &mut HeadingControl,
        gnss: &GnssMonitor,
        terrain: &TerrainEstimator,
        samples: &AlignedSamples,
        increment: &InertialIncrement,
        freshness: &Freshness,
    ) -> EstimatorResult<()> {
        let now = ctx.time_us();
        let state = *core.state();
        let guards = HorizontalGuards {
            tilt_align: ctx.status.tilt_align,
            gnss_mask: self.aiding.gnss,
            gnss_can_start: gnss.can_start(now) && samples.gnss.is_some(),
            gnss_stopped: freshness.gnss_stopped,
            vision_mask: self.aiding.vision_position,
            vision_ready: samples.vision.is_some() && freshness.vision,
            vision_stopped: freshness.vision_stopped,
            flow_mask: self.aiding.optical_flow,
            flow_ready: samples
                .flow
                .is_some_and(|sample| self.flow_usable(&sample, &state))
                && terrain.fused_within(now, FLOW_START_HAGL_US),
            flow_stopped: freshness.flow_stopped,
        };
        let current = ctx.status.horizontal;
        if let Some(row) = select(HORIZONTAL_TABLE, current, &guards) {
            if row.to == HorizontalAiding::None {
                self.stop(ctx);
            } else if row.to != current {
                self.start(ctx, core, heading, gnss, terrain, samples, increment, current, row.to);
            }
        }
        self.check_hard_resets(ctx, core, heading, gnss, samples, increment);
        self.fuse(ctx, core, gnss, terrain, samples, increment)?;
        if let Some(sample) = samples.vision {
            self.last_vision = Some(sample);
        }
        Ok(())
    }

    /// Fuse the last known position while no horizontal source is active.
    ///
    /// The pseudo-measurement is fused at the configured interval and whenever height was fused this
    /// cycle. A gap longer than the restart gap starts a new dead reckoning period at the current
    /// position with zero velocity.
    pub fn dead_reckon(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        height_fused: bool,
    ) -> EstimatorResult<()> {
        if ctx.status.horizontal != HorizontalAiding::None {
            return Ok(());
        }
        let now = ctx.time_us();
        let since = self.last_fake_us.map(|t| now.saturating_sub(t));
        let interval_us = (self.no_aid.fake_position_interval_s * 1e6) as u64;
        if !(height_fused || since.is_none_or(|s| s >= interval_us)) {
            return Ok(());
        }
        let restart_us = (self.no_aid.restart_gap_s * 1e6) as u64;
        if since.is_none_or(|s| s > restart_us) {
            let position = core.state().position;
            ctx.last_known_position = Vector2::new(position[0], position[1]);
            let delta = core.reset_horizontal_velocity(Vector2::zeros(), self.initial.velocity.powi(2));
            ctx.record_reset(ResetReason::DeadReckoningStart, delta);
            warn!("no horizontal aiding: stopping navigation at {} us", now);
            ctx.emit(FilterEvent::NavigationStopped { time_us: now });
        }
        let noise = if ctx.status.in_air && ctx.status.tilt_align {
            self.no_aid.noise.max(self.gnss.position_noise)
        } else {
            self.no_aid.on_ground_noise
        };
        let model = HorizontalPositionMeasurement {
            channel: Channel::FakePosition,
            position: ctx.last_known_position,
            noise_std: noise,
        };
        let observation = Observation::new(&model, core.state(), self.no_aid.fake_position_gate);
        ctx.fuse(core, &observation)?;
        self.last_fake_us = Some(now);
        Ok(())
    }
}
