//! Heading source selection and magnetometer fusion.
//!
//! The heading channel picks one [`HeadingMode`] per cycle from a transition table. The automatic
//! magnetometer types fuse the magnetic heading while the vehicle is on the ground or barely moving,
//! and switch to three-axis field fusion once airborne and manoeuvring, when the magnetic field
//! states become observable. An external vision system providing orientation takes priority over
//! the magnetometer while its data keeps arriving.

use log::info;
use nalgebra::{DMatrix, Vector2};

use crate::config::{AidingMask, EstimatorConfig, MagConfig, MagFusionType, VisionConfig};
use crate::ekf::CoreEstimator;
use crate::error::EstimatorResult;
use crate::measurements::{
    DeclinationMeasurement, HeadingMeasurement, MagFieldMeasurement, Observation, StateMask,
    magnetic_yaw,
};
use crate::messages::{GnssSample, MagSample, VisionSample};
use crate::status::{Channel, FilterEvent, HeadingMode, HorizontalAiding, ResetReason};
use crate::{InertialIncrement, NavigationState};

use super::{FilterContext, Freshness, Transition, select};

/// Declination observation noise, rad
const DECLINATION_NOISE: f64 = 0.5;
/// Gate of the declination observation; it only constrains the field direction
const DECLINATION_GATE: f64 = 1.0e3;
/// Yaw rate low-pass filter coefficient, per inertial sample
const YAW_RATE_LPF: f64 = 0.95;
/// Yaw change after which a bias observability section restarts, rad (45 deg)
const OBSERVABILITY_SECTION: f64 = 0.7854;
/// Height above the on-ground position that counts as flying clear of ground anomalies, m
const CLIMB_HEIGHT: f64 = 1.5;
/// Movement must have been seen this recently for three-axis fusion, us
const MOVEMENT_TIMEOUT_US: u64 = 2_000_000;
/// Ground speed required to realign yaw from the GNSS course, m/s
const COURSE_REALIGN_SPEED: f64 = 5.0;

/// Inputs of the heading mode table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadingGuards {
    pub vision_stopped: bool,
    /// Vision yaw is enabled, tilt is aligned and fresh vision data arrived this cycle
    pub vision_yaw_start: bool,
    /// Magnetometer declared faulty or its fusion disabled
    pub mag_unusable: bool,
    pub heading_type: bool,
    /// Three-axis fusion forced by configuration and the vehicle is airborne
    pub three_axis_type: bool,
    pub flight_align_complete: bool,
    /// The automatic types' conditions for three-axis fusion hold
    pub use_3d: bool,
    pub fixed_wing: bool,
}

fn vision_stopped(g: &HeadingGuards) -> bool {
    g.vision_stopped
}
fn always(_: &HeadingGuards) -> bool {
    true
}
fn vision_yaw_start(g: &HeadingGuards) -> bool {
    g.vision_yaw_start
}
fn mag_unusable(g: &HeadingGuards) -> bool {
    g.mag_unusable
}
fn heading_type(g: &HeadingGuards) -> bool {
    g.heading_type
}
fn three_axis_type(g: &HeadingGuards) -> bool {
    g.three_axis_type
}
fn realign_complete(g: &HeadingGuards) -> bool {
    g.flight_align_complete
}
fn use_3d_aligned(g: &HeadingGuards) -> bool {
    g.use_3d && g.flight_align_complete
}
fn use_3d_fixed_wing(g: &HeadingGuards) -> bool {
    g.use_3d && g.fixed_wing
}
fn use_3d(g: &HeadingGuards) -> bool {
    g.use_3d
}

type HeadingTransition = Transition<HeadingMode, HeadingGuards>;

pub const HEADING_TABLE: &[HeadingTransition] = &[
    Transition {
        from: Some(HeadingMode::VisionYaw),
        guard: vision_stopped,
        to: HeadingMode::MagneticHeading,
        action: (),
    },
    Transition {
        from: Some(HeadingMode::VisionYaw),
        guard: always,
        to: HeadingMode::VisionYaw,
        action: (),
    },
    Transition { from: None, guard: vision_yaw_start, to: HeadingMode::VisionYaw, action: () },
    Transition { from: None, guard: mag_unusable, to: HeadingMode::None, action: () },
    Transition { from: None, guard: heading_type, to: HeadingMode::MagneticHeading, action: () },
    Transition { from: None, guard: three_axis_type, to: HeadingMode::Magnetic3D, action: () },
    Transition {
        from: Some(HeadingMode::GnssCourseRealign),
        guard: realign_complete,
        to: HeadingMode::Magnetic3D,
        action: (),
    },
    Transition { from: None, guard: use_3d_aligned, to: HeadingMode::Magnetic3D, action: () },
    Transition {
        from: None,
        guard: use_3d_fixed_wing,
        to: HeadingMode::GnssCourseRealign,
        action: (),
    },
    Transition { from: None, guard: use_3d, to: HeadingMode::Magnetic3D, action: () },
    Transition { from: None, guard: always, to: HeadingMode::MagneticHeading, action: () },
];

/// The heading channel state machine and the excitation monitors behind its guards.
#[derive(Clone, Debug)]
pub struct HeadingControl {
    mag: MagConfig,
    vision: VisionConfig,
    aiding: AidingMask,
    declination: f64,
    yaw_rate_lpf: f64,
    /// Yaw change accumulated since the current observability section started, rad
    yaw_delta: f64,
    accel_lpf_ne: Vector2<f64>,
    mag_bias_observable: bool,
    section_start_us: u64,
    yaw_observable: bool,
    last_movement_us: Option<u64>,
    on_ground_down: f64,
    flight_align_complete: bool,
    update_mag_states_only: bool,
    saved_mag_covariance: Option<DMatrix<f64>>,
    last_mag: Option<MagSample>,
}

impl HeadingControl {
    pub fn new(config: &EstimatorConfig) -> Self {
        HeadingControl {
            mag: config.mag,
            vision: config.vision,
            aiding: config.aiding,
            declination: config.mag.declination_deg.to_radians(),
            yaw_rate_lpf: 0.0,
            yaw_delta: 0.0,
            accel_lpf_ne: Vector2::zeros(),
            mag_bias_observable: false,
            section_start_us: 0,
            yaw_observable: false,
            last_movement_us: None,
            on_ground_down: 0.0,
            flight_align_complete: false,
            update_mag_states_only: false,
            saved_mag_covariance: None,
            last_mag: None,
        }
    }
    pub fn initialize(&mut self, state: &NavigationState) {
        self.on_ground_down = state.position[2];
        self.flight_align_complete = false;
        self.saved_mag_covariance = None;
    }
    pub fn mag_bias_observable(&self) -> bool {
        self.mag_bias_observable
    }
    pub fn yaw_observable(&self) -> bool {
        self.yaw_observable
    }
    pub fn flight_align_complete(&self) -> bool {
        self.flight_align_complete
    }
    pub fn yaw_rate(&self) -> f64 {
        self.yaw_rate_lpf
    }
    fn is_auto(&self) -> bool {
        matches!(
            self.mag.fusion,
            MagFusionType::Auto | MagFusionType::AutoFixedWing
        )
    }
    fn mag_usable(&self, ctx: &FilterContext) -> bool {
        !ctx.status.mag_fault && self.mag.fusion != MagFusionType::None
    }

    /// Feed one bias-corrected inertial increment into the yaw rate and horizontal acceleration
    /// filters.
    pub fn monitor_excitation(&mut self, state: &NavigationState, increment: &InertialIncrement) {
        if !(increment.dt > 0.0) {
            return;
        }
        let yaw_increment = (state.rotation() * increment.delta_angle)[2];
        self.yaw_rate_lpf =
            YAW_RATE_LPF * self.yaw_rate_lpf + (1.0 - YAW_RATE_LPF) * yaw_increment / increment.dt;
        self.yaw_delta += yaw_increment;
        let alpha = increment.dt.min(1.0);
        let accel_ne = increment.delta_velocity_nav.fixed_rows::<2>(0) / increment.dt;
        self.accel_lpf_ne = self.accel_lpf_ne * (1.0 - alpha) + accel_ne * alpha;
    }

    /// Sustained rotation makes the body field bias observable.
    ///
    /// A section starts when the filtered yaw rate exceeds the gate. The bias stays observable while
    /// the yaw accumulated in the section outpaces half the gate rate.
    fn update_bias_observability(&mut self, now_us: u64) {
        let gate = self.mag.yaw_rate_gate;
        if !self.mag_bias_observable && self.yaw_rate_lpf.abs() > gate {
            self.mag_bias_observable = true;
            self.section_start_us = now_us;
            self.yaw_delta = 0.0;
        } else if self.mag_bias_observable {
            let elapsed = now_us.saturating_sub(self.section_start_us) as f64 * 1e-6;
            self.mag_bias_observable = self.yaw_delta.abs() > 0.5 * gate * elapsed;
            if self.yaw_delta.abs() > OBSERVABILITY_SECTION {
                self.section_start_us = now_us;
                self.yaw_delta = 0.0;
            }
        }
    }

    fn update_yaw_observability(&mut self, ctx: &FilterContext) {
        let accel = self.accel_lpf_ne.norm();
        let aided = matches!(
            ctx.status.horizontal,
            HorizontalAiding::Gnss | HorizontalAiding::Vision
        );
        let threshold = if self.yaw_observable {
            self.mag.acc_gate
        } else {
            2.0 * self.mag.acc_gate
        };
        self.yaw_observable = aided && accel > threshold;
    }

    /// Three-axis conditions of the automatic types.
    fn use_3d(&mut self, ctx: &FilterContext, state: &NavigationState) -> bool {
        let now = ctx.time_us();
        if self.mag_bias_observable || self.yaw_observable {
            self.last_movement_us = Some(now);
        }
        if !ctx.status.in_air {
            self.on_ground_down = state.position[2];
            self.flight_align_complete = false;
        }
        let climbed = state.position[2] < self.on_ground_down - CLIMB_HEIGHT;
        let moving = self
            .last_movement_us
            .is_some_and(|t| now.saturating_sub(t) < MOVEMENT_TIMEOUT_US);
        self.is_auto()
            && ctx.status.tilt_align
            && ctx.status.in_air
            && (self.flight_align_complete || climbed)
            && moving
    }

    /// Reset the yaw from the last magnetometer sample and realign the earth field with it.
    ///
    /// Without a usable magnetometer the current yaw is accepted as aligned. Returns true when yaw
    /// is aligned afterwards.
    pub(crate) fn reset_mag_heading(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
    ) -> bool {
        let now = ctx.time_us();
        if !self.mag_usable(ctx) {
            if !ctx.status.yaw_align {
                info!("no usable magnetometer: keeping the initial yaw at {} us", now);
                ctx.status.yaw_align = true;
                ctx.emit(FilterEvent::YawAligned {
                    time_us: now,
                    mode: ctx.status.heading,
                });
            }
            return true;
        }
        let Some(mag) = self.last_mag else {
            return false;
        };
        let state = *core.state();
        let field = mag.field - state.mag_body;
        let yaw = magnetic_yaw(&state, &field, self.declination);
        let delta = core.reset_yaw(yaw, self.mag.heading_noise.powi(2));
        let earth = core.state().attitude.transform_vector(&field);
        core.reset_mag_field(earth, state.mag_body, self.mag.noise.powi(2));
        ctx.record_reset(ResetReason::MagHeading, delta);
        if !ctx.status.yaw_align {
            ctx.status.yaw_align = true;
            info!("yaw aligned to magnetic heading {:.1} deg", yaw.to_degrees());
            ctx.emit(FilterEvent::YawAligned {
                time_us: now,
                mode: ctx.status.heading,
            });
        }
        true
    }

    /// Called when tilt alignment completes.
    pub fn align_yaw(&mut self, ctx: &mut FilterContext, core: &mut CoreEstimator) {
        if !ctx.status.yaw_align && self.last_mag.is_some() {
            self.reset_mag_heading(ctx, core);
        }
    }

    fn reset_to_vision(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        sample: &VisionSample,
    ) {
        let yaw = sample.attitude.euler_angles().2;
        let noise = sample.angle_error.max(self.vision.min_angle_noise);
        let delta = core.reset_yaw(yaw, noise.powi(2));
        ctx.record_reset(ResetReason::VisionYaw, delta);
        if !ctx.status.yaw_align {
            ctx.status.yaw_align = true;
            ctx.emit(FilterEvent::YawAligned {
                time_us: ctx.time_us(),
                mode: HeadingMode::VisionYaw,
            });
        }
    }

    /// Yaw from the GNSS course for fixed-wing vehicles, once they fly fast enough.
    pub(crate) fn realign_from_course(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        gnss: &GnssSample,
    ) {
        let speed = gnss.velocity.fixed_rows::<2>(0).norm();
        if speed <= COURSE_REALIGN_SPEED {
            return;
        }
        let course = gnss.velocity[1].atan2(gnss.velocity[0]);
        let variance = self
            .mag
            .heading_noise
            .powi(2)
            .max((gnss.speed_accuracy / speed).powi(2));
        let delta = core.reset_yaw(course, variance);
        if let Some(mag) = self.last_mag {
            let body = core.state().mag_body;
            let earth = core.state().attitude.transform_vector(&(mag.field - body));
            core.reset_mag_field(earth, body, self.mag.noise.powi(2));
        }
        info!("yaw realigned to gnss course {:.1} deg", course.to_degrees());
        ctx.record_reset(ResetReason::GnssCourse, delta);
        self.flight_align_complete = true;
    }

    fn enter_mode(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        from: HeadingMode,
        to: HeadingMode,
        vision: Option<&VisionSample>,
    ) {
        if from == HeadingMode::Magnetic3D {
            self.saved_mag_covariance = Some(core.mag_covariance());
        }
        match to {
            HeadingMode::VisionYaw => {
                if let Some(sample) = vision {
                    self.reset_to_vision(ctx, core, sample);
                }
            }
            HeadingMode::Magnetic3D => {
                if !self.flight_align_complete {
                    if self.reset_mag_heading(ctx, core) && ctx.status.in_air {
                        self.flight_align_complete = true;
                    }
                } else if let Some(block) = &self.saved_mag_covariance {
                    core.restore_mag_covariance(block);
                }
            }
            _ => {}
        }
        info!("heading mode changed from {:?} to {:?}", from, to);
        ctx.status.heading = to;
        ctx.emit(FilterEvent::HeadingModeChanged {
            time_us: ctx.time_us(),
            from,
            to,
        });
    }

    /// Select the heading mode and fuse the heading observations available this cycle.
    pub fn step(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        mag: Option<&MagSample>,
        vision: Option<&VisionSample>,
        gnss: Option<&GnssSample>,
        freshness: &Freshness,
    ) -> EstimatorResult<()> {
        let now = ctx.time_us();
        let state = *core.state();
        if let Some(sample) = mag {
            self.last_mag = Some(*sample);
            if self.is_auto() {
                self.update_bias_observability(now);
            }
        }
        self.update_yaw_observability(ctx);
        let use_3d = self.use_3d(ctx, &state);

        let guards = HeadingGuards {
            vision_stopped: freshness.vision_stopped,
            vision_yaw_start: self.aiding.vision_yaw
                && ctx.status.tilt_align
                && vision.is_some()
                && freshness.vision,
            mag_unusable: !self.mag_usable(ctx),
            heading_type: self.mag.fusion == MagFusionType::Heading,
            three_axis_type: self.mag.fusion == MagFusionType::ThreeAxis && ctx.status.in_air,
            flight_align_complete: self.flight_align_complete,
            use_3d,
            fixed_wing: ctx.status.fixed_wing,
        };
        let current = ctx.status.heading;
        let mode = select(HEADING_TABLE, current, &guards).map_or(current, |row| row.to);
        if mode != current {
            self.enter_mode(ctx, core, current, mode, vision);
        }

        let states_only = self.mag.fusion == MagFusionType::AutoFixedWing && ctx.status.fixed_wing;
        if self.update_mag_states_only && !states_only {
            let state = core.state();
            let (earth, body) = (state.mag_earth, state.mag_body);
            core.reset_mag_field(earth, body, self.mag.noise.powi(2));
        }
        self.update_mag_states_only = states_only;
        ctx.status.update_mag_states_only = states_only;
        ctx.status.mag_declination = mode == HeadingMode::Magnetic3D
            && (ctx.status.horizontal != HorizontalAiding::Gnss || self.mag.fuse_declination);

        if let (HeadingMode::GnssCourseRealign, Some(sample)) = (mode, gnss) {
            self.realign_from_course(ctx, core, sample);
        }

        if let Some(sample) = mag.filter(|_| self.mag_usable(ctx)) {
            if !ctx.status.yaw_align && ctx.status.tilt_align && mode != HeadingMode::VisionYaw {
                self.reset_mag_heading(ctx, core);
            }
            self.fuse_mag(ctx, core, sample, mode)?;
        }
        if let (HeadingMode::VisionYaw, Some(sample)) = (mode, vision) {
            let model = HeadingMeasurement {
                channel: Channel::VisionYaw,
                yaw: sample.attitude.euler_angles().2,
                noise_std: sample.angle_error.max(self.vision.min_angle_noise),
            };
            let observation = Observation::new(&model, core.state(), self.vision.gate);
            ctx.fuse(core, &observation)?;
        }
        Ok(())
    }

    fn fuse_mag(
        &mut self,
        ctx: &mut FilterContext,
        core: &mut CoreEstimator,
        sample: &MagSample,
        mode: HeadingMode,
    ) -> EstimatorResult<()> {
        let state = *core.state();
        if mode.fuses_mag_heading() {
            let field = sample.field - state.mag_body;
            let model = HeadingMeasurement {
                channel: Channel::MagHeading,
                yaw: magnetic_yaw(&state, &field, self.declination),
                noise_std: self.mag.heading_noise,
            };
            let observation = Observation::new(&model, &state, self.mag.heading_gate);
            ctx.fuse(core, &observation)?;
        } else if mode == HeadingMode::Magnetic3D {
            let model = MagFieldMeasurement {
                field: sample.field,
                noise_std: self.mag.noise,
            };
            let mask = if self.update_mag_states_only {
                StateMask::MagneticOnly
            } else {
                StateMask::All
            };
            let observation = Observation::new(&model, &state, self.mag.gate).with_mask(mask);
            ctx.fuse(core, &observation)?;
            if ctx.status.mag_declination {
                let model = DeclinationMeasurement {
                    declination: self.declination,
                    noise_std: DECLINATION_NOISE,
                };
                let observation = Observation::new(&model, core.state(), DECLINATION_GATE);
                ctx.fuse(core, &observation)?;
            }
        }
        Ok(())
    }
}
