//! The estimator: one owning object per vehicle that runs the whole filter cycle.
//!
//! [`Estimator::update`] is called once per inertial sample. It drains samples handed over by driver
//! threads, publishes the undelayed solution, and once the inertial buffer spans the largest sensor
//! delay it runs the delayed core cycle: prediction, the fusion mode controller and the output
//! predictor feedback.
//!
//! A non-finite state or covariance is the only fatal condition. The estimator then discards every
//! buffer and all internal state, queues a [`FilterEvent::Reinitialized`] event and returns
//! [`EstimatorError::NumericalFailure`]. It initializes again on the next usable inertial sample.

use log::{error, info, warn};
use nalgebra::{DMatrix, UnitQuaternion, Vector3};

use crate::buffer::{RingBuffer, SampleInbox, SampleSender, SensorBuffers};
use crate::config::EstimatorConfig;
use crate::control::{FilterContext, FusionController};
use crate::ekf::CoreEstimator;
use crate::error::{EstimatorError, EstimatorResult};
use crate::measurements::magnetic_yaw;
use crate::messages::SensorSample;
use crate::output::{OutputPredictor, OutputSample};
use crate::status::{ControlStatus, FaultStatus, FilterEvent, InnovationRecords, ResetStatus};
use crate::{ImuSample, NavigationState};

/// Accepted specific force magnitude at initialization, fraction of standard gravity
const INIT_FORCE_RANGE: (f64, f64) = (0.5, 1.5);

/// Flags set by the vehicle rather than estimated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct VehicleFlags {
    in_air: bool,
    fixed_wing: bool,
    mag_fault: bool,
}

#[derive(Debug)]
pub struct Estimator {
    config: EstimatorConfig,
    imu: RingBuffer<ImuSample>,
    buffers: SensorBuffers,
    inbox: SampleInbox,
    core: Option<CoreEstimator>,
    ctx: FilterContext,
    controller: FusionController,
    output: OutputPredictor,
    flags: VehicleFlags,
}

impl Estimator {
    /// Create an uninitialized estimator after validating `config`.
    pub fn new(config: EstimatorConfig) -> EstimatorResult<Self> {
        config.validate()?;
        Ok(Estimator {
            imu: RingBuffer::with_capacity(config.imu_buffer_length()),
            buffers: SensorBuffers::new(&config),
            inbox: SampleInbox::default(),
            core: None,
            ctx: FilterContext::new(&config),
            controller: FusionController::new(&config),
            output: OutputPredictor::new(&config),
            flags: VehicleFlags::default(),
            config,
        })
    }

    /// Handle for pushing samples from another thread; they are picked up by the next [`update`](Self::update).
    pub fn sender(&self) -> SampleSender {
        self.inbox.sender()
    }

    /// Buffer one sensor sample, stamped with its push time.
    ///
    /// GNSS samples are quality checked here. Returns `Ok(false)` when the sample went back in time
    /// and was dropped.
    pub fn push(&mut self, sample: SensorSample) -> EstimatorResult<bool> {
        let kind = sample.kind();
        if let Err(reason) = sample.validate() {
            warn!("dropping {} sample at {} us: {}", kind, sample.time_us(), reason);
            return Err(EstimatorError::sample(kind, reason));
        }
        if let SensorSample::Gnss(gnss) = &sample {
            self.controller.gnss.check(gnss);
        }
        Ok(self.buffers.push(sample))
    }

    /// Run one cycle for a new inertial sample.
    ///
    /// Returns `Ok(true)` when the delayed core cycle ran, `Ok(false)` while the filter is still
    /// initializing or filling its inertial buffer.
    pub fn update(&mut self, imu: ImuSample) -> EstimatorResult<bool> {
        if !imu.is_finite() || !(imu.dt > 0.0) {
            return Err(EstimatorError::InvalidSample {
                kind: "imu".to_string(),
                reason: "non-finite values or non-positive interval".to_string(),
            });
        }
        for sample in self.inbox.drain() {
            if let Err(err) = self.push(sample) {
                warn!("{}", err);
            }
        }
        if self.core.is_none() {
            self.try_initialize(&imu);
            return Ok(false);
        }
        self.output.update(&imu);
        self.imu.push(imu);
        if !self.imu.is_full() {
            return Ok(false);
        }
        let Some(delayed) = self.imu.pop_oldest() else {
            return Ok(false);
        };
        match self.run_core(&delayed) {
            Ok(()) => Ok(true),
            Err(err) => {
                self.reinitialize(&err.to_string());
                Err(err)
            }
        }
    }

    fn run_core(&mut self, delayed: &ImuSample) -> EstimatorResult<()> {
        let Some(core) = self.core.as_mut() else {
            return Ok(());
        };
        let ctx = &mut self.ctx;
        ctx.status.in_air = self.flags.in_air;
        ctx.status.fixed_wing = self.flags.fixed_wing;
        ctx.status.mag_fault = self.flags.mag_fault;

        let increment = core.predict(delayed)?;
        self.controller.run(ctx, core, &mut self.buffers, &increment)?;
        if !core.state().is_finite() {
            return Err(EstimatorError::numerical("fusion mode controller"));
        }

        if let Some(delta) = ctx.take_pending_reset() {
            self.output.apply_reset(&delta);
        }
        if ctx.align_output {
            ctx.align_output = false;
            self.output.align(core.state(), core.time_us(), self.imu.iter());
        }
        self.output.set_biases(core.state().gyro_bias, core.state().accel_bias);
        self.output.set_earth_model(core.gravity(), core.earth_rate());
        self.output.correct(core.state(), core.time_us());
        Ok(())
    }

    /// Start the filter on the first sample whose specific force looks like gravity alone.
    fn try_initialize(&mut self, imu: &ImuSample) {
        let force = imu.specific_force();
        let g = crate::earth::STANDARD_GRAVITY;
        let magnitude = force.norm();
        if magnitude < INIT_FORCE_RANGE.0 * g || magnitude > INIT_FORCE_RANGE.1 * g {
            return;
        }
        // the accelerometer senses the reaction to gravity: -g in body axes
        let roll = (-force[1]).atan2(-force[2]);
        let pitch = force[0].atan2((force[1].powi(2) + force[2].powi(2)).sqrt());
        let mut state = NavigationState {
            attitude: UnitQuaternion::from_euler_angles(roll, pitch, 0.0),
            ..Default::default()
        };
        if let Some(mag) = self.buffers.mag.newest() {
            let declination = self.config.mag.declination_deg.to_radians();
            let yaw = magnetic_yaw(&state, &mag.field, declination);
            state.attitude = UnitQuaternion::from_euler_angles(roll, pitch, yaw);
            state.mag_earth = state.attitude.transform_vector(&mag.field);
        }
        let baro_height = self.buffers.baro.newest().map(|sample| sample.height);

        let core = CoreEstimator::new(&self.config, state, imu.time_us);
        self.controller.initialize(baro_height, &core);
        self.imu.clear();
        self.output.reset();
        self.output.align(core.state(), imu.time_us, std::iter::empty());
        let (_, _, yaw) = state.attitude.euler_angles();
        info!(
            "filter initialized at {} us: roll {:.1}, pitch {:.1}, yaw {:.1} deg",
            imu.time_us,
            roll.to_degrees(),
            pitch.to_degrees(),
            yaw.to_degrees()
        );
        self.ctx.set_time_us(imu.time_us);
        self.ctx.emit(FilterEvent::Initialized {
            time_us: imu.time_us,
        });
        self.core = Some(core);
    }

    /// Discard all buffers and filter state; the filter starts again on the next usable sample.
    fn reinitialize(&mut self, reason: &str) {
        let time_us = self.ctx.time_us();
        error!("reinitializing filter at {} us: {}", time_us, reason);
        self.clear();
        self.ctx.emit(FilterEvent::Reinitialized {
            time_us,
            reason: reason.to_string(),
        });
    }

    fn clear(&mut self) {
        self.core = None;
        self.imu.clear();
        self.buffers.clear();
        // samples queued by drivers belong to the discarded instance
        self.inbox.drain();
        self.ctx = FilterContext::new(&self.config);
        self.controller = FusionController::new(&self.config);
        self.output.reset();
    }

    /// Externally requested full reinitialization.
    pub fn reset(&mut self) {
        info!("filter reset requested");
        self.clear();
    }

    pub fn set_in_air(&mut self, in_air: bool) {
        self.flags.in_air = in_air;
    }
    pub fn set_fixed_wing(&mut self, fixed_wing: bool) {
        self.flags.fixed_wing = fixed_wing;
    }
    /// Declare the magnetometer faulty; magnetic fusion stops while set.
    pub fn set_mag_fault(&mut self, mag_fault: bool) {
        self.flags.mag_fault = mag_fault;
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }
    pub fn is_initialized(&self) -> bool {
        self.core.is_some()
    }
    /// Undelayed navigation solution
    pub fn output(&self) -> &OutputSample {
        self.output.output()
    }
    pub fn output_predictor(&self) -> &OutputPredictor {
        &self.output
    }
    /// Core state at the delayed time horizon
    pub fn state(&self) -> Option<&NavigationState> {
        self.core.as_ref().map(|core| core.state())
    }
    pub fn covariance(&self) -> Option<&DMatrix<f64>> {
        self.core.as_ref().map(|core| core.covariance())
    }
    /// Time of the delayed horizon, us
    pub fn time_us(&self) -> u64 {
        self.ctx.time_us()
    }
    /// Terrain vertical position estimate in NED, m
    pub fn terrain_down(&self) -> f64 {
        self.controller.terrain().terrain_down()
    }
    pub fn control_status(&self) -> &ControlStatus {
        &self.ctx.status
    }
    pub fn faults(&self) -> &FaultStatus {
        &self.ctx.faults
    }
    pub fn innovations(&self) -> &InnovationRecords {
        &self.ctx.innovations
    }
    pub fn reset_status(&self) -> &ResetStatus {
        &self.ctx.resets
    }
    pub fn is_dead_reckoning(&self) -> bool {
        self.ctx.status.dead_reckoning
    }
    pub fn controller(&self) -> &FusionController {
        &self.controller
    }
    pub fn events(&self) -> &[FilterEvent] {
        self.ctx.events()
    }
    pub fn drain_events(&mut self) -> Vec<FilterEvent> {
        self.ctx.drain_events()
    }
    /// Velocity of the undelayed solution, NED m/s
    pub fn velocity(&self) -> Vector3<f64> {
        self.output.output().velocity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::earth::STANDARD_GRAVITY;
    use crate::messages::{BaroSample, SensorKind};

    fn at_rest(time_us: u64) -> ImuSample {
        ImuSample::from_rates(
            time_us,
            Vector3::zeros(),
            Vector3::new(0.0, 0.0, -STANDARD_GRAVITY),
            0.004,
        )
    }

    #[test]
    fn rejects_invalid_configuration() {
        let mut config = EstimatorConfig::default();
        config.baro.noise = -1.0;
        assert!(matches!(
            Estimator::new(config),
            Err(EstimatorError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn waits_for_gravity_before_initializing() {
        let mut estimator = Estimator::new(EstimatorConfig::default()).unwrap();
        let free_fall = ImuSample::from_rates(0, Vector3::zeros(), Vector3::zeros(), 0.004);
        assert!(!estimator.update(free_fall).unwrap());
        assert!(!estimator.is_initialized());
        estimator
            .push(SensorSample::Baro(BaroSample {
                time_us: 0,
                height: 120.0,
            }))
            .unwrap();
        assert!(!estimator.update(at_rest(4_000)).unwrap());
        assert!(estimator.is_initialized());
        assert!(matches!(
            estimator.drain_events().as_slice(),
            [FilterEvent::Initialized { time_us: 4_000 }]
        ));
    }

    #[test]
    fn core_runs_once_the_buffer_spans_the_delay() {
        let config = EstimatorConfig::default();
        let depth = config.imu_buffer_length() as u64;
        let mut estimator = Estimator::new(config).unwrap();
        let mut ran = 0;
        for i in 0..(depth + 10) {
            if estimator.update(at_rest(i * 4_000)).unwrap() {
                ran += 1;
            }
        }
        // the initialization sample is not buffered
        assert_eq!(ran, 10);
        assert_eq!(estimator.time_us(), 40_000);
        assert!(estimator.output().velocity.norm() < 1e-6);
    }

    #[test]
    fn rejects_bad_imu_interval() {
        let mut estimator = Estimator::new(EstimatorConfig::default()).unwrap();
        let mut imu = at_rest(0);
        imu.dt = 0.0;
        assert!(matches!(
            estimator.update(imu),
            Err(EstimatorError::InvalidSample { .. })
        ));
    }

    #[test]
    fn samples_sent_from_another_thread_are_buffered() {
        let mut estimator = Estimator::new(EstimatorConfig::default()).unwrap();
        let sender = estimator.sender();
        std::thread::spawn(move || {
            sender.send(SensorSample::Baro(BaroSample {
                time_us: 0,
                height: 10.0,
            }))
        })
        .join()
        .unwrap();
        estimator.update(at_rest(0)).unwrap();
        assert_eq!(
            estimator.buffers.newest_time_us(SensorKind::Barometer),
            Some(0)
        );
    }
}
