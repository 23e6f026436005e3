//! Noise-free sensor streams for driving the public estimator.
#![allow(dead_code)]

use nalgebra::{UnitQuaternion, Vector3};

use navfuse::earth::STANDARD_GRAVITY;
use navfuse::messages::{BaroSample, GnssSample, MagSample, RangeSample, SensorSample};
use navfuse::status::FilterEvent;
use navfuse::{Estimator, EstimatorConfig, ImuSample};

pub const IMU_INTERVAL_US: u64 = 4_000;
pub const GNSS_INTERVAL_US: u64 = 200_000;
pub const BARO_INTERVAL_US: u64 = 50_000;
pub const MAG_INTERVAL_US: u64 = 20_000;
pub const RANGE_INTERVAL_US: u64 = 50_000;

pub const LATITUDE: f64 = 47.397742;
pub const LONGITUDE: f64 = 8.545594;
pub const ALTITUDE: f64 = 488.0;
/// Earth field in NED, gauss
pub const EARTH_FIELD: [f64; 3] = [0.21, 0.0, 0.42];

/// Which sensors report, and how the vehicle rotates, while a [`Harness`] runs.
#[derive(Clone, Copy, Debug)]
pub struct Sensors {
    pub gnss: bool,
    pub baro: bool,
    pub mag: bool,
    /// Range reading, m
    pub range: Option<f64>,
    /// Yaw rate about the vertical, rad/s
    pub yaw_rate: f64,
}
impl Default for Sensors {
    fn default() -> Self {
        Sensors {
            gnss: true,
            baro: true,
            mag: true,
            range: None,
            yaw_rate: 0.0,
        }
    }
}
impl Sensors {
    pub fn without_gnss() -> Self {
        Sensors {
            gnss: false,
            ..Default::default()
        }
    }
}

/// A stationary vehicle at the origin, level, possibly yawing in place.
pub struct Harness {
    pub estimator: Estimator,
    pub time_us: u64,
    pub yaw: f64,
    pub events: Vec<FilterEvent>,
    pub cycles: usize,
}

impl Harness {
    pub fn new(config: EstimatorConfig) -> Self {
        Harness {
            estimator: Estimator::new(config).unwrap(),
            time_us: 0,
            yaw: 0.0,
            events: Vec::new(),
            cycles: 0,
        }
    }

    pub fn run(&mut self, seconds: f64, sensors: Sensors) {
        self.run_with(seconds, sensors, |_| {});
    }

    /// Run for `seconds`, calling `check` after every inertial sample.
    pub fn run_with<F: FnMut(&Estimator)>(&mut self, seconds: f64, sensors: Sensors, mut check: F) {
        let steps = (seconds * 1e6 / IMU_INTERVAL_US as f64).round() as u64;
        let dt = IMU_INTERVAL_US as f64 * 1e-6;
        for _ in 0..steps {
            self.time_us += IMU_INTERVAL_US;
            self.yaw += sensors.yaw_rate * dt;
            let t = self.time_us;
            for sample in self.samples_at(t, &sensors) {
                self.estimator.push(sample).unwrap();
            }
            let imu = ImuSample::from_rates(
                t,
                Vector3::new(0.0, 0.0, sensors.yaw_rate),
                Vector3::new(0.0, 0.0, -STANDARD_GRAVITY),
                dt,
            );
            if self.estimator.update(imu).unwrap() {
                self.cycles += 1;
            }
            self.events.extend(self.estimator.drain_events());
            check(&self.estimator);
        }
    }

    fn samples_at(&self, t: u64, sensors: &Sensors) -> Vec<SensorSample> {
        let mut samples = Vec::new();
        if sensors.mag && t % MAG_INTERVAL_US == 0 {
            samples.push(SensorSample::Mag(mag(t, self.yaw)));
        }
        if sensors.baro && t % BARO_INTERVAL_US == 0 {
            samples.push(SensorSample::Baro(BaroSample {
                time_us: t,
                height: ALTITUDE,
            }));
        }
        if sensors.gnss && t % GNSS_INTERVAL_US == 0 {
            samples.push(SensorSample::Gnss(gnss(t)));
        }
        if let Some(range) = sensors.range {
            if t % RANGE_INTERVAL_US == 0 {
                samples.push(SensorSample::Range(RangeSample { time_us: t, range }));
            }
        }
        samples
    }

    pub fn count_events<P: Fn(&FilterEvent) -> bool>(&self, predicate: P) -> usize {
        self.events.iter().filter(|e| predicate(e)).count()
    }

    /// Horizontal distance of the published solution from the origin, m
    pub fn horizontal_offset(&self) -> f64 {
        self.estimator.output().position.fixed_rows::<2>(0).norm()
    }
}

pub fn gnss(time_us: u64) -> GnssSample {
    GnssSample {
        time_us,
        latitude: LATITUDE,
        longitude: LONGITUDE,
        altitude: ALTITUDE,
        velocity: Vector3::zeros(),
        fix_type: 3,
        satellites: 12,
        pdop: 1.1,
        horizontal_accuracy: 0.5,
        vertical_accuracy: 0.8,
        speed_accuracy: 0.2,
    }
}

/// Body field of a level vehicle at `yaw`.
pub fn mag(time_us: u64, yaw: f64) -> MagSample {
    let attitude = UnitQuaternion::from_euler_angles(0.0, 0.0, yaw);
    MagSample {
        time_us,
        field: attitude.inverse_transform_vector(&Vector3::from(EARTH_FIELD)),
    }
}

pub fn at_rest(time_us: u64) -> ImuSample {
    ImuSample::from_rates(
        time_us,
        Vector3::zeros(),
        Vector3::new(0.0, 0.0, -STANDARD_GRAVITY),
        IMU_INTERVAL_US as f64 * 1e-6,
    )
}
