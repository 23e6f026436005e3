//! Synthetic hover logs.
//!
//! A level vehicle holds position above the origin while an IMU, a GNSS receiver, a barometer and a
//! magnetometer report its state with gaussian noise. An optional window drops the GNSS samples so
//! outage handling can be exercised.

use std::error::Error;

use nalgebra::Vector3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use navfuse::ImuSample;
use navfuse::earth::STANDARD_GRAVITY;
use navfuse::messages::{BaroSample, GnssSample, MagSample};

use crate::common::LogRecord;

/// Meters per degree of latitude, close enough for noise generation
const METERS_PER_DEGREE: f64 = 111_320.0;

#[derive(Clone, Debug, PartialEq)]
pub struct SynthConfig {
    pub duration_s: f64,
    /// GNSS samples inside this window (start, end) in seconds are dropped
    pub gnss_outage: Option<(f64, f64)>,
    pub seed: u64,
    pub latitude: f64,
    pub longitude: f64,
    /// Hover altitude, m
    pub altitude: f64,
    pub imu_interval_us: u64,
    pub gnss_interval_us: u64,
    pub baro_interval_us: u64,
    pub mag_interval_us: u64,
    pub gyro_noise: f64,
    pub accel_noise: f64,
    pub gnss_position_noise: f64,
    pub gnss_velocity_noise: f64,
    pub baro_noise: f64,
    pub mag_noise: f64,
    /// Earth field in NED, gauss
    pub earth_field: [f64; 3],
}
impl Default for SynthConfig {
    fn default() -> Self {
        SynthConfig {
            duration_s: 60.0,
            gnss_outage: None,
            seed: 42,
            latitude: 47.397742,
            longitude: 8.545594,
            altitude: 488.0,
            imu_interval_us: 4_000,
            gnss_interval_us: 200_000,
            baro_interval_us: 50_000,
            mag_interval_us: 20_000,
            gyro_noise: 0.003,
            accel_noise: 0.05,
            gnss_position_noise: 0.5,
            gnss_velocity_noise: 0.1,
            baro_noise: 0.3,
            mag_noise: 0.005,
            earth_field: [0.21, 0.0, 0.42],
        }
    }
}

fn in_outage(outage: Option<(f64, f64)>, time_s: f64) -> bool {
    outage.is_some_and(|(start, end)| time_s >= start && time_s < end)
}

/// Generate a time ordered hover log.
pub fn synthesize(config: &SynthConfig) -> Result<Vec<LogRecord>, Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let gyro = Normal::new(0.0, config.gyro_noise)?;
    let accel = Normal::new(0.0, config.accel_noise)?;
    let position = Normal::new(0.0, config.gnss_position_noise)?;
    let velocity = Normal::new(0.0, config.gnss_velocity_noise)?;
    let baro = Normal::new(0.0, config.baro_noise)?;
    let mag = Normal::new(0.0, config.mag_noise)?;

    let end_us = (config.duration_s * 1e6) as u64;
    let dt = config.imu_interval_us as f64 * 1e-6;
    let field = Vector3::from(config.earth_field);
    let mut records = Vec::new();
    let mut time_us = config.imu_interval_us;
    while time_us <= end_us {
        let time_s = time_us as f64 * 1e-6;
        if time_us % config.mag_interval_us == 0 {
            let noise = Vector3::from_fn(|_, _| mag.sample(&mut rng));
            records.push(LogRecord::mag(&MagSample {
                time_us,
                field: field + noise,
            }));
        }
        if time_us % config.baro_interval_us == 0 {
            records.push(LogRecord::baro(&BaroSample {
                time_us,
                height: config.altitude + baro.sample(&mut rng),
            }));
        }
        if time_us % config.gnss_interval_us == 0 && !in_outage(config.gnss_outage, time_s) {
            let north = position.sample(&mut rng);
            let east = position.sample(&mut rng);
            let latitude = config.latitude + north / METERS_PER_DEGREE;
            let longitude = config.longitude
                + east / (METERS_PER_DEGREE * config.latitude.to_radians().cos());
            records.push(LogRecord::gnss(&GnssSample {
                time_us,
                latitude,
                longitude,
                altitude: config.altitude + position.sample(&mut rng),
                velocity: Vector3::from_fn(|_, _| velocity.sample(&mut rng)),
                fix_type: 3,
                satellites: 12,
                pdop: 1.1,
                horizontal_accuracy: config.gnss_position_noise,
                vertical_accuracy: 1.5 * config.gnss_position_noise,
                speed_accuracy: config.gnss_velocity_noise,
            }));
        }
        let rate = Vector3::from_fn(|_, _| gyro.sample(&mut rng));
        let force = Vector3::new(0.0, 0.0, -STANDARD_GRAVITY)
            + Vector3::from_fn(|_, _| accel.sample(&mut rng));
        records.push(LogRecord::imu(&ImuSample::from_rates(time_us, rate, force, dt)));
        time_us += config.imu_interval_us;
    }
    Ok(records)
}
