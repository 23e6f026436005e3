//! Common utilities for the replay harness.
//!
//! This module contains:
//! - Logger initialization
//! - Path validation
//! - The CSV sensor log and navigation output records

use std::error::Error;
use std::path::{Path, PathBuf};

use log::warn;
use nalgebra::{UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use navfuse::ImuSample;
use navfuse::messages::{
    AirspeedSample, BaroSample, FlowSample, GnssSample, MagSample, RangeSample, SensorSample,
    VisionSample,
};
use navfuse::output::OutputSample;

/// Initialize the logger with the specified configuration.
///
/// # Arguments
/// * `log_level` - Log level string (off, error, warn, info, debug, trace)
/// * `log_file` - Optional path to log file (logs to stderr if None)
///
/// # Errors
/// Returns an error if the log file cannot be opened or logger initialization fails.
pub fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        ensure_parent_dir(log_path)?;
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

/// Validate that the input path is an existing CSV file.
pub fn validate_input_path(input: &Path) -> Result<(), Box<dyn Error>> {
    if !input.is_file() {
        return Err(format!("Input path '{}' is not an existing file.", input.display()).into());
    }
    if input.extension().and_then(|s| s.to_str()) != Some("csv") {
        return Err(format!("Input file '{}' is not a CSV file.", input.display()).into());
    }
    Ok(())
}

/// Create the parent directories of an output file if needed.
pub fn ensure_parent_dir(output: &Path) -> Result<(), Box<dyn Error>> {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            std::fs::create_dir_all(parent)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Sensor that produced a log row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSensor {
    Imu,
    Gnss,
    Baro,
    Mag,
    Range,
    Flow,
    Vision,
    Airspeed,
}

/// One row of a sensor log.
///
/// The generic columns are interpreted per sensor:
///
/// | sensor | x, y, z | u, v, w | other |
/// |---|---|---|---|
/// | imu | delta angle (rad) | delta velocity (m/s) | `dt` |
/// | gnss | latitude, longitude (deg), altitude (m) | NED velocity | accuracies, `fix_type`, `satellites`, `pdop` |
/// | baro | height (m) | | |
/// | mag | field (gauss) | | |
/// | range | range (m) | | |
/// | flow | integrated flow x, y (rad) | integrated body rotation (rad) | `dt`, `quality` |
/// | vision | NED position (m) | roll, pitch, yaw (rad) | `accuracy`, `angle_accuracy` |
/// | airspeed | true airspeed (m/s), EAS to TAS ratio | | |
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub time_us: u64,
    pub sensor: Option<LogSensor>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub u: Option<f64>,
    pub v: Option<f64>,
    pub w: Option<f64>,
    pub dt: Option<f64>,
    pub accuracy: Option<f64>,
    pub vertical_accuracy: Option<f64>,
    pub speed_accuracy: Option<f64>,
    pub angle_accuracy: Option<f64>,
    pub fix_type: Option<u8>,
    pub satellites: Option<u8>,
    pub pdop: Option<f64>,
    pub quality: Option<u8>,
}

/// A decoded log row.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LogInput {
    Imu(ImuSample),
    Sensor(SensorSample),
}

fn required<T>(value: Option<T>, column: &str, time_us: u64) -> Result<T, Box<dyn Error>> {
    value.ok_or_else(|| format!("row at {} us is missing column '{}'", time_us, column).into())
}

impl LogRecord {
    fn xyz(&self) -> Result<Vector3<f64>, Box<dyn Error>> {
        Ok(Vector3::new(
            required(self.x, "x", self.time_us)?,
            required(self.y, "y", self.time_us)?,
            required(self.z, "z", self.time_us)?,
        ))
    }
    fn uvw(&self) -> Result<Vector3<f64>, Box<dyn Error>> {
        Ok(Vector3::new(
            required(self.u, "u", self.time_us)?,
            required(self.v, "v", self.time_us)?,
            required(self.w, "w", self.time_us)?,
        ))
    }

    /// Decode the row into an estimator input.
    pub fn to_input(&self) -> Result<LogInput, Box<dyn Error>> {
        let time_us = self.time_us;
        let sensor = required(self.sensor, "sensor", time_us)?;
        let input = match sensor {
            LogSensor::Imu => LogInput::Imu(ImuSample {
                time_us,
                delta_angle: self.xyz()?,
                delta_velocity: self.uvw()?,
                dt: required(self.dt, "dt", time_us)?,
            }),
            LogSensor::Gnss => {
                let position = self.xyz()?;
                LogInput::Sensor(SensorSample::Gnss(GnssSample {
                    time_us,
                    latitude: position[0],
                    longitude: position[1],
                    altitude: position[2],
                    velocity: self.uvw()?,
                    fix_type: self.fix_type.unwrap_or(3),
                    satellites: self.satellites.unwrap_or(0),
                    pdop: self.pdop.unwrap_or(99.0),
                    horizontal_accuracy: required(self.accuracy, "accuracy", time_us)?,
                    vertical_accuracy: required(self.vertical_accuracy, "vertical_accuracy", time_us)?,
                    speed_accuracy: required(self.speed_accuracy, "speed_accuracy", time_us)?,
                }))
            }
            LogSensor::Baro => LogInput::Sensor(SensorSample::Baro(BaroSample {
                time_us,
                height: required(self.x, "x", time_us)?,
            })),
            LogSensor::Mag => LogInput::Sensor(SensorSample::Mag(MagSample {
                time_us,
                field: self.xyz()?,
            })),
            LogSensor::Range => LogInput::Sensor(SensorSample::Range(RangeSample {
                time_us,
                range: required(self.x, "x", time_us)?,
            })),
            LogSensor::Flow => LogInput::Sensor(SensorSample::Flow(FlowSample {
                time_us,
                flow: Vector2::new(required(self.x, "x", time_us)?, required(self.y, "y", time_us)?),
                body_rotation: self.uvw()?,
                dt: required(self.dt, "dt", time_us)?,
                quality: required(self.quality, "quality", time_us)?,
            })),
            LogSensor::Vision => {
                let euler = self.uvw()?;
                let defaults = VisionSample::default();
                LogInput::Sensor(SensorSample::Vision(VisionSample {
                    time_us,
                    position: self.xyz()?,
                    attitude: UnitQuaternion::from_euler_angles(euler[0], euler[1], euler[2]),
                    position_error: self.accuracy.unwrap_or(defaults.position_error),
                    angle_error: self.angle_accuracy.unwrap_or(defaults.angle_error),
                }))
            }
            LogSensor::Airspeed => LogInput::Sensor(SensorSample::Airspeed(AirspeedSample {
                time_us,
                true_airspeed: required(self.x, "x", time_us)?,
                eas2tas: self.y.unwrap_or(1.0),
            })),
        };
        Ok(input)
    }

    pub fn imu(sample: &ImuSample) -> Self {
        LogRecord {
            time_us: sample.time_us,
            sensor: Some(LogSensor::Imu),
            x: Some(sample.delta_angle[0]),
            y: Some(sample.delta_angle[1]),
            z: Some(sample.delta_angle[2]),
            u: Some(sample.delta_velocity[0]),
            v: Some(sample.delta_velocity[1]),
            w: Some(sample.delta_velocity[2]),
            dt: Some(sample.dt),
            ..Default::default()
        }
    }
    pub fn gnss(sample: &GnssSample) -> Self {
        LogRecord {
            time_us: sample.time_us,
            sensor: Some(LogSensor::Gnss),
            x: Some(sample.latitude),
            y: Some(sample.longitude),
            z: Some(sample.altitude),
            u: Some(sample.velocity[0]),
            v: Some(sample.velocity[1]),
            w: Some(sample.velocity[2]),
            accuracy: Some(sample.horizontal_accuracy),
            vertical_accuracy: Some(sample.vertical_accuracy),
            speed_accuracy: Some(sample.speed_accuracy),
            fix_type: Some(sample.fix_type),
            satellites: Some(sample.satellites),
            pdop: Some(sample.pdop),
            ..Default::default()
        }
    }
    pub fn baro(sample: &BaroSample) -> Self {
        LogRecord {
            time_us: sample.time_us,
            sensor: Some(LogSensor::Baro),
            x: Some(sample.height),
            ..Default::default()
        }
    }
    pub fn mag(sample: &MagSample) -> Self {
        LogRecord {
            time_us: sample.time_us,
            sensor: Some(LogSensor::Mag),
            x: Some(sample.field[0]),
            y: Some(sample.field[1]),
            z: Some(sample.field[2]),
            ..Default::default()
        }
    }
}

/// Read a sensor log, sorted by time stamp. Rows that cannot be decoded are skipped with a warning.
pub fn read_log<P: AsRef<Path>>(path: P) -> Result<Vec<LogInput>, Box<dyn Error>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut inputs = Vec::new();
    for result in reader.deserialize() {
        let record: LogRecord = result?;
        match record.to_input() {
            Ok(input) => inputs.push(input),
            Err(err) => warn!("skipping log row: {}", err),
        }
    }
    inputs.sort_by_key(|input| match input {
        LogInput::Imu(imu) => imu.time_us,
        LogInput::Sensor(sample) => sample.time_us(),
    });
    Ok(inputs)
}

/// Write log records to a CSV file.
pub fn write_log<P: AsRef<Path>>(records: &[LogRecord], path: P) -> Result<(), Box<dyn Error>> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// One row of the navigation output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavRecord {
    pub time_us: u64,
    pub north_m: f64,
    pub east_m: f64,
    pub down_m: f64,
    pub vel_n_mps: f64,
    pub vel_e_mps: f64,
    pub vel_d_mps: f64,
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub yaw_deg: f64,
    pub terrain_down_m: f64,
    pub status_bits: u32,
    pub unhealthy_bits: u32,
    pub dead_reckoning: bool,
}
impl NavRecord {
    pub fn new(
        output: &OutputSample,
        terrain_down: f64,
        status_bits: u32,
        unhealthy_bits: u32,
        dead_reckoning: bool,
    ) -> Self {
        let (roll, pitch, yaw) = output.attitude.euler_angles();
        NavRecord {
            time_us: output.time_us,
            north_m: output.position[0],
            east_m: output.position[1],
            down_m: output.position[2],
            vel_n_mps: output.velocity[0],
            vel_e_mps: output.velocity[1],
            vel_d_mps: output.velocity[2],
            roll_deg: roll.to_degrees(),
            pitch_deg: pitch.to_degrees(),
            yaw_deg: yaw.to_degrees(),
            terrain_down_m: terrain_down,
            status_bits,
            unhealthy_bits,
            dead_reckoning,
        }
    }
}

pub fn write_nav<P: AsRef<Path>>(records: &[NavRecord], path: P) -> Result<(), Box<dyn Error>> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn test_validate_input_path() {
        let dir = tempdir().unwrap();
        let csv = dir.path().join("log.csv");
        File::create(&csv).unwrap();
        assert!(validate_input_path(&csv).is_ok());
        let txt = dir.path().join("log.txt");
        File::create(&txt).unwrap();
        assert!(validate_input_path(&txt).is_err());
        assert!(validate_input_path(Path::new("/nonexistent/log.csv")).is_err());
    }

    #[test]
    fn test_ensure_parent_dir() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("nested").join("nav.csv");
        ensure_parent_dir(&output).unwrap();
        assert!(output.parent().unwrap().exists());
    }

    #[test]
    fn test_log_is_read_in_time_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let imu = ImuSample::from_rates(8_000, Vector3::zeros(), Vector3::new(0.0, 0.0, -9.8), 0.004);
        let baro = BaroSample {
            time_us: 4_000,
            height: 12.5,
        };
        write_log(&[LogRecord::imu(&imu), LogRecord::baro(&baro)], &path).unwrap();
        let inputs = read_log(&path).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0], LogInput::Sensor(SensorSample::Baro(baro)));
        match inputs[1] {
            LogInput::Imu(read) => {
                assert_eq!(read.time_us, 8_000);
                assert_eq!(read.dt, 0.004);
            }
            other => panic!("unexpected input {:?}", other),
        }
    }

    #[test]
    fn test_missing_column_is_reported() {
        let record = LogRecord {
            time_us: 10,
            sensor: Some(LogSensor::Mag),
            x: Some(0.2),
            ..Default::default()
        };
        let err = record.to_input().unwrap_err();
        assert!(err.to_string().contains("'y'"));
    }
}
