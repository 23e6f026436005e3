//! NAVFUSE SIM: a replay harness for the navfuse estimator.
//!
//! The program has three commands:
//!
//! - `replay`: feeds a CSV sensor log through the estimator in time order and writes the published
//!   navigation solution to CSV, followed by a summary of the estimator's events.
//! - `synth`: writes a noisy synthetic hover log, optionally with a GNSS outage window.
//! - `config`: writes the default estimator configuration (TOML/JSON/YAML).
//!
//! See [`common::LogRecord`] for the sensor log format.

mod common;
mod synth;

use std::collections::BTreeMap;
use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};

use navfuse::status::FilterEvent;
use navfuse::{Estimator, EstimatorConfig, EstimatorError};

use common::{
    LogInput, NavRecord, ensure_parent_dir, init_logger, read_log, validate_input_path, write_log,
    write_nav,
};
use synth::{SynthConfig, synthesize};

const LONG_ABOUT: &str = "NAVFUSE SIM: a replay harness for the navfuse estimator.

Replays CSV sensor logs (IMU, GNSS, barometer, magnetometer, range finder, optical flow,
external vision and airspeed) through the delayed-horizon EKF and writes the undelayed
navigation solution. Synthetic hover logs with GNSS outages can be generated for testing.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "A replay harness for the navfuse estimator.", long_about = LONG_ABOUT)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(about = "Replay a sensor log through the estimator")]
    Replay(ReplayArgs),
    #[command(about = "Write a synthetic hover log")]
    Synth(SynthArgs),
    #[command(about = "Write the default estimator configuration")]
    Config(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct ReplayArgs {
    /// Input CSV sensor log
    #[arg(short, long, value_parser)]
    input: PathBuf,

    /// Output CSV file for the navigation solution
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Estimator configuration file (TOML/JSON/YAML); defaults are used if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write one navigation row every N core cycles
    #[arg(long, default_value_t = 10)]
    every: usize,

    /// Treat the vehicle as airborne for the whole log
    #[arg(long)]
    in_air: bool,

    /// The vehicle is a fixed-wing aircraft
    #[arg(long)]
    fixed_wing: bool,
}

#[derive(Args, Clone, Debug)]
struct SynthArgs {
    /// Output CSV sensor log
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Log duration in seconds
    #[arg(long, default_value_t = 60.0)]
    duration: f64,

    /// GNSS outage window as "start,end" in seconds
    #[arg(long, value_parser = parse_outage)]
    gnss_outage: Option<(f64, f64)>,

    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Output configuration file; the format follows the extension
    #[arg(short, long, value_parser)]
    output: PathBuf,
}

fn parse_outage(value: &str) -> Result<(f64, f64), String> {
    let (start, end) = value
        .split_once(',')
        .ok_or_else(|| format!("expected 'start,end', got '{}'", value))?;
    let start: f64 = start.trim().parse().map_err(|e| format!("bad start: {}", e))?;
    let end: f64 = end.trim().parse().map_err(|e| format!("bad end: {}", e))?;
    if !(end > start) {
        return Err(format!("outage end {} must follow start {}", end, start));
    }
    Ok((start, end))
}

/// What happened during a replay.
#[derive(Debug, Default)]
struct ReplaySummary {
    imu_samples: usize,
    core_cycles: usize,
    rejected_samples: usize,
    reinitializations: usize,
    events: BTreeMap<&'static str, usize>,
    rows: Vec<NavRecord>,
}
impl ReplaySummary {
    fn record_events(&mut self, events: Vec<FilterEvent>) {
        for event in events {
            *self.events.entry(event_name(&event)).or_default() += 1;
        }
    }
}

fn event_name(event: &FilterEvent) -> &'static str {
    match event {
        FilterEvent::Initialized { .. } => "initialized",
        FilterEvent::TiltAligned { .. } => "tilt aligned",
        FilterEvent::YawAligned { .. } => "yaw aligned",
        FilterEvent::HeightSourceChanged { .. } => "height source changed",
        FilterEvent::AidingStarted { .. } => "aiding started",
        FilterEvent::AidingStopped { .. } => "aiding stopped",
        FilterEvent::HeadingModeChanged { .. } => "heading mode changed",
        FilterEvent::StateReset { .. } => "state reset",
        FilterEvent::NavigationStopped { .. } => "navigation stopped",
        FilterEvent::ChannelUnhealthy { .. } => "channel unhealthy",
        FilterEvent::ChannelRecovered { .. } => "channel recovered",
        FilterEvent::WindEstimationStarted { .. } => "wind estimation started",
        FilterEvent::WindEstimationStopped { .. } => "wind estimation stopped",
        FilterEvent::Reinitialized { .. } => "reinitialized",
    }
}

fn replay(
    inputs: &[LogInput],
    config: EstimatorConfig,
    args: &ReplayArgs,
) -> Result<ReplaySummary, Box<dyn Error>> {
    let mut estimator = Estimator::new(config)?;
    estimator.set_in_air(args.in_air);
    estimator.set_fixed_wing(args.fixed_wing);
    let every = args.every.max(1);
    let mut summary = ReplaySummary::default();
    for input in inputs {
        match input {
            LogInput::Sensor(sample) => {
                if estimator.push(*sample).is_err() {
                    summary.rejected_samples += 1;
                }
            }
            LogInput::Imu(imu) => {
                summary.imu_samples += 1;
                match estimator.update(*imu) {
                    Ok(true) => {
                        summary.core_cycles += 1;
                        if summary.core_cycles % every == 0 {
                            summary.rows.push(NavRecord::new(
                                estimator.output(),
                                estimator.terrain_down(),
                                estimator.control_status().to_bits(),
                                estimator.faults().unhealthy_bits(),
                                estimator.is_dead_reckoning(),
                            ));
                        }
                    }
                    Ok(false) => {}
                    Err(err @ EstimatorError::NumericalFailure { .. }) => {
                        error!("{}", err);
                        summary.reinitializations += 1;
                    }
                    Err(err) => {
                        warn!("{}", err);
                        summary.rejected_samples += 1;
                    }
                }
                summary.record_events(estimator.drain_events());
            }
        }
    }
    Ok(summary)
}

fn run_replay(args: &ReplayArgs) -> Result<(), Box<dyn Error>> {
    validate_input_path(&args.input)?;
    ensure_parent_dir(&args.output)?;
    let config = match &args.config {
        Some(path) => {
            info!("Loading estimator configuration from {}", path.display());
            EstimatorConfig::from_file(path)?
        }
        None => EstimatorConfig::default(),
    };
    let inputs = read_log(&args.input)?;
    info!("Read {} samples from {}", inputs.len(), args.input.display());

    let summary = replay(&inputs, config, args)?;
    write_nav(&summary.rows, &args.output)?;
    info!(
        "Wrote {} navigation rows to {}",
        summary.rows.len(),
        args.output.display()
    );

    println!("IMU samples:       {}", summary.imu_samples);
    println!("Core cycles:       {}", summary.core_cycles);
    println!("Rejected samples:  {}", summary.rejected_samples);
    println!("Reinitializations: {}", summary.reinitializations);
    for (name, count) in &summary.events {
        println!("  {:<24} {}", name, count);
    }
    Ok(())
}

fn run_synth(args: &SynthArgs) -> Result<(), Box<dyn Error>> {
    ensure_parent_dir(&args.output)?;
    let config = SynthConfig {
        duration_s: args.duration,
        gnss_outage: args.gnss_outage,
        seed: args.seed,
        ..Default::default()
    };
    let records = synthesize(&config)?;
    write_log(&records, &args.output)?;
    info!(
        "Wrote {} synthetic samples to {}",
        records.len(),
        args.output.display()
    );
    Ok(())
}

fn run_config(output: &Path) -> Result<(), Box<dyn Error>> {
    ensure_parent_dir(output)?;
    EstimatorConfig::default().to_file(output)?;
    info!("Default configuration written to {}", output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;
    match &cli.command {
        Command::Replay(args) => run_replay(args),
        Command::Synth(args) => run_synth(args),
        Command::Config(args) => run_config(&args.output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_outage() {
        assert_eq!(parse_outage("10,20.5"), Ok((10.0, 20.5)));
        assert_eq!(parse_outage(" 1 , 2 "), Ok((1.0, 2.0)));
        assert!(parse_outage("20,10").is_err());
        assert!(parse_outage("10").is_err());
        assert!(parse_outage("a,b").is_err());
    }

    #[test]
    fn test_cli_parses_replay() {
        let cli = Cli::try_parse_from([
            "navfuse-sim",
            "replay",
            "--input",
            "log.csv",
            "--output",
            "nav.csv",
            "--every",
            "5",
            "--in-air",
        ])
        .unwrap();
        match cli.command {
            Command::Replay(args) => {
                assert_eq!(args.every, 5);
                assert!(args.in_air);
                assert!(args.config.is_none());
            }
            _ => panic!("expected replay"),
        }
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg").join("estimator.toml");
        run_config(&path).unwrap();
        assert_eq!(
            EstimatorConfig::from_file(&path).unwrap(),
            EstimatorConfig::default()
        );
    }

    #[test]
    fn test_synthetic_log_replays() {
        let records = synthesize(&SynthConfig {
            duration_s: 5.0,
            ..Default::default()
        })
        .unwrap();
        let dir = tempdir().unwrap();
        let log = dir.path().join("log.csv");
        write_log(&records, &log).unwrap();
        let inputs = read_log(&log).unwrap();
        let args = ReplayArgs {
            input: log,
            output: dir.path().join("nav.csv"),
            config: None,
            every: 25,
            in_air: false,
            fixed_wing: false,
        };
        let summary = replay(&inputs, EstimatorConfig::default(), &args).unwrap();
        assert_eq!(summary.imu_samples, 1250);
        assert_eq!(summary.reinitializations, 0);
        assert_eq!(summary.events.get("initialized"), Some(&1));
        assert_eq!(summary.rows.len(), summary.core_cycles / 25);
        let last = summary.rows.last().unwrap();
        assert!(last.north_m.abs() < 5.0 && last.east_m.abs() < 5.0);
    }
}
