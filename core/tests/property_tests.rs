//! Invariants that must hold on every cycle, checked on synthetic runs and on the core directly.
mod common;

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use common::{Harness, IMU_INTERVAL_US, Sensors, at_rest};
use navfuse::ekf::{CoreEstimator, FusionOutcome};
use navfuse::measurements::{HeightMeasurement, Observation};
use navfuse::output::{OutputPredictor, OutputSample};
use navfuse::status::{Channel, FilterEvent, HeightSource};
use navfuse::{Estimator, EstimatorConfig, ImuSample, NavigationState};

fn assert_invariants(estimator: &Estimator) {
    if let Some(p) = estimator.covariance() {
        let asymmetry = (p - p.transpose()).amax();
        assert!(asymmetry <= 1e-12 * p.amax().max(1.0), "asymmetry {asymmetry}");
        assert!(p.diagonal().iter().all(|v| *v >= 0.0 && v.is_finite()));
    }
    if let Some(state) = estimator.state() {
        assert!((state.attitude.quaternion().norm() - 1.0).abs() < 1e-9);
    }
    assert!((estimator.output().attitude.quaternion().norm() - 1.0).abs() < 1e-9);
}

#[test]
fn covariance_symmetric_and_quaternion_normalized_every_cycle() {
    let mut harness = Harness::new(EstimatorConfig::default());
    harness.run_with(20.0, Sensors::default(), assert_invariants);
    let spinning = Sensors {
        yaw_rate: 0.8,
        ..Default::default()
    };
    harness.run_with(5.0, spinning, assert_invariants);
    assert!(harness.cycles > 6_000);
}

#[test]
fn rejected_update_leaves_state_untouched() {
    let config = EstimatorConfig::default();
    let mut core = CoreEstimator::new(&config, NavigationState::default(), 0);
    let model = HeightMeasurement {
        channel: Channel::BaroHeight,
        down: -100.0,
        noise_std: 0.1,
    };
    let observation = Observation::new(&model, core.state(), 3.0);
    let state = *core.state();
    let covariance = core.covariance().clone();
    let report = core.fuse(&observation).unwrap();
    assert!(matches!(report.outcome, FusionOutcome::Rejected { .. }));
    assert!(report.test_ratio > 1.0);
    assert_eq!(*core.state(), state);
    assert_eq!(*core.covariance(), covariance);
}

#[test]
fn height_source_switch_keeps_published_height() {
    let mut config = EstimatorConfig::default();
    config.height_source = HeightSource::Gnss;
    let mut harness = Harness::new(config);
    let mut previous: Option<(f64, f64)> = None;
    let mut switch = None;
    harness.run_with(25.0, Sensors::default(), |estimator| {
        let heights = estimator
            .state()
            .map(|state| (state.position[2], estimator.output().position[2]));
        if switch.is_none() && estimator.control_status().height_source == HeightSource::Gnss {
            switch = previous.zip(heights);
        }
        previous = heights;
    });
    let ((core_before, output_before), (core_after, output_after)) =
        switch.expect("height source never switched to gnss");
    assert!((core_after - core_before).abs() < 0.02);
    assert!((output_after - output_before).abs() < 0.02);
    assert_eq!(
        harness.count_events(|e| matches!(
            e,
            FilterEvent::HeightSourceChanged {
                from: HeightSource::Baro,
                to: HeightSource::Gnss,
                ..
            }
        )),
        1
    );
}

#[test]
fn reset_delta_moves_output_history_onto_core() {
    let config = EstimatorConfig::default();
    let initial = NavigationState {
        attitude: UnitQuaternion::from_euler_angles(0.05, -0.02, 0.3),
        velocity: Vector3::new(1.0, 0.5, 0.0),
        ..Default::default()
    };
    let mut core = CoreEstimator::new(&config, initial, 0);
    let mut output = OutputPredictor::new(&config);
    let newer: Vec<ImuSample> = (1..=10).map(|i| at_rest(i * IMU_INTERVAL_US)).collect();
    output.align(core.state(), 0, &newer);
    let snapshot: Vec<OutputSample> = output.history().copied().collect();
    let before = *core.state();

    let delta = core
        .reset_yaw(-1.2, 0.01)
        .then(&core.reset_horizontal_position(Vector2::new(5.0, -3.0), 0.25))
        .then(&core.reset_horizontal_velocity(Vector2::zeros(), 0.25));
    let after = *core.state();

    let mut derived = before;
    delta.apply(&mut derived.attitude, &mut derived.velocity, &mut derived.position);
    assert!(derived.attitude.angle_to(&after.attitude) < 1e-9);
    assert!((derived.velocity - after.velocity).norm() < 1e-9);
    assert!((derived.position - after.position).norm() < 1e-9);

    output.apply_reset(&delta);
    let history: Vec<OutputSample> = output.history().copied().collect();
    assert_eq!(history.len(), snapshot.len());
    // the entry at the core's time now matches the reset core state
    assert_eq!(history[0].time_us, 0);
    assert!(history[0].attitude.angle_to(&after.attitude) < 1e-9);
    assert!((history[0].position - after.position).norm() < 1e-9);
    assert!((history[0].velocity - after.velocity).norm() < 1e-9);
    for (old, new) in snapshot.iter().zip(&history) {
        let mut expected = *old;
        delta.apply(&mut expected.attitude, &mut expected.velocity, &mut expected.position);
        assert!(expected.attitude.angle_to(&new.attitude) < 1e-12);
        assert!((expected.position - new.position).norm() < 1e-12);
    }
    assert!((output.output().position - history[history.len() - 1].position).norm() < 1e-12);
}
