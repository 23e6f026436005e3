//! End-to-end scenarios driving the public estimator with synthetic sensor streams.
mod common;

use nalgebra::Vector3;

use common::{Harness, IMU_INTERVAL_US, Sensors, at_rest};
use navfuse::earth::STANDARD_GRAVITY;
use navfuse::status::{Channel, FilterEvent, HeadingMode, HeightSource, HorizontalAiding};
use navfuse::{EstimatorConfig, EstimatorError, ImuSample};

#[test]
fn gnss_outage_falls_back_to_dead_reckoning() {
    let mut harness = Harness::new(EstimatorConfig::default());
    harness.run(20.0, Sensors::default());
    let status = *harness.estimator.control_status();
    assert!(status.tilt_align);
    assert!(status.yaw_align);
    assert_eq!(status.horizontal, HorizontalAiding::Gnss);
    assert!(!harness.estimator.is_dead_reckoning());
    assert_eq!(
        harness.count_events(|e| matches!(
            e,
            FilterEvent::AidingStarted {
                source: HorizontalAiding::Gnss,
                ..
            }
        )),
        1
    );

    // within the stop interval the source stays selected but nothing constrains the drift
    harness.run(5.0, Sensors::without_gnss());
    assert_eq!(
        harness.estimator.control_status().horizontal,
        HorizontalAiding::Gnss
    );
    assert!(harness.estimator.is_dead_reckoning());

    harness.run(10.0, Sensors::without_gnss());
    assert_eq!(
        harness.estimator.control_status().horizontal,
        HorizontalAiding::None
    );
    assert_eq!(
        harness.count_events(|e| matches!(
            e,
            FilterEvent::AidingStopped {
                source: HorizontalAiding::Gnss,
                ..
            }
        )),
        1
    );
    assert!(
        harness
            .count_events(|e| matches!(e, FilterEvent::NavigationStopped { .. }))
            >= 1
    );

    harness.run(20.0, Sensors::without_gnss());
    assert!(harness.estimator.is_dead_reckoning());
    let output = harness.estimator.output();
    assert!(output.position.iter().all(|v| v.is_finite()));
    assert!(harness.horizontal_offset() < 2.0, "drifted {} m", harness.horizontal_offset());
    assert!(output.velocity.norm() < 0.5);
}

#[test]
fn range_aid_takes_over_height_without_a_step() {
    let mut config = EstimatorConfig::default();
    config.range.aid = true;
    let mut harness = Harness::new(config);
    harness.run(20.0, Sensors::default());
    assert_eq!(
        harness.estimator.control_status().height_source,
        HeightSource::Baro
    );
    assert_eq!(
        harness.estimator.control_status().horizontal,
        HorizontalAiding::Gnss
    );

    let ranging = Sensors {
        range: Some(0.1),
        ..Default::default()
    };
    let mut previous = harness.estimator.state().unwrap().position[2];
    let mut switch = None;
    harness.run_with(5.0, ranging, |estimator| {
        let down = estimator.state().unwrap().position[2];
        if switch.is_none() && estimator.control_status().height_source == HeightSource::Range {
            switch = Some((previous, down));
        }
        previous = down;
    });
    let (before, after) = switch.expect("height source never switched to range");
    assert!((after - before).abs() < 0.02, "height stepped from {before} to {after}");
    assert!(harness.estimator.control_status().range_aid);
    assert_eq!(
        harness.count_events(|e| matches!(
            e,
            FilterEvent::HeightSourceChanged {
                from: HeightSource::Baro,
                to: HeightSource::Range,
                ..
            }
        )),
        1
    );
    assert!(
        harness
            .estimator
            .innovations()
            .get(Channel::RangeHeight)
            .is_some_and(|record| record.accepted)
    );
}

#[test]
fn sustained_yaw_rotation_makes_mag_bias_observable() {
    let mut harness = Harness::new(EstimatorConfig::default());
    harness.run(10.0, Sensors::without_gnss());
    assert!(harness.estimator.control_status().yaw_align);
    assert!(!harness.estimator.controller().heading().mag_bias_observable());

    let spinning = Sensors {
        yaw_rate: 0.5,
        ..Sensors::without_gnss()
    };
    harness.run(6.0, spinning);
    assert!(harness.estimator.controller().heading().mag_bias_observable());
    assert_eq!(
        harness.estimator.control_status().heading,
        HeadingMode::MagneticHeading
    );

    harness.run(12.0, Sensors::without_gnss());
    assert!(!harness.estimator.controller().heading().mag_bias_observable());
}

#[test]
fn dead_reckoning_holds_the_last_known_position() {
    let mut harness = Harness::new(EstimatorConfig::default());
    harness.estimator.set_in_air(true);
    harness.run(30.0, Sensors::without_gnss());
    assert!(harness.estimator.is_dead_reckoning());
    assert_eq!(
        harness.estimator.control_status().horizontal,
        HorizontalAiding::None
    );
    assert!(harness.horizontal_offset() < 1.0, "drifted {} m", harness.horizontal_offset());
    assert!(
        harness
            .estimator
            .innovations()
            .get(Channel::FakePosition)
            .is_some_and(|record| record.accepted)
    );
}

#[test]
fn non_finite_state_reinitializes_the_filter() {
    let mut harness = Harness::new(EstimatorConfig::default());
    harness.run(2.0, Sensors::without_gnss());
    assert!(harness.estimator.is_initialized());

    harness.time_us += IMU_INTERVAL_US;
    let dt = IMU_INTERVAL_US as f64 * 1e-6;
    let spike = ImuSample::from_rates(
        harness.time_us,
        Vector3::zeros(),
        Vector3::new(1e300, 0.0, -STANDARD_GRAVITY),
        dt,
    );
    harness.estimator.update(spike).unwrap();

    // the spike reaches the core once it leaves the inertial buffer
    let mut failure = None;
    for _ in 0..200 {
        harness.time_us += IMU_INTERVAL_US;
        if let Err(err) = harness.estimator.update(at_rest(harness.time_us)) {
            failure = Some(err);
            break;
        }
    }
    assert!(matches!(failure, Some(EstimatorError::NumericalFailure { .. })));
    assert!(!harness.estimator.is_initialized());
    assert!(
        harness
            .estimator
            .drain_events()
            .iter()
            .any(|e| matches!(e, FilterEvent::Reinitialized { .. }))
    );

    harness.run(1.0, Sensors::without_gnss());
    assert!(harness.estimator.is_initialized());
    let output = harness.estimator.output();
    assert!(output.velocity.norm() < 0.1);
    assert!(output.position.iter().all(|v| v.is_finite()));
}
