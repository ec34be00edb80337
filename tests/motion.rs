//! Motion command scenarios against a scripted drive.

mod util;

use atv320::{ErrorKind, cia402::ControlWord, positioner::DigitalInput};
use pretty_assertions::assert_eq;
use std::time::Duration;
use util::{Harness, positioning_config};

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn convey_completes_with_actual_travel() {
    let mut harness = Harness::new(positioning_config());
    harness.connect_peer("tester");

    let convey = tokio::spawn(harness.drive.controller().convey(50.0, 1000));

    // 10 um per cycle of feedback
    harness.set_frequency(500);
    let out = harness.cycle().await;
    assert_eq!(out.control_word, ControlWord::STATE_ENABLE_OP.bits());
    assert!(out.frequency > 0);

    for _ in 0..99 {
        harness.cycle().await;
    }

    // Travel reached, the command is now winding the motor down
    assert!(!convey.is_finished());
    harness.set_frequency(0);
    harness.cycle().await;

    let (err, travelled) = convey.await.unwrap();
    assert_eq!(err, ErrorKind::Success);
    assert!((990..=1010).contains(&travelled), "travelled {travelled} um");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn convey_zero_travel_completes_inline() {
    let mut harness = Harness::new(positioning_config());
    harness.connect_peer("tester");

    let before = harness.cycle().await;
    let (err, travelled) = harness.drive.controller().convey(50.0, 0).await;

    assert_eq!((err, travelled), (ErrorKind::Success, 0));

    // No new intent reaches the output
    let after = harness.cycle().await;
    assert_eq!(before, after);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn convey_backwards_reports_negative_travel() {
    let mut harness = Harness::new(positioning_config());
    harness.connect_peer("tester");

    let convey = tokio::spawn(harness.drive.controller().convey(50.0, -200));

    harness.set_frequency(-500);
    let out = harness.cycle().await;
    assert!(out.frequency < 0);

    harness.cycles(19).await;
    harness.set_frequency(0);
    harness.cycle().await;

    let (err, travelled) = convey.await.unwrap();
    assert_eq!(err, ErrorKind::Success);
    assert!((-210..=-190).contains(&travelled), "travelled {travelled} um");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn superseding_run_with_stop_cancels_it() {
    let mut harness = Harness::new(positioning_config());
    harness.connect_peer("tester");

    let run = tokio::spawn(
        harness
            .drive
            .surface()
            .run_at_speedratio("tester", 20.0),
    );
    harness.set_frequency(300);
    harness.cycle().await;

    let stop = tokio::spawn(harness.drive.surface().stop("tester"));
    harness.settle().await;

    assert_eq!(run.await.unwrap(), ErrorKind::OperationCanceled);

    // Drive rolls down to standstill, then the stop completes
    let out = harness.cycle().await;
    assert_eq!(out.frequency, 0);
    assert!(!stop.is_finished());

    harness.set_frequency(0);
    harness.cycle().await;
    assert_eq!(stop.await.unwrap(), ErrorKind::Success);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn move_without_homing_fails_fast() {
    let mut harness = Harness::new(positioning_config());
    harness.connect_peer("tester");

    let before = harness.cycle().await;
    let (err, _) = harness.drive.controller().move_to(50.0, 1000).await;

    assert_eq!(err, ErrorKind::MotorMissingHomeReference);
    assert_eq!(harness.cycle().await, before);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn move_within_resolution_completes_inline() {
    let mut harness = Harness::new(positioning_config());
    harness.connect_peer("tester");

    harness.drive.controller().positioner().home(0);

    let (err, placement) = harness.drive.controller().move_to(50.0, 5).await;

    assert_eq!((err, placement), (ErrorKind::Success, 5));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn move_runs_to_placement_and_quick_stops() {
    let mut harness = Harness::new(positioning_config());
    harness.connect_peer("tester");

    harness.drive.controller().positioner().home(0);

    let move_cmd = tokio::spawn(harness.drive.controller().move_to(50.0, 300));

    harness.set_frequency(500);
    let out = harness.cycle().await;
    assert_eq!(out.control_word, ControlWord::STATE_ENABLE_OP.bits());

    harness.cycles(29).await;

    // Placement reached; the wind down is a quick stop
    let out = harness.cycle().await;
    assert_eq!(out.control_word, ControlWord::STATE_QUICK_STOP.bits());

    harness.set_frequency(0);
    harness.cycle().await;

    let (err, placement) = move_cmd.await.unwrap();
    assert_eq!(err, ErrorKind::Success);
    assert!((290..=310).contains(&placement), "stopped at {placement} um");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn dead_band_speedratio_outputs_zero_reference() {
    let mut harness = Harness::new(positioning_config());
    harness.connect_peer("tester");

    let _run = tokio::spawn(harness.drive.controller().run(0.5));

    let out = harness.cycle().await;

    assert_eq!(out.frequency, 0);
    // The drive stays enabled, ready to spin once a real ratio arrives
    assert_eq!(out.control_word, ControlWord::STATE_ENABLE_OP.bits());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn timed_run_stops_after_the_duration() {
    let mut harness = Harness::new(positioning_config());
    harness.connect_peer("tester");

    let run = tokio::spawn(
        harness
            .drive
            .controller()
            .run_for(30.0, Duration::from_millis(50)),
    );

    harness.set_frequency(300);
    let out = harness.cycle().await;
    assert_eq!(out.control_word, ControlWord::STATE_ENABLE_OP.bits());

    // Let the timer expire, then report standstill
    tokio::time::sleep(Duration::from_millis(60)).await;
    harness.set_frequency(0);
    harness.cycle().await;

    assert_eq!(run.await.unwrap(), ErrorKind::Success);
    let out = harness.cycle().await;
    assert_eq!(out.frequency, 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn timed_run_with_zero_duration_is_a_no_op() {
    let mut harness = Harness::new(positioning_config());
    harness.connect_peer("tester");

    let err = harness
        .drive
        .controller()
        .run_for(30.0, Duration::ZERO)
        .await;

    assert_eq!(err, ErrorKind::Success);
    assert_eq!(harness.cycle().await.frequency, 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn positive_limit_aborts_positive_motion_only() {
    let mut harness = Harness::new(positioning_config());
    harness.connect_peer("tester");

    let run = tokio::spawn(harness.drive.controller().run(50.0));

    harness.set_frequency(500);
    harness.cycle().await;

    // Limit switch trips mid run
    harness.set_digital_input(DigitalInput::Di1, true);
    harness.cycle().await;
    harness.set_frequency(0);
    harness.cycle().await;

    assert_eq!(
        run.await.unwrap(),
        ErrorKind::PositioningPositiveLimitReached
    );

    // Starting into the limit again is forbidden
    assert_eq!(
        harness.drive.controller().run(10.0).await,
        ErrorKind::PositioningPositiveLimitReached
    );

    // Backing off the limit is always permitted
    let back_off = tokio::spawn(harness.drive.controller().run(-10.0));
    harness.set_frequency(-100);
    harness.cycles(3).await;
    assert!(!back_off.is_finished());

    // The switch releases once clear of the limit
    harness.set_digital_input(DigitalInput::Di1, false);
    harness.cycle().await;
    assert_eq!(harness.drive.controller().limit_error(), ErrorKind::Success);

    back_off.abort();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn notify_after_is_purely_positional() {
    let mut harness = Harness::new(positioning_config());

    // No peer required for notifications
    let notify = tokio::spawn(harness.drive.surface().notify_after_micrometre(50));

    harness.set_frequency(500);
    harness.cycles(4).await;
    assert!(!notify.is_finished());

    harness.cycle().await;
    assert_eq!(notify.await.unwrap(), ErrorKind::Success);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn move_home_stores_the_reference_on_the_sensor_edge() {
    let mut harness = Harness::new(positioning_config());
    harness.connect_peer("tester");

    assert_eq!(
        harness.drive.surface().needs_homing(),
        (ErrorKind::MotorMissingHomeReference, true)
    );

    let home = tokio::spawn(harness.drive.controller().move_home());

    // Homing speed is 10 %
    harness.set_frequency(200);
    let out = harness.cycle().await;
    assert_eq!(out.control_word, ControlWord::STATE_ENABLE_OP.bits());
    assert!(out.frequency > 0);

    harness.cycles(5).await;

    // Sensor edge: the command quick stops and stores home
    harness.set_digital_input(DigitalInput::Di3, true);
    harness.cycle().await;
    harness.set_frequency(0);
    harness.cycle().await;

    assert_eq!(home.await.unwrap(), ErrorKind::Success);
    assert_eq!(harness.drive.surface().needs_homing(), (ErrorKind::Success, false));

    let from_home = harness
        .drive
        .controller()
        .positioner()
        .position_from_home()
        .expect("homed");
    assert_eq!(from_home, 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn move_home_completes_inline_when_already_on_the_sensor() {
    let mut harness = Harness::new(positioning_config());
    harness.connect_peer("tester");

    harness.set_digital_input(DigitalInput::Di3, true);
    harness.cycle().await;

    let err = harness.drive.controller().move_home().await;

    assert_eq!(err, ErrorKind::Success);
    assert_eq!(
        harness
            .drive
            .controller()
            .positioner()
            .position_from_home(),
        Some(0)
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn move_home_without_a_sensor_is_rejected() {
    let mut config = positioning_config();
    config.positioner.homing_sensor = None;
    let mut harness = Harness::new(config);
    harness.connect_peer("tester");

    harness.cycle().await;

    assert_eq!(
        harness.drive.controller().move_home().await,
        ErrorKind::MotorHomeSensorUnconfigured
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn shared_homing_and_limit_channel_prefers_homing() {
    let mut config = positioning_config();
    // One physical sensor serves both homing and the positive limit
    config.positioner.homing_sensor = Some(DigitalInput::Di1);
    config.positioner.positive_limit_switch = Some(DigitalInput::Di1);
    let mut harness = Harness::new(config);
    harness.connect_peer("tester");

    let home = tokio::spawn(harness.drive.controller().move_home());

    harness.set_frequency(200);
    harness.cycles(3).await;

    harness.set_digital_input(DigitalInput::Di1, true);
    harness.cycle().await;
    harness.set_frequency(0);
    harness.cycle().await;

    // Consumed as homing, not as a limit error
    assert_eq!(home.await.unwrap(), ErrorKind::Success);
    assert_eq!(harness.drive.controller().limit_error(), ErrorKind::Success);
}
