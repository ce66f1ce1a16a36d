mod common;

use std::time::Duration;

use common::{flat, options, DeviceScript, ScriptedTransport};
use cr30::{
    color::Xyz,
    command::CalibrationTarget,
    session::{MeasurementTrigger, SessionState},
    spd::ChunkType,
    DeviceSession, Error, Warning,
};

async fn ready_session(script: DeviceScript) -> DeviceSession<ScriptedTransport> {
    let mut session = DeviceSession::new(ScriptedTransport::new(script), options());
    assert_eq!(session.state(), SessionState::Disconnected);
    session.connect().await.unwrap();
    session.handshake().await.unwrap();
    session
}

#[tokio::test(start_paused = true)]
async fn test_handshake_populates_device_info() {
    let session = ready_session(DeviceScript::default()).await;
    assert_eq!(session.state(), SessionState::Handshaken);

    let info = session.info().unwrap();
    assert_eq!(info.name, "CR30");
    assert_eq!(info.model, "SD6870B667");
    assert_eq!(info.serial, "M443L0787-V11.3");
    assert_eq!(info.firmware, "V10.0.0.0");
    assert_eq!(info.build, "2021-06-01");
    assert_eq!(info.parameters.len(), 6);
    assert_eq!(info.parameters[&0xFF], format!("ff01{}", "00".repeat(50)));

    let transport = session.transport();
    assert_eq!(transport.sent_count(0x17, 0x00), 1);
    assert_eq!(transport.sent_count(0x13, 0x00), 1);
    assert_eq!(transport.sent_count(0x28, 0x00), 6);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_without_name_fails() {
    let script = DeviceScript::default().silence(0x0A, 0x00);
    let mut session = DeviceSession::new(ScriptedTransport::new(script), options());
    session.connect().await.unwrap();
    assert!(matches!(session.handshake().await, Err(Error::Handshake(_))));
    assert!(session.info().is_none());
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_missing_serial_is_unknown() {
    let script = DeviceScript::default().silence(0x0A, 0x01);
    let session = ready_session(script).await;
    let info = session.info().unwrap();
    assert_eq!(info.serial, "Unknown");
    assert_eq!(info.firmware, "V10.0.0.0");
}

#[tokio::test(start_paused = true)]
async fn test_repeated_replies_do_not_shift_fields() {
    let script = DeviceScript::default().repeat(0x0A, 0x01).repeat(0x28, 0x00);
    let session = ready_session(script).await;
    let info = session.info().unwrap();
    assert_eq!(info.serial, "M443L0787-V11.3");
    assert_eq!(info.firmware, "V10.0.0.0");
    assert_eq!(info.build, "2021-06-01");
    for (index, payload) in &info.parameters {
        assert!(payload.starts_with(&format!("{index:02x}01")), "{index:#04x}: {payload}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_commands_require_handshake() {
    let mut session = DeviceSession::new(ScriptedTransport::new(DeviceScript::default()), options());
    session.connect().await.unwrap();
    assert!(matches!(
        session.trigger_measurement().await,
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        session.calibrate(true, false).await,
        Err(Error::InvalidState { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_calibration_reports_status() {
    let mut session = ready_session(DeviceScript::default()).await;
    let reports = session.calibrate(true, true).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].target, CalibrationTarget::White);
    assert_eq!(reports[1].target, CalibrationTarget::Black);
    assert!(reports.iter().all(|r| r.success));
    assert_eq!(session.state(), SessionState::Idle);

    let sent = session.transport().sent();
    let white = sent.iter().position(|h| h.1 == 0x11).unwrap();
    let black = sent.iter().position(|h| h.1 == 0x10).unwrap();
    assert!(white < black);

    assert!(session.calibrate(false, false).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_calibration_bad_status_is_not_an_error() {
    let script = DeviceScript {
        calibration_status: 0x00,
        ..Default::default()
    };
    let mut session = ready_session(script).await;
    let report = session.calibrate_one(CalibrationTarget::Black).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.status, 0x00);
}

#[tokio::test(start_paused = true)]
async fn test_calibration_timeout() {
    let script = DeviceScript::default().silence(0x11, 0x00);
    let mut session = ready_session(script).await;
    let result = session.calibrate(true, true).await;
    assert!(matches!(
        result,
        Err(Error::Calibration {
            target: CalibrationTarget::White,
            ..
        })
    ));
    assert_eq!(session.state(), SessionState::Idle);
    // Black never ran.
    assert_eq!(session.transport().sent_count(0x10, 0x00), 0);
}

#[tokio::test(start_paused = true)]
async fn test_measurement_within_tolerance() {
    let mut session = ready_session(DeviceScript::default()).await;
    let measurement = session.measure().await.unwrap();

    assert_eq!(measurement.spd.len(), 31);
    assert_eq!(measurement.wavelengths.first(), Some(&400.0));
    assert_eq!(measurement.wavelengths.last(), Some(&700.0));
    assert!(measurement.spd.iter().all(|v| *v == 50.0));
    assert_eq!(measurement.device_xyz, Some(Xyz::new(41.25, 35.5, 12.0)));
    assert_eq!(measurement.trigger, MeasurementTrigger::Host);
    assert!(measurement.warnings.is_empty());
    assert!(measurement.raw.contains_key("header"));
    assert!(measurement.raw.contains_key("chunk 0x13"));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_measurement_integrity_warning() {
    let script = DeviceScript {
        chunk_xyz: Xyz::new(46.25, 35.5, 12.0),
        ..Default::default()
    };
    let mut session = ready_session(script).await;
    let measurement = session.measure().await.unwrap();

    assert!(measurement.has_integrity_warning());
    match &measurement.warnings[..] {
        [Warning::DataIntegrity { difference, .. }] => assert!((difference - 5.0).abs() < 1e-4),
        other => panic!("unexpected warnings {other:?}"),
    }
    assert_eq!(measurement.spd.len(), 31);
}

#[tokio::test(start_paused = true)]
async fn test_chunks_out_of_order_and_duplicated() {
    let script = DeviceScript {
        spectra: vec![flat(25.0)],
        burst: Some(vec![
            ChunkType::SpdHigh,
            ChunkType::SpdLow,
            ChunkType::SpdLow,
            ChunkType::Xyz,
            ChunkType::SpdMid,
        ]),
        ..Default::default()
    };
    let mut session = ready_session(script).await;
    let measurement = session.measure().await.unwrap();

    assert!(measurement.spd.iter().all(|v| *v == 25.0));
    // 0x12 and 0x13 arrived early and were never requested.
    let transport = session.transport();
    assert_eq!(transport.sent_count(0x01, 0x10), 1);
    assert_eq!(transport.sent_count(0x01, 0x12), 0);
    assert_eq!(transport.sent_count(0x01, 0x13), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_chunk_times_out() {
    let script = DeviceScript::default().silence(0x01, 0x12);
    let mut session = ready_session(script).await;
    match session.measure().await {
        Err(Error::MeasurementTimeout { step }) => assert_eq!(step, "chunk 0x12"),
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Idle);

    // The session is usable again once the device answers.
    assert!(session.trigger_measurement().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_each_chunk_gets_its_own_timeout() {
    // 300 ms per step; every chunk takes 240 ms, about a second in total.
    let slow = Duration::from_millis(240);
    let mut script = DeviceScript::default();
    for chunk_type in ChunkType::ALL {
        script = script.delay(0x01, chunk_type as u8, slow);
    }
    let mut session = ready_session(script).await;

    let started = tokio::time::Instant::now();
    let measurement = session.measure().await.unwrap();
    assert!(started.elapsed() >= slow * 4);
    assert!(measurement.spd.iter().all(|v| *v == 50.0));
}

#[tokio::test(start_paused = true)]
async fn test_one_slow_chunk_times_out() {
    let script = DeviceScript::default().delay(0x01, 0x11, Duration::from_millis(360));
    let mut session = ready_session(script).await;
    match session.measure().await {
        Err(Error::MeasurementTimeout { step }) => assert_eq!(step, "chunk 0x11"),
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_without_header_times_out() {
    let script = DeviceScript::default().silence(0x01, 0x00);
    let mut session = ready_session(script).await;
    match session.trigger_measurement().await {
        Err(Error::MeasurementTimeout { step }) => assert_eq!(step, "measurement header"),
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_button_measurement() {
    let mut session = ready_session(DeviceScript::default()).await;

    match session.wait_for_button(Duration::from_millis(500)).await {
        Err(Error::MeasurementTimeout { step }) => assert_eq!(step, "button press"),
        other => panic!("expected a timeout, got {other:?}"),
    }

    session.transport().press_button(1);
    let pending = session.wait_for_button(Duration::from_millis(500)).await.unwrap();
    assert_eq!(pending.trigger(), MeasurementTrigger::Button);
    assert_eq!(pending.device_xyz(), Some(Xyz::new(41.25, 35.5, 12.0)));

    let measurement = session
        .read_measurement(pending, Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(measurement.trigger, MeasurementTrigger::Button);
    assert_eq!(session.transport().sent_count(0x01, 0x00), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect() {
    let mut session = ready_session(DeviceScript::default()).await;
    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(session.measure().await, Err(Error::InvalidState { .. })));
}
