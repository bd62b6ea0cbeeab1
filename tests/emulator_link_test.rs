//! End-to-end over TCP: real Modbus and line-protocol readers against the emulators.

use itp_monitor::config::Settings;
use itp_monitor::controller::AcquisitionController;
use itp_monitor::core::{ConnectionState, ErrorEvent, ErrorSource};
use itp_monitor::data::CsvLogWriter;
use itp_monitor::emulator::{Emulator, EmulatorConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn setup() -> (Emulator, Settings) {
    let emulator = Emulator::spawn(EmulatorConfig::loopback(15)).await.unwrap();
    let mut settings = Settings::default();
    settings.access_link.host = emulator.access_endpoint().host;
    settings.access_link.port = emulator.access_endpoint().port;
    settings.process_link.host = emulator.process_endpoint().host;
    settings.process_link.port = emulator.process_endpoint().port;
    settings.validate().unwrap();
    (emulator, settings)
}

async fn connect(settings: &Settings) -> AcquisitionController {
    let controller = AcquisitionController::from_settings(settings);
    controller
        .connect(&settings.access_endpoint(), &settings.process_endpoint())
        .await
        .unwrap();
    controller
}

#[tokio::test]
async fn test_poll_over_tcp() {
    let (emulator, settings) = setup().await;
    let controller = connect(&settings).await;
    assert_eq!(controller.state(), ConnectionState::Connected);

    let first = controller.poll_once().await.unwrap().unwrap();
    let second = controller.poll_once().await.unwrap().unwrap();

    assert_eq!(first.access.len(), 15);
    assert!((first.access.channels()[0] - 10.0).abs() < 0.5);
    assert!((first.derived.current1 - 2.0e-6).abs() < 0.2e-6);
    assert!((first.derived.current2 - 3.0e-6).abs() < 0.3e-6);
    assert!(first.process.field("Temp").is_some());
    assert!(second.derived.reactivity1.is_finite());
    assert_eq!(emulator.state().modbus_requests(), 2);
    assert_eq!(emulator.state().process_requests(), 2);

    controller.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_modbus_exception_skips_tick() {
    let (emulator, settings) = setup().await;
    let controller = connect(&settings).await;
    let errors: Arc<Mutex<Vec<ErrorEvent>>> = Arc::default();
    let sink = errors.clone();
    controller
        .events()
        .error_occurred
        .subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    emulator.state().fail_next_modbus(1);
    assert!(controller.poll_once().await.unwrap().is_none());

    // The driver's error signal arrives on its own task.
    let mut waited = Duration::ZERO;
    while errors.lock().unwrap().len() < 2 && waited < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    {
        let errors = errors.lock().unwrap();
        assert!(errors
            .iter()
            .all(|e| e.source == ErrorSource::AccessLink));
        // Protocol error from the tick and the driver's exception signal.
        assert!(errors.iter().any(|e| e.code == 31));
        assert!(errors.iter().any(|e| e.code == 4));
    }

    // The exception frame was consumed whole; the link keeps working.
    assert!(controller.poll_once().await.unwrap().is_some());
    controller.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_process_link_releases_access_link() {
    let (emulator, mut settings) = setup().await;
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    settings.process_link.port = closed.local_addr().unwrap().port();
    drop(closed);

    let controller = AcquisitionController::from_settings(&settings);
    let err = controller
        .connect(&settings.access_endpoint(), &settings.process_endpoint())
        .await
        .unwrap_err();

    assert_eq!(err.code(), 21);
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert_eq!(emulator.state().modbus_requests(), 0);
}

#[tokio::test]
async fn test_timed_run_logs_rows() {
    let (_emulator, mut settings) = setup().await;
    settings.acquisition.frequency_index = 2; // 20 Hz
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.csv");

    let controller = connect(&settings).await;
    controller.set_logger(Box::new(
        CsvLogWriter::open(&path, &settings.storage.channel_names).unwrap(),
    ));
    controller.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    controller.disconnect().await.unwrap();
    drop(controller.take_logger());

    let published = controller.metrics().published;
    assert!(published >= 2, "only {published} rows");
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count() as u64, published + 1);
    assert!(text.starts_with("time,J1,J2,R1,R2,P1k,Tcold,"));
}
