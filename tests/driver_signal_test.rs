//! Asynchronous access-link driver signals and their effect on the connection state.

use itp_monitor::controller::{AcquisitionController, ControllerOptions, ReaderFactory};
use itp_monitor::core::{ConnectionState, DriverSignal, Endpoint, ErrorSource};
use itp_monitor::instrument::MockLinkControl;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

async fn connected() -> (AcquisitionController, Arc<MockLinkControl>, Arc<MockLinkControl>) {
    let access = Arc::new(MockLinkControl::new());
    let process = Arc::new(MockLinkControl::new());
    let controller = AcquisitionController::new(
        ReaderFactory::mock(access.clone(), process.clone(), 15),
        ControllerOptions {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
    );
    controller
        .connect(&Endpoint::new("scud", 502), &Endpoint::new("ipt", 4001))
        .await
        .unwrap();
    (controller, access, process)
}

async fn next<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within 2 s")
        .expect("channel closed")
}

#[tokio::test]
async fn test_repeated_connected_signal_is_noop() {
    let (controller, access, _) = connected().await;
    let mut states = controller.events().state_changed.stream();
    let mut errors = controller.events().error_occurred.stream();

    access.emit(DriverSignal::Connected);
    access.emit(DriverSignal::Connected);
    // Signals are handled in order; once the error shows up the two above are done.
    access.emit(DriverSignal::Error {
        code: 7,
        message: "checksum".into(),
    });

    let error = next(&mut errors).await;
    assert_eq!(error.source, ErrorSource::AccessLink);
    assert_eq!(error.code, 7);
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert!(states.try_recv().is_err());
}

#[tokio::test]
async fn test_driver_error_does_not_change_state() {
    let (controller, access, _) = connected().await;
    controller.start().await.unwrap();
    let mut errors = controller.events().error_occurred.stream();

    access.emit(DriverSignal::Error {
        code: 1001,
        message: "bus fault".into(),
    });

    let error = next(&mut errors).await;
    assert!(error.message.contains("bus fault"));
    assert_eq!(controller.state(), ConnectionState::Polling);
    controller.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_driver_disconnect_tears_session_down() {
    let (controller, access, process) = connected().await;
    controller.start().await.unwrap();
    let mut states = controller.events().state_changed.stream();

    access.emit(DriverSignal::Disconnected);

    assert_eq!(next(&mut states).await, ConnectionState::Disconnected);
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert_eq!(process.disconnects(), 1);
    assert_eq!(access.disconnects(), 1);

    let reads = process.reads();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(process.reads(), reads, "timer still armed after link drop");

    // A fresh connect works after the drop.
    controller
        .connect(&Endpoint::new("scud", 502), &Endpoint::new("ipt", 4001))
        .await
        .unwrap();
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert_eq!(access.connects(), 2);
    controller.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_signals_after_disconnect_are_ignored() {
    let (controller, access, _) = connected().await;
    controller.disconnect().await.unwrap();
    let mut states = controller.events().state_changed.stream();

    access.emit(DriverSignal::Disconnected);
    access.emit(DriverSignal::Connected);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert!(states.try_recv().is_err());
}
