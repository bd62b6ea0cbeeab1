//! Timing properties of the polling loop, on tokio's paused clock.

use itp_monitor::controller::{AcquisitionController, ControllerOptions, ReaderFactory};
use itp_monitor::core::{Calibration, ConnectionState, Endpoint};
use itp_monitor::instrument::MockLinkControl;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const INTERVAL: Duration = Duration::from_millis(100);

async fn connected() -> (AcquisitionController, Arc<MockLinkControl>, Arc<MockLinkControl>) {
    let access = Arc::new(MockLinkControl::new());
    let process = Arc::new(MockLinkControl::new());
    let controller = AcquisitionController::new(
        ReaderFactory::mock(access.clone(), process.clone(), 15),
        ControllerOptions {
            poll_interval: INTERVAL,
            calibration: Calibration::new(vec![1.0], vec![1.0]).unwrap(),
            ..Default::default()
        },
    );
    controller
        .connect(&Endpoint::new("scud", 502), &Endpoint::new("ipt", 4001))
        .await
        .unwrap();
    (controller, access, process)
}

#[tokio::test(start_paused = true)]
async fn test_ticks_follow_interval() {
    let (controller, _, _) = connected().await;
    controller.start().await.unwrap();

    sleep(Duration::from_millis(550)).await;
    let metrics = controller.metrics();
    assert_eq!(metrics.ticks, 5);
    assert_eq!(metrics.published, 5);
    assert_eq!(metrics.dropped, 0);

    controller.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stalled_read_drops_exactly_one_tick() {
    let (controller, access, _) = connected().await;
    access.push_delay(Duration::from_millis(150));
    controller.start().await.unwrap();

    // Tick at 100 ms overruns to 250 ms; the 200 ms slot is skipped, 300 ms runs.
    sleep(Duration::from_millis(350)).await;
    let metrics = controller.metrics();
    assert_eq!(metrics.ticks, 2);
    assert_eq!(metrics.dropped, 1);
    assert_eq!(access.max_in_flight(), 1);

    controller.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_waits_for_in_flight_read() {
    let (controller, access, process) = connected().await;
    process.push_delay(Duration::from_millis(300));
    controller.start().await.unwrap();

    // Tick started at 100 ms and is blocked in the process read until 400 ms.
    sleep(Duration::from_millis(150)).await;
    let began = Instant::now();
    controller.disconnect().await.unwrap();

    assert!(began.elapsed() >= Duration::from_millis(250));
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert_eq!(process.disconnect_during_read(), 0);
    assert_eq!(access.disconnect_during_read(), 0);
    assert_eq!(controller.metrics().published, 1);

    let reads = access.reads() + process.reads();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(access.reads() + process.reads(), reads);
    assert_eq!(access.reads_after_disconnect(), 0);
    assert_eq!(process.reads_after_disconnect(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_tick() {
    let (controller, access, _) = connected().await;
    access.push_delay(Duration::from_millis(200));
    controller.start().await.unwrap();

    sleep(Duration::from_millis(150)).await;
    let began = Instant::now();
    controller.stop().await.unwrap();

    assert!(began.elapsed() >= Duration::from_millis(150));
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert_eq!(controller.metrics().published, 1);

    sleep(Duration::from_millis(500)).await;
    assert_eq!(controller.metrics().ticks, 1);
}

#[tokio::test(start_paused = true)]
async fn test_interval_change_applies_from_next_slot() {
    let (controller, _, _) = connected().await;
    controller.start().await.unwrap();

    sleep(Duration::from_millis(150)).await;
    controller.set_poll_interval(Duration::from_secs(1)).unwrap();

    // The 200 ms slot was already scheduled; the following one moves to 1200 ms.
    sleep(Duration::from_millis(1000)).await;
    assert_eq!(controller.metrics().ticks, 2);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.metrics().ticks, 3);

    controller.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_manual_poll_queues_behind_timer_tick() {
    let (controller, access, _) = connected().await;
    access.push_delay(Duration::from_millis(150));
    controller.start().await.unwrap();

    sleep(Duration::from_millis(120)).await;
    let event = controller.poll_once().await.unwrap();

    assert!(event.is_some());
    assert_eq!(access.max_in_flight(), 1);
    controller.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_read_timeout_keeps_cadence() {
    let (controller, access, _) = connected().await;
    // Far beyond the 500 ms read bound.
    access.push_delay(Duration::from_secs(30));
    controller.start().await.unwrap();

    sleep(Duration::from_millis(1050)).await;
    let metrics = controller.metrics();
    assert_eq!(metrics.failed, 1);
    assert!(metrics.published >= 4, "{metrics:?}");
    assert_eq!(controller.state(), ConnectionState::Polling);

    controller.disconnect().await.unwrap();
}
