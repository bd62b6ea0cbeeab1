//! Scriptable in-memory links for tests and dry runs.
//!
//! A [`MockLinkControl`] is shared between a mock reader and the test driving it. It
//! decides what the next read returns, how long it takes and whether it fails, and it
//! counts every call so tests can assert on the controller's I/O discipline (one read
//! in flight, no read after release, one release per connect).
use crate::core::{DriverSignal, Endpoint, LinkKind, LinkReader, ProcessSample};
use crate::error::{AppResult, DaqError};
use crate::instrument::access::{AccessDriver, Phase};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug)]
struct Script {
    channels: Vec<f64>,
    currents: (f64, f64),
    delays: VecDeque<Duration>,
    fail_connect: Option<String>,
    failing_reads: usize,
}

/// Shared knobs and counters behind a mock link.
#[derive(Debug)]
pub struct MockLinkControl {
    script: Mutex<Script>,
    signals: broadcast::Sender<DriverSignal>,
    connected: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    reads: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    reads_after_disconnect: AtomicUsize,
    disconnect_during_read: AtomicUsize,
}

impl Default for MockLinkControl {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLinkControl {
    /// 15 zero channels, currents of 1.0, no delays, no failures.
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            script: Mutex::new(Script {
                channels: vec![0.0; 15],
                currents: (1.0, 1.0),
                delays: VecDeque::new(),
                fail_connect: None,
                failing_reads: 0,
            }),
            signals,
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            reads_after_disconnect: AtomicUsize::new(0),
            disconnect_during_read: AtomicUsize::new(0),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Values returned by subsequent access reads.
    pub fn set_channels(&self, channels: Vec<f64>) {
        self.script().channels = channels;
    }

    /// Currents returned by subsequent process reads.
    pub fn set_currents(&self, current1: f64, current2: f64) {
        self.script().currents = (current1, current2);
    }

    /// Delay applied to the next read that has not consumed one yet.
    pub fn push_delay(&self, delay: Duration) {
        self.script().delays.push_back(delay);
    }

    /// Make every following `connect` fail with `reason`.
    pub fn fail_connect(&self, reason: impl Into<String>) {
        self.script().fail_connect = Some(reason.into());
    }

    /// Make the next `count` reads fail with a read error.
    pub fn fail_next_reads(&self, count: usize) {
        self.script().failing_reads = count;
    }

    /// Raise a driver signal as the vendor driver would.
    pub fn emit(&self, signal: DriverSignal) {
        let _ = self.signals.send(signal);
    }

    /// Whether the link is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connect attempts, successful or not.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Releases of an open link.
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Reads started.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Highest number of reads observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Reads attempted on a released link.
    pub fn reads_after_disconnect(&self) -> usize {
        self.reads_after_disconnect.load(Ordering::SeqCst)
    }

    /// Releases that happened while a read was in flight.
    pub fn disconnect_during_read(&self) -> usize {
        self.disconnect_during_read.load(Ordering::SeqCst)
    }

    fn on_connect(&self, link: LinkKind, endpoint: &Endpoint) -> AppResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.script().fail_connect.clone() {
            return Err(DaqError::Connection {
                link,
                endpoint: endpoint.to_string(),
                reason,
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            self.disconnect_during_read.fetch_add(1, Ordering::SeqCst);
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Runs the scripted part of a read: bookkeeping, delay, injected failure.
    async fn scripted_read(&self, link: LinkKind) -> AppResult<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            self.reads_after_disconnect.fetch_add(1, Ordering::SeqCst);
            return Err(DaqError::Read {
                link,
                reason: "mock link is not connected".into(),
            });
        }

        let _guard = InFlight::enter(self);
        let delay = self.script().delays.pop_front();
        if let Some(delay) = delay {
            debug!(?delay, "mock read delayed");
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script();
        if script.failing_reads > 0 {
            script.failing_reads -= 1;
            return Err(DaqError::Read {
                link,
                reason: "injected read failure".into(),
            });
        }
        Ok(())
    }
}

/// Tracks reads in progress, including ones cancelled by a timeout.
struct InFlight<'a>(&'a MockLinkControl);

impl<'a> InFlight<'a> {
    fn enter(control: &'a MockLinkControl) -> Self {
        let now = control.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        control.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(control)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Access-link driver backed by a [`MockLinkControl`].
pub struct MockAccessDriver {
    control: Arc<MockLinkControl>,
}

impl MockAccessDriver {
    /// Driver scripted by `control`.
    pub fn new(control: Arc<MockLinkControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl AccessDriver for MockAccessDriver {
    async fn connect(&mut self, endpoint: &Endpoint) -> AppResult<()> {
        self.control.on_connect(LinkKind::Access, endpoint)?;
        self.control.emit(DriverSignal::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.control.on_disconnect();
        self.control.emit(DriverSignal::Disconnected);
        Ok(())
    }

    async fn read_raw(&mut self, _count: usize) -> AppResult<Vec<f32>> {
        self.control.scripted_read(LinkKind::Access).await?;
        Ok(self
            .control
            .script()
            .channels
            .iter()
            .map(|v| *v as f32)
            .collect())
    }

    fn signals(&self) -> broadcast::Receiver<DriverSignal> {
        self.control.signals.subscribe()
    }
}

/// Process-link reader backed by a [`MockLinkControl`].
pub struct MockProcessReader {
    control: Arc<MockLinkControl>,
    phase: Phase,
}

impl MockProcessReader {
    /// Reader scripted by `control`.
    pub fn new(control: Arc<MockLinkControl>) -> Self {
        Self {
            control,
            phase: Phase::Fresh,
        }
    }
}

#[async_trait]
impl LinkReader for MockProcessReader {
    type Sample = ProcessSample;

    fn kind(&self) -> LinkKind {
        LinkKind::Process
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> AppResult<()> {
        if self.phase != Phase::Fresh {
            return Err(DaqError::Connection {
                link: LinkKind::Process,
                endpoint: endpoint.to_string(),
                reason: "reader instance already used; build a new one".into(),
            });
        }
        self.control.on_connect(LinkKind::Process, endpoint)?;
        self.phase = Phase::Open;
        Ok(())
    }

    async fn read(&mut self) -> AppResult<ProcessSample> {
        self.control.scripted_read(LinkKind::Process).await?;
        let (current1, current2) = self.control.script().currents;
        Ok(ProcessSample::new(Utc::now(), current1, current2))
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        if self.phase == Phase::Open {
            self.phase = Phase::Closed;
            self.control.on_disconnect();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("mock", 0)
    }

    #[tokio::test]
    async fn test_failed_connect_is_counted() {
        let control = Arc::new(MockLinkControl::new());
        control.fail_connect("refused");
        let mut reader = MockProcessReader::new(control.clone());

        assert!(reader.connect(&endpoint()).await.is_err());
        assert_eq!(control.connects(), 1);
        assert!(!control.is_connected());
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let control = Arc::new(MockLinkControl::new());
        control.set_currents(2.0, 3.0);
        control.fail_next_reads(1);
        let mut reader = MockProcessReader::new(control.clone());
        reader.connect(&endpoint()).await.unwrap();

        assert!(reader.read().await.is_err());
        let sample = reader.read().await.unwrap();
        assert_eq!((sample.current1, sample.current2), (2.0, 3.0));
        assert_eq!(control.reads(), 2);
    }

    #[tokio::test]
    async fn test_read_after_release_is_recorded() {
        let control = Arc::new(MockLinkControl::new());
        let mut reader = MockProcessReader::new(control.clone());
        reader.connect(&endpoint()).await.unwrap();
        reader.disconnect().await.unwrap();

        assert!(reader.read().await.is_err());
        assert_eq!(control.reads_after_disconnect(), 1);
    }

    #[tokio::test]
    async fn test_driver_signals_follow_transport() {
        let control = Arc::new(MockLinkControl::new());
        let mut driver = MockAccessDriver::new(control.clone());
        let mut signals = driver.signals();

        driver.connect(&endpoint()).await.unwrap();
        driver.disconnect().await.unwrap();
        assert_eq!(signals.recv().await.unwrap(), DriverSignal::Connected);
        assert_eq!(signals.recv().await.unwrap(), DriverSignal::Disconnected);
    }
}
