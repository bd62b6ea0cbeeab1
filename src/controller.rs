//! Acquisition controller: connection lifecycle, polling timer and tick pipeline.
//!
//! The controller is the single owner of [`ConnectionState`]. Every change goes
//! through [`transition`], whether it was asked for by a caller (`connect`, `start`,
//! `stop`, `disconnect`) or raised by the access-link driver.
//!
//! # Tick discipline
//!
//! One background task drives polling. Ticks are scheduled on a fixed grid; a slot
//! that passes while a tick is still running is dropped and counted, never run late
//! or in parallel. The readers and the derived-quantity engine live behind one async
//! mutex that a tick holds from its first read to its last publish, so `poll_once`
//! queues behind a running tick and `disconnect` waits for it before releasing the
//! links.
//!
//! # Example
//!
//! ```no_run
//! use itp_monitor::config::Settings;
//! use itp_monitor::controller::AcquisitionController;
//!
//! # async fn demo() -> itp_monitor::error::AppResult<()> {
//! let settings = Settings::load(None)?;
//! let controller = AcquisitionController::from_settings(&settings);
//! controller.events().sample_read.subscribe(|event| println!("{:?}", event.derived));
//! controller
//!     .connect(&settings.access_endpoint(), &settings.process_endpoint())
//!     .await?;
//! controller.start().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::core::{
    AccessReader, Calibration, ConnectionState, DriverSignal, Endpoint, ErrorEvent, ErrorSource,
    LinkKind, PollEvent, ProcessReader,
};
use crate::data::{DerivedQuantityEngine, DerivedState, SampleLogger};
use crate::error::{AppResult, DaqError, Severity};
use crate::events::{EventBus, DEFAULT_CHANNEL_CAPACITY};
use crate::instrument::mock::{MockAccessDriver, MockLinkControl, MockProcessReader};
use crate::instrument::{AccessLinkReader, ModbusTcpDriver, ProcessLinkReader};
use crate::state::{transition, Transition, Trigger};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// =============================================================================
// Construction
// =============================================================================

type Build<R> = Arc<dyn Fn() -> R + Send + Sync>;

/// Builds a fresh reader pair for every `connect`.
///
/// Reader instances are single-use, so the controller never keeps one past its
/// `disconnect`.
#[derive(Clone)]
pub struct ReaderFactory {
    access: Build<AccessReader>,
    process: Build<ProcessReader>,
}

impl ReaderFactory {
    /// Factory from two reader constructors.
    pub fn new<A, P>(access: A, process: P) -> Self
    where
        A: Fn() -> AccessReader + Send + Sync + 'static,
        P: Fn() -> ProcessReader + Send + Sync + 'static,
    {
        Self {
            access: Arc::new(access),
            process: Arc::new(process),
        }
    }

    /// Modbus/TCP access link and line-protocol process link, as configured.
    pub fn from_settings(settings: &Settings) -> Self {
        let access_cfg = settings.access_link.clone();
        let process_cfg = settings.process_link.clone();
        let read_timeout = settings.read_timeout();

        Self::new(
            move || {
                let driver = ModbusTcpDriver::new(access_cfg.unit_id, access_cfg.start_register)
                    .with_connect_timeout(Duration::from_millis(access_cfg.connect_timeout_ms));
                Box::new(
                    AccessLinkReader::new(driver, access_cfg.channels).with_timeout(read_timeout),
                ) as AccessReader
            },
            move || {
                Box::new(
                    ProcessLinkReader::new(process_cfg.request.clone())
                        .with_connect_timeout(Duration::from_millis(process_cfg.connect_timeout_ms))
                        .with_read_timeout(read_timeout),
                ) as ProcessReader
            },
        )
    }

    /// Mock links driven by the given control blocks.
    pub fn mock(
        access: Arc<MockLinkControl>,
        process: Arc<MockLinkControl>,
        channels: usize,
    ) -> Self {
        Self::new(
            move || {
                Box::new(AccessLinkReader::new(
                    MockAccessDriver::new(access.clone()),
                    channels,
                )) as AccessReader
            },
            move || Box::new(MockProcessReader::new(process.clone())) as ProcessReader,
        )
    }
}

impl std::fmt::Debug for ReaderFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReaderFactory")
    }
}

/// Tunables fixed at construction; interval and calibration can change later.
#[derive(Clone, Debug)]
pub struct ControllerOptions {
    /// Time between scheduled ticks
    pub poll_interval: Duration,
    /// Upper bound on each link read within a tick
    pub read_timeout: Duration,
    /// Buffer size of each event stream
    pub channel_capacity: usize,
    /// Initial calibration tables
    pub calibration: Calibration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            read_timeout: Duration::from_millis(500),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            calibration: Settings::default().calibration(),
        }
    }
}

impl ControllerOptions {
    /// Options taken from validated settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            read_timeout: settings.read_timeout(),
            channel_capacity: settings.application.broadcast_channel_capacity,
            calibration: settings.calibration(),
        }
    }
}

/// Tick counters since construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PollMetrics {
    /// Ticks that ran, timer-driven or `poll_once`
    pub ticks: u64,
    /// Ticks that published a poll event
    pub published: u64,
    /// Ticks suppressed by a read or derivation failure
    pub failed: u64,
    /// Scheduled slots skipped because a tick was still running
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Stats {
    ticks: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

// =============================================================================
// Tick pipeline
// =============================================================================

struct Links {
    access: AccessReader,
    process: ProcessReader,
}

type SharedLinks = Arc<AsyncMutex<Option<Links>>>;

/// Everything a tick touches besides the readers.
struct Pipeline {
    events: EventBus,
    engine: Mutex<DerivedQuantityEngine>,
    calibration: RwLock<Arc<Calibration>>,
    logger: Mutex<Option<Box<dyn SampleLogger>>>,
    stats: Stats,
    read_timeout: Duration,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Pipeline {
    /// Log and publish one fault.
    fn report(&self, source: ErrorSource, err: &DaqError) {
        match err {
            DaqError::Protocol { .. } => error!(%source, "{}", err),
            _ if err.severity() == Severity::Warning => warn!(%source, "{}", err),
            _ => error!(%source, "{}", err),
        }
        self.events
            .error_occurred
            .publish(ErrorEvent::from_error(source, err));
    }

    fn calibration(&self) -> Arc<Calibration> {
        self.calibration
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Read both links, derive, publish, log. Returns the published event, if any.
    async fn tick(&self, links: &mut Links) -> Option<Arc<PollEvent>> {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let access = self.bounded_read(LinkKind::Access, links.access.read()).await;
        let process = self.bounded_read(LinkKind::Process, links.process.read()).await;

        let (access, process) = match (access, process) {
            (Some(access), Some(process)) => (access, process),
            _ => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let calibration = self.calibration();
        let derived = lock(&self.engine).update(
            &calibration.lambdas,
            &calibration.alphas,
            &access,
            &process,
        );
        let derived = match derived {
            Ok(derived) => derived,
            Err(e) => {
                self.report(ErrorSource::Engine, &e);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let event = Arc::new(PollEvent {
            timestamp: Utc::now(),
            access: Arc::new(access),
            process: Arc::new(process),
            derived,
        });
        debug!(
            j1 = derived.current1,
            j2 = derived.current2,
            r1 = derived.reactivity1,
            r2 = derived.reactivity2,
            "poll event"
        );
        self.events.sample_read.publish(event.clone());
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        let logged = lock(&self.logger)
            .as_mut()
            .map(|logger| logger.write_row(&event));
        if let Some(Err(e)) = logged {
            self.report(ErrorSource::Logger, &e);
        }

        Some(event)
    }

    async fn bounded_read<S>(
        &self,
        link: LinkKind,
        read: impl std::future::Future<Output = AppResult<S>>,
    ) -> Option<S> {
        let result = match tokio::time::timeout(self.read_timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(DaqError::Read {
                link,
                reason: format!("no response within {:?}", self.read_timeout),
            }),
        };
        match result {
            Ok(sample) => Some(sample),
            Err(e) => {
                self.report(link.into(), &e);
                None
            }
        }
    }

    fn snapshot(&self) -> PollMetrics {
        PollMetrics {
            ticks: self.stats.ticks.load(Ordering::Relaxed),
            published: self.stats.published.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Timer task body.
async fn poll_loop(
    pipeline: Arc<Pipeline>,
    links: SharedLinks,
    mut interval: watch::Receiver<Duration>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut period = *interval.borrow_and_update();
    let mut next = Instant::now() + period;
    info!(?period, "Polling started");

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep_until(next) => {}
        }

        {
            let mut guard = links.lock().await;
            match guard.as_mut() {
                Some(links) => {
                    pipeline.tick(links).await;
                }
                None => break,
            }
        }

        // A new interval applies from the next slot on.
        period = *interval.borrow_and_update();
        next += period;
        let now = Instant::now();
        while next <= now {
            pipeline.stats.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("tick slot dropped; previous tick overran");
            next += period;
        }
    }
    info!("Polling stopped");
}

struct Poller {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Poller {
    /// Disarm and wait for an in-flight tick to finish.
    async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                error!("poll task panicked: {}", e);
            }
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

#[derive(Default)]
struct Session {
    generation: u64,
    links: Option<SharedLinks>,
    poller: Option<Poller>,
    signal_task: Option<JoinHandle<()>>,
}

struct Inner {
    factory: ReaderFactory,
    pipeline: Arc<Pipeline>,
    state: Mutex<ConnectionState>,
    /// Serialises lifecycle operations
    session: AsyncMutex<Session>,
    interval: watch::Sender<Duration>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        if let Some(poller) = session.poller.take() {
            poller.handle.abort();
        }
        if let Some(task) = session.signal_task.take() {
            task.abort();
        }
    }
}

/// Owns both link readers, the derived-quantity engine and the polling timer.
///
/// Cheap to clone; clones share one controller.
#[derive(Clone)]
pub struct AcquisitionController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AcquisitionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionController")
            .field("state", &self.state())
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl AcquisitionController {
    /// Controller in `Disconnected` that builds readers with `factory`.
    pub fn new(factory: ReaderFactory, options: ControllerOptions) -> Self {
        Self::with_engine(factory, options, DerivedQuantityEngine::new())
    }

    /// Controller using a specific engine, e.g. one with a non-default reactivity model.
    pub fn with_engine(
        factory: ReaderFactory,
        options: ControllerOptions,
        engine: DerivedQuantityEngine,
    ) -> Self {
        let (interval, _) = watch::channel(options.poll_interval);
        let pipeline = Pipeline {
            events: EventBus::new(options.channel_capacity),
            engine: Mutex::new(engine),
            calibration: RwLock::new(Arc::new(options.calibration)),
            logger: Mutex::new(None),
            stats: Stats::default(),
            read_timeout: options.read_timeout,
        };
        Self {
            inner: Arc::new(Inner {
                factory,
                pipeline: Arc::new(pipeline),
                state: Mutex::new(ConnectionState::Disconnected),
                session: AsyncMutex::new(Session::default()),
                interval,
            }),
        }
    }

    /// Real links and options taken from `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            ReaderFactory::from_settings(settings),
            ControllerOptions::from_settings(settings),
        )
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// State, error and poll event channels.
    pub fn events(&self) -> &EventBus {
        &self.inner.pipeline.events
    }

    /// Tick counters since construction.
    pub fn metrics(&self) -> PollMetrics {
        self.inner.pipeline.snapshot()
    }

    /// Current baseline of the derived-quantity engine.
    pub fn derived_state(&self) -> DerivedState {
        *lock(&self.inner.pipeline.engine).state()
    }

    /// Interval used for the next scheduled tick.
    pub fn poll_interval(&self) -> Duration {
        *self.inner.interval.borrow()
    }

    /// Change the tick interval. Takes effect from the next scheduled tick.
    pub fn set_poll_interval(&self, interval: Duration) -> AppResult<()> {
        if interval.is_zero() {
            return Err(DaqError::InvalidInput(
                "poll interval must be non-zero".into(),
            ));
        }
        self.inner.interval.send_replace(interval);
        info!(?interval, "Poll interval changed");
        Ok(())
    }

    /// Change the tick rate in Hz. Takes effect from the next scheduled tick.
    pub fn set_poll_frequency(&self, hz: f64) -> AppResult<()> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(DaqError::InvalidInput(format!(
                "poll frequency {} Hz is not a positive finite number",
                hz
            )));
        }
        let interval = Duration::try_from_secs_f64(1.0 / hz)
            .map_err(|e| DaqError::InvalidInput(format!("poll frequency {} Hz: {}", hz, e)))?;
        self.set_poll_interval(interval)
    }

    /// Calibration snapshot in use.
    pub fn calibration(&self) -> Arc<Calibration> {
        self.inner.pipeline.calibration()
    }

    /// Replace the calibration tables. A running tick keeps the tables it started with.
    pub fn set_calibration(&self, calibration: Calibration) -> AppResult<()> {
        calibration.validate()?;
        *self
            .inner
            .pipeline
            .calibration
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(calibration);
        Ok(())
    }

    /// Install the row logger, flushing and dropping any previous one.
    pub fn set_logger(&self, logger: Box<dyn SampleLogger>) {
        let previous = lock(&self.inner.pipeline.logger).replace(logger);
        if let Some(mut previous) = previous {
            if let Err(e) = previous.flush() {
                self.inner.pipeline.report(ErrorSource::Logger, &e);
            }
        }
    }

    /// Detach the row logger and hand it back flushed.
    pub fn take_logger(&self) -> Option<Box<dyn SampleLogger>> {
        let mut logger = lock(&self.inner.pipeline.logger).take()?;
        if let Err(e) = logger.flush() {
            self.inner.pipeline.report(ErrorSource::Logger, &e);
        }
        Some(logger)
    }

    fn fail(&self, source: ErrorSource, err: DaqError) -> DaqError {
        self.inner.pipeline.report(source, &err);
        err
    }

    /// Connect the process link, then the access link, and become `Connected` only if
    /// both succeed.
    ///
    /// If exactly one link comes up it is released again and
    /// [`DaqError::PartialConnection`] is returned; the state stays `Disconnected`.
    pub async fn connect(&self, access: &Endpoint, process: &Endpoint) -> AppResult<()> {
        let mut session = self.inner.session.lock().await;

        let state = self.state();
        if transition(state, Trigger::LinksUp) == Transition::Rejected {
            warn!("Connect requested while {}", state);
            return Err(self.fail(
                ErrorSource::Controller,
                DaqError::InvalidState {
                    operation: Trigger::LinksUp.operation(),
                    state,
                },
            ));
        }
        if access == process {
            return Err(self.fail(
                ErrorSource::Controller,
                DaqError::InvalidInput(format!("both links point at {}", access)),
            ));
        }

        let mut process_reader = (self.inner.factory.process)();
        let mut access_reader = (self.inner.factory.access)();
        // Subscribe first so a drop right after connect is not missed.
        let signals = access_reader.signals();

        info!("Connecting {} at {} and {} at {}", LinkKind::Process, process, LinkKind::Access, access);
        let process_result = process_reader.connect(process).await;
        let access_result = access_reader.connect(access).await;

        let failure = match (process_result, access_result) {
            (Ok(()), Ok(())) => None,
            (Ok(()), Err(e)) => {
                rollback(process_reader.as_mut()).await;
                Some(DaqError::PartialConnection {
                    connected: LinkKind::Process,
                    failed: LinkKind::Access,
                    reason: e.to_string(),
                })
            }
            (Err(e), Ok(())) => {
                rollback(access_reader.as_mut()).await;
                Some(DaqError::PartialConnection {
                    connected: LinkKind::Access,
                    failed: LinkKind::Process,
                    reason: e.to_string(),
                })
            }
            (Err(e), Err(other)) => {
                self.inner.pipeline.report(ErrorSource::AccessLink, &other);
                Some(e)
            }
        };
        if let Some(err) = failure {
            return Err(self.fail(ErrorSource::Controller, err));
        }

        lock(&self.inner.pipeline.engine).reset();
        session.generation += 1;
        session.links = Some(Arc::new(AsyncMutex::new(Some(Links {
            access: access_reader,
            process: process_reader,
        }))));
        if let Some(signals) = signals {
            session.signal_task = Some(tokio::spawn(watch_driver(
                Arc::downgrade(&self.inner),
                session.generation,
                signals,
            )));
        }

        self.inner.fire(Trigger::LinksUp)?;
        Ok(())
    }

    /// Arm the timer. Only allowed while `Connected`.
    pub async fn start(&self) -> AppResult<()> {
        let mut session = self.inner.session.lock().await;

        let state = self.state();
        let links = match (transition(state, Trigger::Start), session.links.clone()) {
            (Transition::To(_), Some(links)) => links,
            _ => {
                warn!("Cannot start polling: not connected ({})", state);
                return Err(self.fail(
                    ErrorSource::Controller,
                    DaqError::InvalidState {
                        operation: Trigger::Start.operation(),
                        state,
                    },
                ));
            }
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(poll_loop(
            self.inner.pipeline.clone(),
            links,
            self.inner.interval.subscribe(),
            shutdown_rx,
        ));
        session.poller = Some(Poller { shutdown, handle });

        self.inner.fire(Trigger::Start)?;
        Ok(())
    }

    /// Disarm the timer, waiting for a running tick. Idempotent.
    pub async fn stop(&self) -> AppResult<()> {
        let mut session = self.inner.session.lock().await;
        if let Some(poller) = session.poller.take() {
            poller.stop().await;
        }
        self.inner.fire(Trigger::Stop)?;
        Ok(())
    }

    /// Run one tick now, outside the timer. Queues behind a running tick.
    pub async fn poll_once(&self) -> AppResult<Option<Arc<PollEvent>>> {
        let links = {
            let session = self.inner.session.lock().await;
            session.links.clone()
        };
        let not_connected = || DaqError::InvalidState {
            operation: "poll",
            state: self.state(),
        };

        let links = links.ok_or_else(not_connected)?;
        let mut guard = links.lock().await;
        let links = guard.as_mut().ok_or_else(not_connected)?;
        Ok(self.inner.pipeline.tick(links).await)
    }

    /// Stop polling, release both links (access first) and become `Disconnected`.
    ///
    /// Waits for an in-flight tick before touching the readers. Release failures are
    /// published and returned together; the state is `Disconnected` either way.
    pub async fn disconnect(&self) -> AppResult<()> {
        let mut session = self.inner.session.lock().await;

        if let Some(task) = session.signal_task.take() {
            task.abort();
        }
        if let Some(poller) = session.poller.take() {
            poller.stop().await;
        }
        let errors = match session.links.take() {
            Some(links) => match links.lock().await.take() {
                Some(links) => release(links).await,
                None => Vec::new(),
            },
            None => Vec::new(),
        };

        self.inner.fire(Trigger::Disconnect)?;

        if errors.is_empty() {
            Ok(())
        } else {
            for err in &errors {
                self.inner.pipeline.report(ErrorSource::Controller, err);
            }
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

impl Inner {
    /// Apply `trigger` through the transition table and announce any change.
    fn fire(&self, trigger: Trigger) -> AppResult<ConnectionState> {
        let (from, to) = {
            let mut state = lock(&self.state);
            let from = *state;
            match transition(from, trigger) {
                Transition::Rejected => {
                    return Err(DaqError::InvalidState {
                        operation: trigger.operation(),
                        state: from,
                    })
                }
                Transition::To(to) => {
                    *state = to;
                    (from, to)
                }
            }
        };
        if from != to {
            info!(%from, %to, %trigger, "Connection state changed");
            self.pipeline.events.state_changed.publish(to);
        }
        Ok(to)
    }

    /// Access-link driver dropped its transport: tear the session down.
    async fn on_link_down(self: &Arc<Self>, generation: u64) {
        let mut session = self.session.lock().await;
        if session.generation != generation || session.links.is_none() {
            return;
        }
        warn!("{} reported disconnect; tearing session down", LinkKind::Access);

        // Running inside this task; dropping the handle detaches it.
        session.signal_task.take();
        if let Some(poller) = session.poller.take() {
            poller.stop().await;
        }
        if let Some(links) = session.links.take() {
            if let Some(links) = links.lock().await.take() {
                for err in release(links).await {
                    self.pipeline.report(ErrorSource::Controller, &err);
                }
            }
        }

        // LinkDown is accepted from every state.
        let _ = self.fire(Trigger::LinkDown);
    }
}

/// Follow the access-link driver's signal stream for one session.
async fn watch_driver(
    inner: Weak<Inner>,
    generation: u64,
    mut signals: broadcast::Receiver<DriverSignal>,
) {
    loop {
        let signal = match signals.recv().await {
            Ok(signal) => signal,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("missed {} driver signals", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match signal {
            DriverSignal::Connected => {
                // Never gates Connected on its own.
                let _ = inner.fire(Trigger::LinkUp);
                debug!("{} driver reports link up", LinkKind::Access);
            }
            DriverSignal::Disconnected => {
                inner.on_link_down(generation).await;
                return;
            }
            DriverSignal::Error { code, message } => {
                inner
                    .pipeline
                    .report(ErrorSource::AccessLink, &DaqError::Driver { code, message });
            }
        }
    }
}

async fn rollback<R: crate::core::LinkReader + ?Sized>(reader: &mut R) {
    if let Err(e) = reader.disconnect().await {
        warn!("rollback of {} failed: {}", reader.kind(), e);
    }
}

/// Disconnect in reverse connection order, collecting failures.
async fn release(mut links: Links) -> Vec<DaqError> {
    let mut errors = Vec::new();
    if let Err(e) = links.access.disconnect().await {
        errors.push(e);
    }
    if let Err(e) = links.process.disconnect().await {
        errors.push(e);
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> (AcquisitionController, Arc<MockLinkControl>, Arc<MockLinkControl>) {
        let access = Arc::new(MockLinkControl::new());
        let process = Arc::new(MockLinkControl::new());
        let controller = AcquisitionController::new(
            ReaderFactory::mock(access.clone(), process.clone(), 15),
            ControllerOptions {
                poll_interval: Duration::from_millis(100),
                calibration: Calibration::new(vec![1.0], vec![1.0]).unwrap(),
                ..Default::default()
            },
        );
        (controller, access, process)
    }

    fn endpoints() -> (Endpoint, Endpoint) {
        (Endpoint::new("10.0.0.1", 502), Endpoint::new("10.0.0.2", 4001))
    }

    #[tokio::test]
    async fn test_same_endpoint_rejected() {
        let (controller, access, _) = controller();
        let endpoint = Endpoint::new("10.0.0.1", 502);

        let err = controller.connect(&endpoint, &endpoint).await.unwrap_err();
        assert!(matches!(err, DaqError::InvalidInput(_)));
        assert_eq!(access.connects(), 0);
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let (controller, access, _) = controller();
        let (a, p) = endpoints();
        controller.connect(&a, &p).await.unwrap();

        let err = controller.connect(&a, &p).await.unwrap_err();
        assert!(matches!(err, DaqError::InvalidState { .. }));
        assert_eq!(access.connects(), 1);
    }

    #[tokio::test]
    async fn test_both_links_fail() {
        let (controller, access, process) = controller();
        access.fail_connect("unreachable");
        process.fail_connect("unreachable");
        let (a, p) = endpoints();

        let err = controller.connect(&a, &p).await.unwrap_err();
        assert!(matches!(err, DaqError::Connection { link: LinkKind::Process, .. }));
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_poll_once_requires_connection() {
        let (controller, _, _) = controller();
        assert!(matches!(
            controller.poll_once().await,
            Err(DaqError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_poll_frequency_validation() {
        let (controller, _, _) = controller();
        assert!(controller.set_poll_frequency(0.0).is_err());
        assert!(controller.set_poll_frequency(f64::NAN).is_err());
        assert!(controller.set_poll_interval(Duration::ZERO).is_err());

        controller.set_poll_frequency(20.0).unwrap();
        assert_eq!(controller.poll_interval(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_bad_calibration_keeps_previous() {
        let (controller, _, _) = controller();
        let bad = Calibration {
            lambdas: vec![1.0, 2.0],
            alphas: vec![1.0],
        };
        assert!(controller.set_calibration(bad).is_err());
        assert_eq!(controller.calibration().lambdas, vec![1.0]);
    }

    #[tokio::test]
    async fn test_disconnect_when_disconnected_is_ok() {
        let (controller, _, _) = controller();
        controller.disconnect().await.unwrap();
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }
}
