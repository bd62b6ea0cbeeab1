//! Core traits and data types for the monitor.
//!
//! This module defines the foundational abstractions shared by the links, the
//! derived-quantity engine and the acquisition controller.
//!
//! # Data Flow
//!
//! ```text
//! AccessLinkReader --[AccessSample]--\
//!                                     +--> DerivedQuantityEngine --> PollEvent --> EventBus
//! ProcessLinkReader --[ProcessSample]-/                                             |
//!                                                                                    v
//!                                                                     SampleLogger / display
//! ```
//!
//! # Thread Safety
//!
//! Samples are immutable once built and travel inside `Arc`s, so one poll event can be
//! handed to any number of subscribers without copying channel data.

use crate::error::{AppResult, DaqError, Severity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

// =============================================================================
// Connection state
// =============================================================================

/// Lifecycle state of the acquisition controller.
///
/// `Polling` implies the controller was `Connected` when polling started; stopping
/// polling returns to `Connected`, never straight to `Disconnected`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link is held.
    #[default]
    Disconnected,
    /// Both links are up and the timer is disarmed.
    Connected,
    /// Both links are up and the timer is armed.
    Polling,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Polling => write!(f, "polling"),
        }
    }
}

/// Which of the two instrument links something refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkKind {
    /// Access/interlock controller (SCUD).
    Access,
    /// Process-instrumentation transmitter (IPT).
    Process,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Access => write!(f, "access link (SCUD)"),
            LinkKind::Process => write!(f, "process link (IPT)"),
        }
    }
}

/// Network address of one instrument.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Endpoint at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// =============================================================================
// Samples
// =============================================================================

/// One snapshot of the access-link channels (temperatures, pressures, flux, offset...).
///
/// Channel meaning is configuration; the core only knows the fixed width.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessSample {
    /// UTC timestamp when the snapshot was received
    pub captured_at: DateTime<Utc>,
    channels: Vec<f64>,
}

impl AccessSample {
    /// Snapshot of `channels` captured at `captured_at`.
    pub fn new(captured_at: DateTime<Utc>, channels: Vec<f64>) -> Self {
        Self {
            captured_at,
            channels,
        }
    }

    /// Channel values in register order.
    pub fn channels(&self) -> &[f64] {
        &self.channels
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when the snapshot carries no channels.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Name of the first calibrated current field in a process-link record.
pub const CURRENT1_FIELD: &str = "FCurrent1";
/// Name of the second calibrated current field in a process-link record.
pub const CURRENT2_FIELD: &str = "FCurrent2";

/// A structured process-link record.
///
/// The two calibrated currents are always present; every other field the transmitter
/// reports is kept by name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    /// UTC timestamp when the record was received
    pub captured_at: DateTime<Utc>,
    /// First calibrated current channel (`FCurrent1`)
    pub current1: f64,
    /// Second calibrated current channel (`FCurrent2`)
    pub current2: f64,
    /// Remaining named fields
    pub fields: BTreeMap<String, f64>,
}

impl ProcessSample {
    /// Record with the two mandatory currents and no other fields.
    pub fn new(captured_at: DateTime<Utc>, current1: f64, current2: f64) -> Self {
        Self {
            captured_at,
            current1,
            current2,
            fields: BTreeMap::new(),
        }
    }

    /// Add an auxiliary field.
    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Looks a field up by its wire name, currents included.
    pub fn field(&self, name: &str) -> Option<f64> {
        match name {
            CURRENT1_FIELD => Some(self.current1),
            CURRENT2_FIELD => Some(self.current2),
            _ => self.fields.get(name).copied(),
        }
    }
}

/// Multi-line human-readable rendering, one `name = value` per line.
impl fmt::Display for ProcessSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} = {:.7e}", CURRENT1_FIELD, self.current1)?;
        write!(f, "{} = {:.7e}", CURRENT2_FIELD, self.current2)?;
        for (name, value) in &self.fields {
            write!(f, "\n{} = {:.7e}", name, value)?;
        }
        Ok(())
    }
}

// =============================================================================
// Calibration and derived values
// =============================================================================

/// Decay constants (`lambdas`, 1/s) and their weights (`alphas`) used by the
/// reactivity estimate. Read-only to the core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Decay constants, 1/s.
    pub lambdas: Vec<f64>,
    /// Weight of each decay constant.
    pub alphas: Vec<f64>,
}

impl Calibration {
    /// Validated tables; rejects empty, mismatched or non-finite input.
    pub fn new(lambdas: Vec<f64>, alphas: Vec<f64>) -> AppResult<Self> {
        let calibration = Self { lambdas, alphas };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Checks the tables are usable: same non-zero length, finite, positive decay constants.
    pub fn validate(&self) -> AppResult<()> {
        validate_tables(&self.lambdas, &self.alphas)
    }
}

/// Validation shared by [`Calibration`] and the derived-quantity engine.
pub fn validate_tables(lambdas: &[f64], alphas: &[f64]) -> AppResult<()> {
    if lambdas.is_empty() {
        return Err(DaqError::InvalidInput(
            "calibration tables must not be empty".into(),
        ));
    }
    if lambdas.len() != alphas.len() {
        return Err(DaqError::InvalidInput(format!(
            "calibration tables differ in length: {} lambdas, {} alphas",
            lambdas.len(),
            alphas.len()
        )));
    }
    if let Some(bad) = lambdas.iter().find(|l| !l.is_finite() || **l <= 0.0) {
        return Err(DaqError::InvalidInput(format!(
            "decay constant {} is not a positive finite number",
            bad
        )));
    }
    if let Some(bad) = alphas.iter().find(|a| !a.is_finite()) {
        return Err(DaqError::InvalidInput(format!("weight {} is not finite", bad)));
    }
    Ok(())
}

/// Output of one derivation step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedSnapshot {
    /// New value of the first current (J1)
    pub current1: f64,
    /// New value of the second current (J2)
    pub current2: f64,
    /// Reactivity estimated from the first current (R1)
    pub reactivity1: f64,
    /// Reactivity estimated from the second current (R2)
    pub reactivity2: f64,
}

/// Immutable envelope delivered once per successful poll tick.
#[derive(Clone, Debug, PartialEq)]
pub struct PollEvent {
    /// When the tick completed.
    pub timestamp: DateTime<Utc>,
    /// Access-link snapshot read this tick.
    pub access: Arc<AccessSample>,
    /// Process-link record read this tick.
    pub process: Arc<ProcessSample>,
    /// Quantities derived from the two samples.
    pub derived: DerivedSnapshot,
}

// =============================================================================
// Errors on the notification fabric
// =============================================================================

/// Component an [`ErrorEvent`] originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSource {
    /// Access link reader or its driver
    AccessLink,
    /// Process link reader
    ProcessLink,
    /// Derived-quantity engine
    Engine,
    /// Row logger
    Logger,
    /// Controller itself (connect/disconnect bookkeeping)
    Controller,
}

impl From<LinkKind> for ErrorSource {
    fn from(link: LinkKind) -> Self {
        match link {
            LinkKind::Access => ErrorSource::AccessLink,
            LinkKind::Process => ErrorSource::ProcessLink,
        }
    }
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorSource::AccessLink => "SCUD",
            ErrorSource::ProcessLink => "IPT",
            ErrorSource::Engine => "engine",
            ErrorSource::Logger => "logger",
            ErrorSource::Controller => "controller",
        };
        f.write_str(name)
    }
}

/// A timestamped, human-readable fault report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// When the error was reported.
    pub timestamp: DateTime<Utc>,
    /// Stable numeric code, see [`DaqError::code`].
    pub code: i32,
    /// Human-readable description.
    pub message: String,
    /// Component that raised it.
    pub source: ErrorSource,
    /// How serious it is.
    pub severity: Severity,
}

impl ErrorEvent {
    /// Timestamped event for `err`, raised by `source`.
    pub fn from_error(source: ErrorSource, err: &DaqError) -> Self {
        Self {
            timestamp: Utc::now(),
            code: err.code(),
            message: err.to_string(),
            source,
            severity: err.severity(),
        }
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t[{}] error code {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.source,
            self.code,
            self.message
        )
    }
}

// =============================================================================
// Link readers
// =============================================================================

/// Asynchronous notification raised by a link's low-level driver.
///
/// These may fire at any time, not necessarily in step with `connect`/`disconnect`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverSignal {
    /// Transport came up
    Connected,
    /// Transport went away
    Disconnected,
    /// Driver-level fault with the vendor's code
    Error {
        /// Vendor error code.
        code: i32,
        /// Vendor message.
        message: String,
    },
}

/// One point-to-point instrument connection.
///
/// An instance represents exactly one connection attempt: after `disconnect` it is
/// discarded and a fresh one is built for the next `connect`. `read` either returns a
/// fully valid sample or fails; it never hands back stale or partial data.
#[async_trait]
pub trait LinkReader: Send {
    /// Sample type produced by `read`.
    type Sample: Send + Sync + 'static;

    /// Which link this reader serves.
    fn kind(&self) -> LinkKind;

    /// Establish the transport. Fails with [`DaqError::Connection`].
    async fn connect(&mut self, endpoint: &Endpoint) -> AppResult<()>;

    /// One request/response exchange. Fails with [`DaqError::Read`] or
    /// [`DaqError::Protocol`].
    async fn read(&mut self) -> AppResult<Self::Sample>;

    /// Release the transport.
    async fn disconnect(&mut self) -> AppResult<()>;

    /// Driver signal stream, for links whose driver reports its own state.
    fn signals(&self) -> Option<broadcast::Receiver<DriverSignal>> {
        None
    }
}

/// Boxed access-link reader.
pub type AccessReader = Box<dyn LinkReader<Sample = AccessSample>>;
/// Boxed process-link reader.
pub type ProcessReader = Box<dyn LinkReader<Sample = ProcessSample>>;
