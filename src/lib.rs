//! Core library for the ITP monitor.
//!
//! This library polls two instrument links, the SCUD access/interlock controller and
//! the IPT process-instrumentation transmitter, pairs their samples, derives currents
//! and reactivity estimates and publishes the result to subscribers. It is used by the
//! `itp-monitor` binary and by the integration tests.

pub mod config;
pub mod controller;
pub mod core;
pub mod data;
pub mod emulator;
pub mod error;
pub mod events;
pub mod instrument;
pub mod state;

pub use controller::{AcquisitionController, ControllerOptions, PollMetrics, ReaderFactory};
pub use error::{AppResult, DaqError};
