//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur while talking to the two instrument links, deriving
//! physical quantities and persisting rows.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: transport or handshake failure while connecting one link. Fatal to
//!   that connect attempt; the controller stays `Disconnected`.
//! - **`PartialConnection`**: exactly one of the two links came up. The one that succeeded
//!   has already been released when this error is returned.
//! - **`Read`**: transient per-tick failure (timeout, I/O). Polling continues.
//! - **`Protocol`**: malformed response. Continues like `Read` but is logged louder.
//! - **`InvalidState`**: an operation was requested in a state that does not allow it.
//! - **`InvalidInput`**: a non-finite value reached the derived-quantity engine, or a
//!   caller supplied an unusable setting.
//! - **`Driver`**: error signal raised by the access-link driver, with its native code.
//! - **`Storage`**: the row logger failed.
//! - **`Config`** / **`Io`**: configuration loading and plain I/O.
//!
//! Every error carries a stable numeric [`DaqError::code`] and a [`Severity`] so it can be
//! surfaced on the error channel as an [`ErrorEvent`](crate::core::ErrorEvent).

use crate::config::ConfigError;
use crate::core::{ConnectionState, LinkKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the monitor reports, from a single link read up to shutdown.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings failed to load or validate.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Local I/O outside the links, such as opening the log file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A link could not be opened.
    #[error("Failed to connect {link} at {endpoint}: {reason}")]
    Connection {
        /// Link that failed.
        link: LinkKind,
        /// Address that was dialled.
        endpoint: String,
        /// Transport or handshake detail.
        reason: String,
    },

    /// Only one of the two links came up and was released again.
    #[error("Only the {connected} connected ({failed} failed: {reason}); connection rolled back")]
    PartialConnection {
        /// Link that connected and was rolled back.
        connected: LinkKind,
        /// Link that failed to connect.
        failed: LinkKind,
        /// Why the failing link did not come up.
        reason: String,
    },

    /// A read timed out or the transport failed mid-read.
    #[error("Read from {link} failed: {reason}")]
    Read {
        /// Link being read.
        link: LinkKind,
        /// Timeout or transport detail.
        reason: String,
    },

    /// The peer answered with something malformed or an explicit fault.
    #[error("Protocol error on {link}: {reason}")]
    Protocol {
        /// Link that produced the response.
        link: LinkKind,
        /// What was wrong with it.
        reason: String,
    },

    /// The operation is not allowed in the current connection state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State at the time of the attempt.
        state: ConnectionState,
    },

    /// A caller-supplied value was rejected.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Fault raised asynchronously by the access-link driver.
    #[error("Driver error {code}: {message}")]
    Driver {
        /// Vendor error code.
        code: i32,
        /// Vendor message.
        message: String,
    },

    /// The row logger could not write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// One or more links failed to release.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

/// How loudly an error is reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Transient; the next tick is expected to recover.
    Warning,
    /// Needs operator attention.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

impl DaqError {
    /// Stable numeric code reported on the error channel.
    ///
    /// Driver errors keep the vendor's own code.
    pub fn code(&self) -> i32 {
        match self {
            DaqError::Config(_) => 10,
            DaqError::Io(_) => 11,
            DaqError::Connection { .. } => 20,
            DaqError::PartialConnection { .. } => 21,
            DaqError::Read { .. } => 30,
            DaqError::Protocol { .. } => 31,
            DaqError::InvalidState { .. } => 40,
            DaqError::InvalidInput(_) => 41,
            DaqError::Storage(_) => 50,
            DaqError::ShutdownFailed(_) => 60,
            DaqError::Driver { code, .. } => *code,
        }
    }

    /// How serious the error is for an operator.
    pub fn severity(&self) -> Severity {
        match self {
            DaqError::Read { .. } | DaqError::InvalidState { .. } | DaqError::InvalidInput(_) => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }

    /// True for failures after which polling simply continues with the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaqError::Read { .. } | DaqError::Protocol { .. } | DaqError::InvalidInput(_)
        )
    }
}
