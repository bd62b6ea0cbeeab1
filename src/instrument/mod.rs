//! Link readers for the two instruments.
//!
//! - [`access`]: vendor-driver boundary and the fixed-width access-link reader
//! - [`modbus`]: Modbus/TCP driver for the access link
//! - [`process`]: line-protocol reader for the process link
//! - [`mock`]: scriptable links for tests and dry runs

pub mod access;
pub mod mock;
pub mod modbus;
pub mod process;

pub use access::{AccessDriver, AccessLinkReader};
pub use mock::{MockAccessDriver, MockLinkControl, MockProcessReader};
pub use modbus::ModbusTcpDriver;
pub use process::ProcessLinkReader;
