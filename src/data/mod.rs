//! Data handling downstream of the links: derivation and persistence.

pub mod reactivity;
pub mod storage;

pub use reactivity::{DerivedQuantityEngine, DerivedState, InhourModel, ReactivityModel};
pub use storage::{CsvLogWriter, SampleLogger};
