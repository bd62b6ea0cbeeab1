//! Derived-quantity engine: currents and reactivity.
//!
//! Each poll tick hands the engine the latest access-link snapshot, the latest
//! process-link record and the calibration tables. The engine keeps one running
//! baseline (the previous currents and when they were taken), produces the new
//! currents pair and two independent reactivity estimates, then replaces the baseline.
//!
//! The reactivity formula itself sits behind [`ReactivityModel`]. Both estimates of a
//! tick read the same prior baseline and never each other's output, so evaluating
//! them in either order gives the same result.
//!
//! # Default model
//!
//! [`InhourModel`] derives the inverse period `ω = ln(J/J_prev) / Δt` from two
//! successive currents and evaluates the inhour relation with negligible prompt
//! generation time:
//!
//! ```text
//! ρ = Σ_i α_i · ω / (ω + λ_i)
//! ```
//!
//! With no usable baseline (first tick, non-positive current, non-advancing clock) the
//! estimate is 0.

use crate::core::{validate_tables, AccessSample, DerivedSnapshot, ProcessSample};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Pluggable reactivity formula.
pub trait ReactivityModel: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &str;

    /// Reactivity from one current channel moving from `previous` to `current`
    /// over `dt_secs` seconds.
    fn reactivity(
        &self,
        lambdas: &[f64],
        alphas: &[f64],
        previous: f64,
        current: f64,
        dt_secs: f64,
    ) -> f64;
}

/// Inhour relation on the asymptotic inverse period.
#[derive(Clone, Copy, Debug, Default)]
pub struct InhourModel;

impl ReactivityModel for InhourModel {
    fn name(&self) -> &str {
        "inhour"
    }

    fn reactivity(
        &self,
        lambdas: &[f64],
        alphas: &[f64],
        previous: f64,
        current: f64,
        dt_secs: f64,
    ) -> f64 {
        if previous <= 0.0 || current <= 0.0 || dt_secs <= 0.0 {
            return 0.0;
        }
        let omega = (current / previous).ln() / dt_secs;
        if omega == 0.0 {
            return 0.0;
        }
        lambdas
            .iter()
            .zip(alphas)
            .map(|(lambda, alpha)| alpha * omega / (omega + lambda))
            .sum()
    }
}

/// Running baseline kept between ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedState {
    /// Last accepted current of chamber 1
    pub previous_current1: f64,
    /// Last accepted current of chamber 2
    pub previous_current2: f64,
    /// Last reactivity estimate from chamber 1
    pub reactivity1: f64,
    /// Last reactivity estimate from chamber 2
    pub reactivity2: f64,
    /// Capture time of the record the previous currents came from
    pub previous_at: Option<DateTime<Utc>>,
}

/// Stateful derivation of currents and reactivity.
///
/// One engine holds exactly one baseline; do not share it between instrument pairs.
pub struct DerivedQuantityEngine {
    state: DerivedState,
    model: Box<dyn ReactivityModel>,
}

impl DerivedQuantityEngine {
    /// Engine with a zero baseline and the [`InhourModel`].
    pub fn new() -> Self {
        Self::with_model(Box::new(InhourModel))
    }

    /// Engine using a custom reactivity formula.
    pub fn with_model(model: Box<dyn ReactivityModel>) -> Self {
        Self {
            state: DerivedState::default(),
            model,
        }
    }

    /// Baseline after the last accepted update.
    pub fn state(&self) -> &DerivedState {
        &self.state
    }

    /// Forget the baseline, as on a fresh connection.
    pub fn reset(&mut self) {
        self.state = DerivedState::default();
    }

    /// Derive the new currents and reactivities and replace the baseline.
    ///
    /// Fails with [`DaqError::InvalidInput`] on malformed tables or any non-finite input
    /// or result; the baseline is left untouched in that case.
    pub fn update(
        &mut self,
        lambdas: &[f64],
        alphas: &[f64],
        access: &AccessSample,
        process: &ProcessSample,
    ) -> AppResult<DerivedSnapshot> {
        validate_tables(lambdas, alphas)?;
        check_finite(access, process)?;

        let prior = self.state;
        let dt_secs = prior
            .previous_at
            .and_then(|at| (process.captured_at - at).num_nanoseconds())
            .map_or(0.0, |ns| ns as f64 * 1e-9);

        let reactivity1 = self.model.reactivity(
            lambdas,
            alphas,
            prior.previous_current1,
            process.current1,
            dt_secs,
        );
        let reactivity2 = self.model.reactivity(
            lambdas,
            alphas,
            prior.previous_current2,
            process.current2,
            dt_secs,
        );
        if !reactivity1.is_finite() || !reactivity2.is_finite() {
            return Err(DaqError::InvalidInput(format!(
                "{} model produced non-finite reactivity ({}, {})",
                self.model.name(),
                reactivity1,
                reactivity2
            )));
        }

        self.state = DerivedState {
            previous_current1: process.current1,
            previous_current2: process.current2,
            reactivity1,
            reactivity2,
            previous_at: Some(process.captured_at),
        };
        trace!(dt_secs, reactivity1, reactivity2, "derived quantities updated");

        Ok(DerivedSnapshot {
            current1: process.current1,
            current2: process.current2,
            reactivity1,
            reactivity2,
        })
    }
}

impl Default for DerivedQuantityEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DerivedQuantityEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedQuantityEngine")
            .field("model", &self.model.name())
            .field("state", &self.state)
            .finish()
    }
}

fn check_finite(access: &AccessSample, process: &ProcessSample) -> AppResult<()> {
    if let Some((index, value)) = access
        .channels()
        .iter()
        .enumerate()
        .find(|(_, v)| !v.is_finite())
    {
        return Err(DaqError::InvalidInput(format!(
            "access channel {} is {}",
            index, value
        )));
    }
    for (name, value) in [("FCurrent1", process.current1), ("FCurrent2", process.current2)] {
        if !value.is_finite() {
            return Err(DaqError::InvalidInput(format!("{} is {}", name, value)));
        }
    }
    Ok(())
}
