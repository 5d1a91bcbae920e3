//! Capability traits the evaluation engine consumes.
//!
//! The optimizer, the loss computation and the objective are plugged in as
//! trait objects chosen at construction time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::TunerResult;
use crate::params::{FloatRange, IntRange, TrialParams};
use crate::results::ResultRow;

/// Suggests parameter values, one method per parameter kind.
pub trait ParameterSampler {
    fn suggest_int(&mut self, name: &str, range: &IntRange) -> TunerResult<i64>;

    fn suggest_float(&mut self, name: &str, range: &FloatRange) -> TunerResult<f64>;

    fn suggest_categorical(&mut self, name: &str, choices: &[Value]) -> TunerResult<Value>;
}

/// Receives intermediate values and decides whether a trial should stop.
pub trait PruningOracle {
    /// Record `value` under `key` (a step index or a trial number, see [`ReportKey`]).
    fn report(&mut self, value: f64, key: u64);

    fn should_prune(&self) -> bool;
}

/// The optimizer-side handle for one running trial.
pub trait TrialContext: ParameterSampler + PruningOracle + Send {
    /// Identifier assigned by the optimizer; unique and increasing within a run.
    fn number(&self) -> u64;
}

/// What an intermediate value is keyed by when reported to the oracle.
///
/// `Step` makes the oracle compare trials at the same progress point;
/// `TrialId` gives every trial its own bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKey {
    #[default]
    Step,
    TrialId,
}

impl ReportKey {
    pub fn key_for(self, step: u64, trial: u64) -> u64 {
        match self {
            ReportKey::Step => step,
            ReportKey::TrialId => trial,
        }
    }
}

/// Converts one result row into a scalar loss.
pub trait Loss: Send + Sync + std::fmt::Debug {
    fn loss(&self, row: &ResultRow, params: &TrialParams) -> TunerResult<f64>;
}

/// An objective function evaluated once per trial.
///
/// `Err(TunerError::TrialPruned { .. })` marks the trial as pruned; any other
/// error marks it as failed.
#[async_trait]
pub trait Objective: Send + Sync {
    async fn evaluate(&self, trial: &mut dyn TrialContext) -> TunerResult<f64>;
}
