//! Result rows written by remote jobs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{ResultsError, TunerResult};

/// Step value a job writes once it has finished and produced its final result.
pub const TERMINAL_STEP: i64 = -1;

/// Column holding the trial identifier.
pub const TRIAL_COLUMN: &str = "trial";

/// Column holding the step number.
pub const STEP_COLUMN: &str = "step";

/// One record in the results store, keyed by `(trial, step)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub trial: u64,
    pub step: i64,
    /// Every other column, as written by the job.
    pub metrics: BTreeMap<String, String>,
}

impl ResultRow {
    pub fn new(trial: u64, step: i64) -> Self {
        Self {
            trial,
            step,
            metrics: BTreeMap::new(),
        }
    }

    pub fn terminal(trial: u64) -> Self {
        Self::new(trial, TERMINAL_STEP)
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.metrics.insert(name.into(), value.to_string());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.step == TERMINAL_STEP
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.metrics.get(column).map(String::as_str)
    }

    /// Parse a metric column as a float.
    pub fn metric(&self, column: &str) -> TunerResult<f64> {
        let raw = self.get(column).ok_or_else(|| ResultsError::MissingColumn {
            column: column.to_string(),
        })?;
        raw.trim().parse::<f64>().map_err(|_| {
            ResultsError::InvalidValue {
                column: column.to_string(),
                value: raw.to_string(),
            }
            .into()
        })
    }
}
