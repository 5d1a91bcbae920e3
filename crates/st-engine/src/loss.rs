//! Loss functions over result rows.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use st_types::{Loss, ResultRow, TrialParams, TunerResult};

/// Reads one metric column, optionally negated so larger-is-better metrics
/// (rewards, accuracy) can be minimized.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnLoss {
    column: String,
    negate: bool,
}

impl ColumnLoss {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            negate: false,
        }
    }

    pub fn negated(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            negate: true,
        }
    }
}

impl Loss for ColumnLoss {
    fn loss(&self, row: &ResultRow, _params: &TrialParams) -> TunerResult<f64> {
        let value = row.metric(&self.column)?;
        Ok(if self.negate { -value } else { value })
    }
}

/// `sum(weight * column)` over several metric columns.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedSumLoss {
    terms: Vec<WeightedTerm>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedTerm {
    pub column: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl WeightedSumLoss {
    pub fn new(terms: Vec<WeightedTerm>) -> TunerResult<Self> {
        if terms.is_empty() {
            return Err(st_types::config_error!("weighted_sum loss needs at least one term"));
        }
        if let Some(term) = terms.iter().find(|t| !t.weight.is_finite()) {
            return Err(st_types::config_error!(
                "weight for column '{}' must be finite, got {}",
                term.column,
                term.weight
            ));
        }
        Ok(Self { terms })
    }
}

impl Loss for WeightedSumLoss {
    fn loss(&self, row: &ResultRow, _params: &TrialParams) -> TunerResult<f64> {
        self.terms
            .iter()
            .try_fold(0.0, |acc, term| -> TunerResult<f64> {
                Ok(acc + term.weight * row.metric(&term.column)?)
            })
    }
}

/// Loss selection as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LossConfig {
    Column {
        #[serde(default = "default_loss_column")]
        column: String,
        #[serde(default)]
        negate: bool,
    },
    WeightedSum { terms: Vec<WeightedTerm> },
}

fn default_loss_column() -> String {
    "loss".to_string()
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig::Column {
            column: default_loss_column(),
            negate: false,
        }
    }
}

impl LossConfig {
    pub fn build(&self) -> TunerResult<Arc<dyn Loss>> {
        let loss: Arc<dyn Loss> = match self {
            LossConfig::Column { column, negate: false } => Arc::new(ColumnLoss::new(column.clone())),
            LossConfig::Column { column, negate: true } => Arc::new(ColumnLoss::negated(column.clone())),
            LossConfig::WeightedSum { terms } => Arc::new(WeightedSumLoss::new(terms.clone())?),
        };
        Ok(loss)
    }
}
