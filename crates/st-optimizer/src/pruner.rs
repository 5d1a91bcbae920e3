//! Pruning rules applied to intermediate values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::trial::ObjectiveDirection;

/// What a pruner gets to look at when a trial asks whether to stop.
#[derive(Debug, Clone, Copy)]
pub struct PruneInput<'a> {
    pub direction: ObjectiveDirection,
    pub trial: u64,
    /// Key of the most recent report.
    pub key: u64,
    /// Value of the most recent report.
    pub value: f64,
    /// Number of values this trial has reported so far.
    pub reports: usize,
    /// Intermediate values of every completed trial.
    pub completed: &'a [BTreeMap<u64, f64>],
}

pub trait Pruner: Send + Sync + Debug {
    fn prune(&self, input: &PruneInput<'_>) -> bool;
}

/// Never prunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn prune(&self, _input: &PruneInput<'_>) -> bool {
        false
    }
}

/// Prunes a trial whose latest value is worse than the median of completed
/// trials at the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedianPruner {
    /// No pruning until this many trials have completed.
    #[serde(default = "default_startup_trials")]
    pub n_startup_trials: usize,
    /// The first `n_warmup_steps` reports of each trial are never pruned.
    #[serde(default)]
    pub n_warmup_steps: usize,
}

fn default_startup_trials() -> usize {
    5
}

impl Default for MedianPruner {
    fn default() -> Self {
        Self {
            n_startup_trials: default_startup_trials(),
            n_warmup_steps: 0,
        }
    }
}

impl Pruner for MedianPruner {
    fn prune(&self, input: &PruneInput<'_>) -> bool {
        if input.completed.len() < self.n_startup_trials || input.reports <= self.n_warmup_steps {
            return false;
        }
        if input.value.is_nan() {
            return true;
        }

        let peers: Vec<f64> = input
            .completed
            .iter()
            .filter_map(|history| history.get(&input.key).copied())
            .filter(|v| !v.is_nan())
            .collect();
        let Some(median) = median(peers) else {
            return false;
        };

        match input.direction {
            ObjectiveDirection::Minimize => input.value > median,
            ObjectiveDirection::Maximize => input.value < median,
        }
    }
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Pruner selection as it appears in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrunerConfig {
    #[default]
    None,
    Median(MedianPruner),
}

impl PrunerConfig {
    pub fn build(&self) -> Box<dyn Pruner> {
        match self {
            PrunerConfig::None => Box::new(NopPruner),
            PrunerConfig::Median(pruner) => Box::new(*pruner),
        }
    }
}
