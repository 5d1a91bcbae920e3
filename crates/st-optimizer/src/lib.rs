//! # st-optimizer
//!
//! Reference optimizer for slurm-tuner: per-trial random sampling, median
//! pruning, trial tracking and concurrent studies over an [`st_types::Objective`].

mod pruner;
mod search;
mod study;
mod trial;

pub use pruner::{MedianPruner, NopPruner, PruneInput, Pruner, PrunerConfig};
pub use search::RandomSampler;
pub use study::{Study, StudyTrial};
pub use trial::{ObjectiveDirection, StudyId, StudySummary, Trial, TrialStatus};
