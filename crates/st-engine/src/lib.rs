// slurm-tuner trial evaluation engine
// Connects an optimizer to batch jobs through the scheduler and the results store

pub mod config;
pub mod engine;
pub mod loss;

pub use config::{EngineSection, PollingSection, TunerConfig};
pub use engine::{EngineOptions, TrialEvaluationEngine};
pub use loss::{ColumnLoss, LossConfig, WeightedSumLoss, WeightedTerm};
