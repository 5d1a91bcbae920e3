//! TOML configuration for a tuning run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use st_data::{PollConfig, ResultsStore};
use st_optimizer::{ObjectiveDirection, PrunerConfig, Study};
use st_scheduler::{Scheduler, SlurmConfig};
use st_types::{config_error, ParameterDecl, ParameterSpec, ReportKey, TunerResult};

use crate::engine::{EngineOptions, TrialEvaluationEngine};
use crate::loss::LossConfig;

/// Everything needed to run a study.
///
/// ```toml
/// script = "train.submit"
/// results_path = "results.csv"
/// n_trials = 50
/// concurrency = 4
///
/// [engine]
/// return_average_on_prune = true
///
/// [pruner]
/// kind = "median"
///
/// [[parameters]]
/// name = "learning_rate"
/// kind = "float"
/// args = [1e-5, 1e-1]
/// kwargs = { log = true }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunerConfig {
    #[serde(default = "default_study_name")]
    pub study_name: String,
    /// Job script passed to the submit program.
    pub script: String,
    /// Results file every job appends to.
    pub results_path: PathBuf,
    #[serde(default)]
    pub direction: ObjectiveDirection,
    #[serde(default = "default_n_trials")]
    pub n_trials: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub polling: PollingSection,
    #[serde(default)]
    pub scheduler: SlurmConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub pruner: PrunerConfig,
    #[serde(default)]
    pub parameters: Vec<ParameterDecl>,
}

fn default_study_name() -> String {
    "slurm-tuner".to_string()
}

fn default_n_trials() -> usize {
    20
}

fn default_concurrency() -> usize {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default)]
    pub return_average_on_prune: bool,
    #[serde(default)]
    pub report_key: ReportKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingSection {
    #[serde(default = "default_interval_ms")]
    pub file_interval_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub row_interval_ms: u64,
    #[serde(default)]
    pub file_timeout_secs: Option<u64>,
    #[serde(default)]
    pub row_timeout_secs: Option<u64>,
}

fn default_interval_ms() -> u64 {
    5000
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            file_interval_ms: default_interval_ms(),
            row_interval_ms: default_interval_ms(),
            file_timeout_secs: None,
            row_timeout_secs: None,
        }
    }
}

impl TunerConfig {
    pub fn from_toml_str(raw: &str) -> TunerResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| config_error!("{}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> TunerResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| config_error!("cannot read {}: {}", path.as_ref().display(), e))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> TunerResult<()> {
        if self.script.trim().is_empty() {
            return Err(config_error!("script must not be empty"));
        }
        if self.results_path.as_os_str().is_empty() {
            return Err(config_error!("results_path must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(config_error!("concurrency must be at least 1"));
        }
        if self.polling.file_interval_ms == 0 || self.polling.row_interval_ms == 0 {
            return Err(config_error!("polling intervals must be positive"));
        }
        if self.scheduler.submit_program.is_empty() || self.scheduler.cancel_program.is_empty() {
            return Err(config_error!("scheduler programs must not be empty"));
        }
        Ok(())
    }

    pub fn parameter_spec(&self) -> TunerResult<ParameterSpec> {
        ParameterSpec::from_decls(self.parameters.clone())
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig::with_intervals(
            Duration::from_millis(self.polling.file_interval_ms),
            Duration::from_millis(self.polling.row_interval_ms),
        )
        .with_timeouts(
            self.polling.file_timeout_secs.map(Duration::from_secs),
            self.polling.row_timeout_secs.map(Duration::from_secs),
        )
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            return_average_on_prune: self.engine.return_average_on_prune,
            report_key: self.engine.report_key,
            poll: self.poll_config(),
        }
    }

    /// Build the engine against the given store and scheduler.
    pub fn build_engine(
        &self,
        store: Arc<dyn ResultsStore>,
        scheduler: Arc<dyn Scheduler>,
    ) -> TunerResult<TrialEvaluationEngine> {
        let engine = TrialEvaluationEngine::from_decls(
            self.parameters.clone(),
            self.script.clone(),
            store,
            scheduler,
            self.loss.build()?,
        )?;
        Ok(engine.with_options(self.engine_options()))
    }

    pub fn build_study(&self) -> Study {
        Study::new(self.study_name.clone(), self.direction, self.pruner.build(), self.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use st_optimizer::MedianPruner;
    use st_types::{ParameterKind, TunerError};

    const FULL: &str = r#"
        study_name = "ppo-sweep"
        script = "train.submit"
        results_path = "/scratch/results.csv"
        direction = "maximize"
        n_trials = 40
        concurrency = 8
        seed = 17

        [engine]
        return_average_on_prune = true
        report_key = "trial_id"

        [polling]
        file_interval_ms = 1000
        row_timeout_secs = 3600

        [scheduler]
        submit_args = ["--partition=gpu"]

        [loss]
        kind = "column"
        column = "cumulative_rewards"

        [pruner]
        kind = "median"
        n_startup_trials = 3

        [[parameters]]
        name = "trajectories"
        kind = "int"
        args = [100, 1000]
        kwargs = { step = 100 }

        [[parameters]]
        name = "activation"
        kind = "categorical"
        args = [["relu", "tanh"]]
    "#;

    #[test]
    fn parses_full_config() {
        let config = TunerConfig::from_toml_str(FULL).unwrap();

        assert_eq!(config.study_name, "ppo-sweep");
        assert_eq!(config.direction, ObjectiveDirection::Maximize);
        assert_eq!((config.n_trials, config.concurrency, config.seed), (40, 8, Some(17)));
        assert!(config.engine.return_average_on_prune);
        assert_eq!(config.engine.report_key, ReportKey::TrialId);
        assert_eq!(config.scheduler.submit_program, "sbatch");
        assert_eq!(config.scheduler.submit_args, vec!["--partition=gpu"]);
        assert_eq!(
            config.pruner,
            PrunerConfig::Median(MedianPruner {
                n_startup_trials: 3,
                n_warmup_steps: 0,
            })
        );

        let poll = config.poll_config();
        assert_eq!(poll.file_interval, Duration::from_secs(1));
        assert_eq!(poll.row_interval, Duration::from_secs(5));
        assert_eq!(poll.file_timeout, None);
        assert_eq!(poll.row_timeout, Some(Duration::from_secs(3600)));

        let spec = config.parameter_spec().unwrap();
        assert_eq!(spec.parameters.len(), 2);
        match &spec.parameters[0].kind {
            ParameterKind::Int(range) => assert_eq!((range.low, range.high, range.step), (100, 1000, 100)),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = TunerConfig::from_toml_str("script = \"job.sh\"\nresults_path = \"out.csv\"").unwrap();

        assert_eq!(config.study_name, "slurm-tuner");
        assert_eq!(config.direction, ObjectiveDirection::Minimize);
        assert_eq!((config.n_trials, config.concurrency), (20, 1));
        assert_eq!(config.engine_options(), EngineOptions::default());
        assert_eq!(config.scheduler, SlurmConfig::default());
        assert_eq!(config.loss, LossConfig::default());
        assert_eq!(config.pruner, PrunerConfig::None);
        assert!(config.parameters.is_empty());
    }

    #[test]
    fn rejects_invalid_configs() {
        let missing_script = TunerConfig::from_toml_str("results_path = \"out.csv\"");
        assert!(matches!(missing_script, Err(TunerError::Config(_))));

        let zero_concurrency =
            TunerConfig::from_toml_str("script = \"job.sh\"\nresults_path = \"out.csv\"\nconcurrency = 0");
        assert!(matches!(zero_concurrency, Err(TunerError::Config(_))));

        let bad_direction =
            TunerConfig::from_toml_str("script = \"job.sh\"\nresults_path = \"out.csv\"\ndirection = \"up\"");
        assert!(matches!(bad_direction, Err(TunerError::Config(_))));
    }

    #[test]
    fn unknown_parameter_kind_fails_engine_build() {
        let config = TunerConfig::from_toml_str(
            r#"
            script = "job.sh"
            results_path = "out.csv"

            [[parameters]]
            name = "x"
            kind = "uniform"
            args = [0.0, 1.0]
            "#,
        )
        .unwrap();

        let store = Arc::new(st_data::InMemoryResultsStore::new("out.csv"));
        let scheduler = Arc::new(st_scheduler::SlurmScheduler::default());
        let err = config.build_engine(store, scheduler).unwrap_err();
        assert!(matches!(err, TunerError::Config(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tuner.toml");
        std::fs::write(&path, FULL).unwrap();

        let config = TunerConfig::load(&path).unwrap();
        assert_eq!(config.n_trials, 40);
        assert_eq!(config.build_study().direction(), ObjectiveDirection::Maximize);

        let missing = TunerConfig::load(dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(TunerError::Config(_))));
    }
}
