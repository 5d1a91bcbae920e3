//! Studies: running many trials of one objective, a few at a time.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use st_types::{
    FloatRange, IntRange, Objective, ParameterSampler, ParameterValue, PruningOracle, TrialContext,
    TrialParams, TunerResult,
};

use crate::pruner::{PruneInput, Pruner};
use crate::search::RandomSampler;
use crate::trial::{ObjectiveDirection, StudyId, StudySummary, Trial, TrialStatus};

#[derive(Debug)]
struct StudyState {
    id: StudyId,
    name: String,
    direction: ObjectiveDirection,
    seed: Option<u64>,
    pruner: Box<dyn Pruner>,
    trials: DashMap<u64, Trial>,
    /// Intermediate values of completed trials, read by the pruner.
    completed: RwLock<Vec<BTreeMap<u64, f64>>>,
    best: RwLock<Option<(u64, f64)>>,
    next_number: AtomicU64,
    stopped: AtomicBool,
}

/// A set of trials optimizing one objective. Cloning shares the study.
#[derive(Debug, Clone)]
pub struct Study {
    state: Arc<StudyState>,
}

impl Study {
    pub fn new(
        name: impl Into<String>,
        direction: ObjectiveDirection,
        pruner: Box<dyn Pruner>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            state: Arc::new(StudyState {
                id: Uuid::new_v4(),
                name: name.into(),
                direction,
                seed,
                pruner,
                trials: DashMap::new(),
                completed: RwLock::new(Vec::new()),
                best: RwLock::new(None),
                next_number: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> StudyId {
        self.state.id
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn direction(&self) -> ObjectiveDirection {
        self.state.direction
    }

    /// Start a new trial. Numbers are unique and increase from 0.
    pub fn ask(&self) -> StudyTrial {
        let number = self.state.next_number.fetch_add(1, Ordering::SeqCst);
        self.state.trials.insert(number, Trial::new(self.state.id, number));
        StudyTrial {
            number,
            sampler: RandomSampler::for_trial(self.state.seed, number),
            params: TrialParams::new(),
            intermediate: BTreeMap::new(),
            last_report: None,
            reports: 0,
            state: self.state.clone(),
        }
    }

    /// Finish a trial with the objective's outcome and return its final status.
    pub fn tell(&self, trial: StudyTrial, outcome: TunerResult<f64>) -> TrialStatus {
        let number = trial.number;
        let Some(mut record) = self.state.trials.get_mut(&number) else {
            warn!("Trial {} is not part of study '{}'", number, self.state.name);
            return TrialStatus::Failed;
        };
        record.params = trial.params;
        record.intermediate = trial.intermediate;

        match outcome {
            Ok(value) if value.is_finite() => {
                record.mark_completed(value);
                self.state.completed.write().push(record.intermediate.clone());
                let best = {
                    let mut best = self.state.best.write();
                    let improved = best.map_or(true, |(_, current)| self.state.direction.improves(value, current));
                    if improved {
                        *best = Some((number, value));
                    }
                    *best
                };
                if let Some((best_number, best_value)) = best {
                    info!(
                        "Trial {} finished with value: {} and parameters: {}. Best is trial {} with value: {}.",
                        number, value, record.params, best_number, best_value
                    );
                }
            }
            Ok(value) => {
                warn!("Trial {} failed: objective returned {}", number, value);
                record.mark_failed(format!("objective returned {value}"));
            }
            Err(e) if e.is_pruned() => {
                info!("Trial {} pruned. {}", number, e);
                record.mark_pruned();
            }
            Err(e) => {
                warn!("Trial {} failed: {}", number, e);
                record.mark_failed(e.to_string());
            }
        }
        record.status
    }

    /// Stop launching new trials. Trials already running are left to finish.
    pub fn stop(&self) {
        if !self.state.stopped.swap(true, Ordering::SeqCst) {
            info!("Study '{}' stopping, no new trials will be started", self.state.name);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::SeqCst)
    }

    pub fn trial(&self, number: u64) -> Option<Trial> {
        self.state.trials.get(&number).map(|t| t.clone())
    }

    /// All trials, ordered by number.
    pub fn trials(&self) -> Vec<Trial> {
        let mut trials: Vec<Trial> = self.state.trials.iter().map(|t| t.value().clone()).collect();
        trials.sort_by_key(|t| t.number);
        trials
    }

    pub fn best_trial(&self) -> Option<Trial> {
        let (number, _) = (*self.state.best.read())?;
        self.trial(number)
    }

    pub fn summary(&self) -> StudySummary {
        let mut summary = StudySummary::new(self.state.id, self.state.name.clone(), self.state.direction);
        for trial in self.trials() {
            summary.record(&trial);
        }
        summary
    }

    /// Run `n_trials` trials with at most `concurrency` in flight.
    ///
    /// Returns early, after in-flight trials finish, once [`Study::stop`] is called.
    pub async fn optimize(
        &self,
        objective: Arc<dyn Objective>,
        n_trials: usize,
        concurrency: usize,
    ) -> StudySummary {
        let concurrency = concurrency.max(1);
        info!(
            "Starting study '{}' ({}): {} trials, {} at a time",
            self.state.name, self.state.direction, n_trials, concurrency
        );

        let mut tasks = JoinSet::new();
        let mut launched = 0;
        loop {
            while launched < n_trials && tasks.len() < concurrency && !self.is_stopped() {
                let mut trial = self.ask();
                let study = self.clone();
                let objective = objective.clone();
                tasks.spawn(async move {
                    let outcome = objective.evaluate(&mut trial).await;
                    study.tell(trial, outcome)
                });
                launched += 1;
            }

            match tasks.join_next().await {
                Some(Ok(_)) => {}
                Some(Err(e)) => error!("Trial task did not finish: {}", e),
                None => break,
            }
        }

        self.fail_unfinished();
        let summary = self.summary();
        info!(
            "Study '{}' finished: {} completed, {} pruned, {} failed",
            summary.name, summary.n_completed, summary.n_pruned, summary.n_failed
        );
        summary
    }

    /// Trials whose task panicked never reach `tell`.
    fn fail_unfinished(&self) {
        for mut trial in self.state.trials.iter_mut() {
            if trial.status == TrialStatus::Running {
                trial.mark_failed("evaluation task aborted".to_string());
            }
        }
    }
}

/// Handle given to the objective for one trial.
///
/// Suggested values are recorded on the trial; reports feed the study's pruner.
#[derive(Debug)]
pub struct StudyTrial {
    number: u64,
    sampler: RandomSampler,
    params: TrialParams,
    intermediate: BTreeMap<u64, f64>,
    last_report: Option<(u64, f64)>,
    reports: usize,
    state: Arc<StudyState>,
}

impl StudyTrial {
    pub fn params(&self) -> &TrialParams {
        &self.params
    }

    pub fn intermediate_values(&self) -> &BTreeMap<u64, f64> {
        &self.intermediate
    }
}

impl ParameterSampler for StudyTrial {
    fn suggest_int(&mut self, name: &str, range: &IntRange) -> TunerResult<i64> {
        let value = self.sampler.suggest_int(name, range)?;
        self.params.insert(name, ParameterValue::Int(value));
        Ok(value)
    }

    fn suggest_float(&mut self, name: &str, range: &FloatRange) -> TunerResult<f64> {
        let value = self.sampler.suggest_float(name, range)?;
        self.params.insert(name, ParameterValue::Float(value));
        Ok(value)
    }

    fn suggest_categorical(&mut self, name: &str, choices: &[Value]) -> TunerResult<Value> {
        let value = self.sampler.suggest_categorical(name, choices)?;
        self.params.insert(name, ParameterValue::Categorical(value.clone()));
        Ok(value)
    }
}

impl PruningOracle for StudyTrial {
    fn report(&mut self, value: f64, key: u64) {
        self.intermediate.insert(key, value);
        self.last_report = Some((key, value));
        self.reports += 1;
    }

    fn should_prune(&self) -> bool {
        let Some((key, value)) = self.last_report else {
            return false;
        };
        let completed = self.state.completed.read();
        self.state.pruner.prune(&PruneInput {
            direction: self.state.direction,
            trial: self.number,
            key,
            value,
            reports: self.reports,
            completed: &completed,
        })
    }
}

impl TrialContext for StudyTrial {
    fn number(&self) -> u64 {
        self.number
    }
}
