//! Trial records and study-level bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use st_types::TrialParams;

/// Unique study identifier.
pub type StudyId = Uuid;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveDirection {
    Maximize,
    #[default]
    Minimize,
}

impl ObjectiveDirection {
    /// True when `candidate` is strictly better than `current`.
    pub fn improves(self, candidate: f64, current: f64) -> bool {
        match self {
            ObjectiveDirection::Maximize => candidate > current,
            ObjectiveDirection::Minimize => candidate < current,
        }
    }
}

impl fmt::Display for ObjectiveDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectiveDirection::Maximize => f.write_str("maximize"),
            ObjectiveDirection::Minimize => f.write_str("minimize"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Running,
    Completed,
    Pruned,
    Failed,
}

impl TrialStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, TrialStatus::Running)
    }
}

/// A single trial (one parameter combination evaluated by the objective).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    pub study_id: StudyId,
    pub number: u64,
    pub params: TrialParams,
    pub status: TrialStatus,
    pub value: Option<f64>,
    /// Intermediate values keyed the way they were reported.
    pub intermediate: BTreeMap<u64, f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(study_id: StudyId, number: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            study_id,
            number,
            params: TrialParams::new(),
            status: TrialStatus::Running,
            value: None,
            intermediate: BTreeMap::new(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_completed(&mut self, value: f64) {
        self.status = TrialStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.value = Some(value);
    }

    pub fn mark_pruned(&mut self) {
        self.status = TrialStatus::Pruned;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = TrialStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        self.finished_at.map(|end| (end - self.started_at).num_seconds())
    }
}

/// Aggregate outcome of a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySummary {
    pub id: StudyId,
    pub name: String,
    pub direction: ObjectiveDirection,
    pub n_trials: usize,
    pub n_completed: usize,
    pub n_pruned: usize,
    pub n_failed: usize,
    pub best_trial: Option<Trial>,
}

impl StudySummary {
    pub fn new(id: StudyId, name: String, direction: ObjectiveDirection) -> Self {
        Self {
            id,
            name,
            direction,
            n_trials: 0,
            n_completed: 0,
            n_pruned: 0,
            n_failed: 0,
            best_trial: None,
        }
    }

    /// Count `trial` and keep it as best if it improves on the current best.
    pub fn record(&mut self, trial: &Trial) {
        self.n_trials += 1;
        match trial.status {
            TrialStatus::Completed => self.n_completed += 1,
            TrialStatus::Pruned => self.n_pruned += 1,
            TrialStatus::Failed => self.n_failed += 1,
            TrialStatus::Running => {}
        }
        self.update_best(trial);
    }

    fn update_best(&mut self, trial: &Trial) {
        let Some(value) = trial.value.filter(|_| trial.status == TrialStatus::Completed) else {
            return;
        };
        let dominated = match self.best_trial.as_ref().and_then(|b| b.value) {
            None => true,
            Some(best) => self.direction.improves(value, best),
        };
        if dominated {
            self.best_trial = Some(trial.clone());
        }
    }
}

impl fmt::Display for StudySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Study '{}' ({})", self.name, self.direction)?;
        writeln!(
            f,
            "  trials: {} ({} completed, {} pruned, {} failed)",
            self.n_trials, self.n_completed, self.n_pruned, self.n_failed
        )?;
        match &self.best_trial {
            Some(best) => write!(
                f,
                "  best: trial {} with value {} and parameters {}",
                best.number,
                best.value.unwrap_or(f64::NAN),
                best.params
            ),
            None => write!(f, "  best: none"),
        }
    }
}
