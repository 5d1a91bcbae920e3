// Trial evaluation engine
// Submits one batch job per trial and follows its progress through the results store

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use st_data::{Cancellation, PollConfig, PollSignal, ResultsPoller, ResultsStore};
use st_scheduler::{Scheduler, SubmitRequest};
use st_types::{
    Job, JobId, Loss, Objective, ParameterDecl, ParameterSpec, ReportKey, ResultRow, TrialContext,
    TrialParams, TunerError, TunerResult,
};

/// Behaviour switches for trial evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOptions {
    /// On pruning, return the mean of the intermediate losses instead of the pruned signal.
    pub return_average_on_prune: bool,
    /// What intermediate values are keyed by when reported to the optimizer.
    pub report_key: ReportKey,
    pub poll: PollConfig,
}

/// Evaluates trials by running them as scheduler jobs.
///
/// For each trial the engine resolves the parameter spec against the trial,
/// submits one job, waits for the results store to appear and then follows
/// the job's rows step by step. Intermediate losses go to the optimizer, which
/// may prune the trial; the terminal row ends it.
#[derive(Debug)]
pub struct TrialEvaluationEngine {
    spec: ParameterSpec,
    script: String,
    store: Arc<dyn ResultsStore>,
    scheduler: Arc<dyn Scheduler>,
    loss: Arc<dyn Loss>,
    options: EngineOptions,
    cancellation: Cancellation,
    jobs: DashMap<u64, Job>,
}

impl TrialEvaluationEngine {
    /// Create an engine; the spec is validated here so bad configuration fails before any submission.
    pub fn new(
        spec: ParameterSpec,
        script: impl Into<String>,
        store: Arc<dyn ResultsStore>,
        scheduler: Arc<dyn Scheduler>,
        loss: Arc<dyn Loss>,
    ) -> TunerResult<Self> {
        spec.validate().inspect_err(|e| error!("Invalid parameter spec: {}", e))?;
        Ok(Self {
            spec,
            script: script.into(),
            store,
            scheduler,
            loss,
            options: EngineOptions::default(),
            cancellation: Cancellation::new(),
            jobs: DashMap::new(),
        })
    }

    /// Create an engine from declarative parameter entries.
    pub fn from_decls(
        decls: Vec<ParameterDecl>,
        script: impl Into<String>,
        store: Arc<dyn ResultsStore>,
        scheduler: Arc<dyn Scheduler>,
        loss: Arc<dyn Loss>,
    ) -> TunerResult<Self> {
        let spec = ParameterSpec::from_decls(decls).inspect_err(|e| error!("Invalid parameter spec: {}", e))?;
        Self::new(spec, script, store, scheduler, loss)
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// Jobs submitted so far, as last observed.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by_key(|j| j.trial);
        jobs
    }

    pub fn job_for_trial(&self, trial: u64) -> Option<Job> {
        self.jobs.get(&trial).map(|j| j.clone())
    }

    /// Run one trial to completion.
    pub async fn run_trial(&self, trial: &mut dyn TrialContext) -> TunerResult<f64> {
        let number = trial.number();
        let params = self
            .spec
            .resolve(&mut *trial)
            .inspect_err(|e| error!(trial = number, "Cannot resolve parameters: {}", e))?;

        let request = SubmitRequest::new(&self.script, self.store.location(), number, params);
        let job_id = self.scheduler.submit(&request).await?;
        self.jobs.insert(number, Job::submitted(job_id, number));

        let outcome = self.follow(trial, job_id, &request.params).await;
        if let Err(e) = &outcome {
            if !e.is_pruned() {
                warn!(trial = number, job_id, "Trial {} stopped early: {}", number, e);
                // A job that wrote its terminal row has nothing left to release.
                if self.job_for_trial(number).is_some_and(|job| job.is_active()) {
                    self.cancel_job(number, job_id).await;
                }
            }
        }
        outcome
    }

    /// Phase 1 then phase 2 of the polling protocol, with pruning after every intermediate row.
    async fn follow(&self, trial: &mut dyn TrialContext, job_id: JobId, params: &TrialParams) -> TunerResult<f64> {
        let number = trial.number();
        let poller = ResultsPoller::new(self.store.as_ref(), &self.options.poll, &self.cancellation, number);

        poller.wait_for_store().await?;

        let mut step = 0;
        let mut losses = Vec::new();
        loop {
            match poller.wait_for_signal(step).await? {
                PollSignal::Terminal(row) => {
                    self.update_job(number, Job::mark_finished);
                    let value = self.row_loss(number, &row, params)?;
                    info!(trial = number, job_id, "Trial {} finished with loss {}", number, value);
                    return Ok(value);
                }
                PollSignal::Step(row) => {
                    self.update_job(number, Job::mark_running);
                    let value = self.row_loss(number, &row, params)?;
                    losses.push(value);

                    let key = self.options.report_key.key_for(row.step as u64, number);
                    trial.report(value, key);
                    debug!(trial = number, step = row.step, key, "Reported intermediate loss {}", value);

                    if trial.should_prune() {
                        info!(trial = number, job_id, "Pruning trial {} at step {}", number, row.step);
                        self.cancel_job(number, job_id).await;
                        if self.options.return_average_on_prune {
                            return Ok(losses.iter().sum::<f64>() / losses.len() as f64);
                        }
                        return Err(TunerError::TrialPruned {
                            trial: number,
                            step: row.step,
                        });
                    }
                    step = row.step + 1;
                }
            }
        }
    }

    fn row_loss(&self, trial: u64, row: &ResultRow, params: &TrialParams) -> TunerResult<f64> {
        let value = self
            .loss
            .loss(row, params)
            .inspect_err(|e| error!(trial, step = row.step, "Loss evaluation failed: {}", e))?;
        if !value.is_finite() {
            error!(trial, step = row.step, "Loss is not finite: {}", value);
            return Err(TunerError::Evaluation {
                trial,
                message: format!("loss at step {} is {}", row.step, value),
            });
        }
        Ok(value)
    }

    /// Failure to cancel only leaks scheduler resources, so it is logged and swallowed.
    async fn cancel_job(&self, trial: u64, job_id: JobId) {
        match self.scheduler.cancel(job_id).await {
            Ok(()) => self.update_job(trial, Job::mark_cancelled),
            Err(e) => warn!(trial, job_id, "Job {} may still be running: {}", job_id, e),
        }
    }

    fn update_job(&self, trial: u64, transition: fn(&mut Job)) {
        if let Some(mut job) = self.jobs.get_mut(&trial) {
            let before = job.state;
            transition(job.value_mut());
            if job.state != before {
                debug!(trial, job_id = job.id, "Job {:?} -> {:?}", before, job.state);
            }
        }
    }
}

#[async_trait]
impl Objective for TrialEvaluationEngine {
    async fn evaluate(&self, trial: &mut dyn TrialContext) -> TunerResult<f64> {
        self.run_trial(trial).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use st_data::InMemoryResultsStore;
    use st_scheduler::{JobCanceller, JobSubmitter};
    use st_types::{
        CancellationError, FloatRange, IntRange, JobState, ParameterSampler, PruningOracle, SubmissionError,
    };
    use std::time::Duration;

    use crate::loss::ColumnLoss;

    /// Scheduler double that records every request.
    #[derive(Debug, Default)]
    struct RecordingScheduler {
        submits: Mutex<Vec<SubmitRequest>>,
        cancels: Mutex<Vec<JobId>>,
        reject_submit: bool,
        fail_cancel: bool,
    }

    impl RecordingScheduler {
        fn submit_count(&self) -> usize {
            self.submits.lock().len()
        }

        fn cancels(&self) -> Vec<JobId> {
            self.cancels.lock().clone()
        }
    }

    #[async_trait]
    impl JobSubmitter for RecordingScheduler {
        async fn submit(&self, request: &SubmitRequest) -> TunerResult<JobId> {
            self.submits.lock().push(request.clone());
            if self.reject_submit {
                return Err(SubmissionError::UnrecognizedResponse {
                    command: "sbatch".into(),
                    output: "sbatch: error: invalid partition".into(),
                }
                .into());
            }
            Ok(1000 + request.trial)
        }
    }

    #[async_trait]
    impl JobCanceller for RecordingScheduler {
        async fn cancel(&self, job_id: JobId) -> TunerResult<()> {
            self.cancels.lock().push(job_id);
            if self.fail_cancel {
                return Err(CancellationError::CommandFailed {
                    job_id,
                    status: "exit status: 1".into(),
                    stderr: "Invalid job id".into(),
                }
                .into());
            }
            Ok(())
        }
    }

    impl Scheduler for RecordingScheduler {
        fn name(&self) -> &str {
            "recording"
        }
    }

    /// Trial double: lowest value of every range, prunes after a scripted number of reports.
    struct ScriptedTrial {
        number: u64,
        prune_after: Option<usize>,
        reports: Vec<(f64, u64)>,
    }

    impl ScriptedTrial {
        fn new(number: u64) -> Self {
            Self {
                number,
                prune_after: None,
                reports: Vec::new(),
            }
        }

        fn pruning_after(mut self, reports: usize) -> Self {
            self.prune_after = Some(reports);
            self
        }
    }

    impl ParameterSampler for ScriptedTrial {
        fn suggest_int(&mut self, _name: &str, range: &IntRange) -> TunerResult<i64> {
            Ok(range.low)
        }

        fn suggest_float(&mut self, _name: &str, range: &FloatRange) -> TunerResult<f64> {
            Ok(range.low)
        }

        fn suggest_categorical(&mut self, _name: &str, choices: &[Value]) -> TunerResult<Value> {
            Ok(choices[0].clone())
        }
    }

    impl PruningOracle for ScriptedTrial {
        fn report(&mut self, value: f64, key: u64) {
            self.reports.push((value, key));
        }

        fn should_prune(&self) -> bool {
            self.prune_after.is_some_and(|n| self.reports.len() >= n)
        }
    }

    impl TrialContext for ScriptedTrial {
        fn number(&self) -> u64 {
            self.number
        }
    }

    fn spec() -> ParameterSpec {
        ParameterSpec::new()
            .add_int("trajectories", 100, 500)
            .add_categorical("activation", vec![json!("relu"), json!("tanh")])
    }

    fn row(trial: u64, step: i64, loss: f64) -> ResultRow {
        ResultRow::new(trial, step).with_metric("loss", loss)
    }

    fn fast_options() -> EngineOptions {
        EngineOptions {
            poll: PollConfig::with_intervals(Duration::from_millis(10), Duration::from_millis(10)),
            ..EngineOptions::default()
        }
    }

    fn engine(store: &InMemoryResultsStore, scheduler: &Arc<RecordingScheduler>) -> TrialEvaluationEngine {
        TrialEvaluationEngine::new(
            spec(),
            "train.submit",
            Arc::new(store.clone()),
            scheduler.clone(),
            Arc::new(ColumnLoss::new("loss")),
        )
        .unwrap()
        .with_options(fast_options())
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_row_ends_the_trial() {
        let store = InMemoryResultsStore::new("results.csv");
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine(&store, &scheduler);

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(35)).await;
            writer.append(row(2, 0, 0.8));
            tokio::time::sleep(Duration::from_millis(35)).await;
            writer.append(row(5, 0, 9.9));
            writer.append(row(2, 1, 0.6));
            tokio::time::sleep(Duration::from_millis(35)).await;
            writer.append(row(2, -1, 0.1));
        });

        let mut trial = ScriptedTrial::new(2);
        let value = engine.run_trial(&mut trial).await.unwrap();

        assert_eq!(value, 0.1);
        assert_eq!(trial.reports, vec![(0.8, 0), (0.6, 1)]);
        assert!(scheduler.cancels().is_empty());

        let submits = scheduler.submits.lock().clone();
        assert_eq!(submits.len(), 1);
        assert_eq!(
            submits[0].submission_args(),
            vec!["train.submit", "results.csv", "2", "100", "relu"]
        );
        assert_eq!(engine.job_for_trial(2).unwrap().state, JobState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_row_wins_over_pending_step() {
        let store = InMemoryResultsStore::with_rows("results.csv", vec![row(7, 0, 0.9), row(7, -1, 0.2)]);
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine(&store, &scheduler);

        let mut trial = ScriptedTrial::new(7).pruning_after(1);
        let value = engine.run_trial(&mut trial).await.unwrap();

        assert_eq!(value, 0.2);
        assert!(trial.reports.is_empty());
        assert!(scheduler.cancels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn prune_with_average_returns_mean_of_observed_losses() {
        let store = InMemoryResultsStore::new("results.csv");
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine(&store, &scheduler).with_options(EngineOptions {
            return_average_on_prune: true,
            ..fast_options()
        });

        let writer = store.clone();
        tokio::spawn(async move {
            writer.append(row(3, 0, 0.5));
            tokio::time::sleep(Duration::from_millis(25)).await;
            writer.append(row(3, 1, 0.3));
            tokio::time::sleep(Duration::from_millis(25)).await;
            writer.append(row(3, 2, 0.1));
        });

        let mut trial = ScriptedTrial::new(3).pruning_after(2);
        let value = engine.run_trial(&mut trial).await.unwrap();

        assert!((value - 0.4).abs() < 1e-12);
        assert_eq!(scheduler.cancels(), vec![1003]);
        assert_eq!(engine.job_for_trial(3).unwrap().state, JobState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_without_average_signals_pruned() {
        let store = InMemoryResultsStore::with_rows("results.csv", vec![row(4, 0, 0.7)]);
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine(&store, &scheduler);

        let mut trial = ScriptedTrial::new(4).pruning_after(1);
        match engine.run_trial(&mut trial).await.unwrap_err() {
            TunerError::TrialPruned { trial, step } => assert_eq!((trial, step), (4, 0)),
            other => panic!("Expected TrialPruned, got: {:?}", other),
        }
        assert_eq!(scheduler.cancels(), vec![1004]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cancel_does_not_fail_pruning() {
        let store = InMemoryResultsStore::with_rows("results.csv", vec![row(4, 0, 0.7)]);
        let scheduler = Arc::new(RecordingScheduler {
            fail_cancel: true,
            ..RecordingScheduler::default()
        });
        let engine = engine(&store, &scheduler);

        let mut trial = ScriptedTrial::new(4).pruning_after(1);
        let err = engine.run_trial(&mut trial).await.unwrap_err();

        assert!(err.is_pruned());
        assert_eq!(scheduler.cancels(), vec![1004]);
        assert_eq!(engine.job_for_trial(4).unwrap().state, JobState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn submission_failure_skips_polling() {
        let store = InMemoryResultsStore::with_rows("results.csv", vec![row(1, -1, 0.1)]);
        let scheduler = Arc::new(RecordingScheduler {
            reject_submit: true,
            ..RecordingScheduler::default()
        });
        let engine = engine(&store, &scheduler);

        let mut trial = ScriptedTrial::new(1);
        let err = engine.run_trial(&mut trial).await.unwrap_err();

        assert!(matches!(err, TunerError::Submission(SubmissionError::UnrecognizedResponse { .. })));
        assert_eq!(store.reads(), 0);
        assert!(scheduler.cancels().is_empty());
        assert!(engine.jobs().is_empty());
    }

    #[test]
    fn unknown_parameter_kind_never_submits() {
        let store = InMemoryResultsStore::new("results.csv");
        let scheduler = Arc::new(RecordingScheduler::default());
        let decls = vec![ParameterDecl {
            name: "trajectories".into(),
            kind: "loguniform_int".into(),
            args: vec![json!(1), json!(10)],
            kwargs: Default::default(),
        }];

        let err = TrialEvaluationEngine::from_decls(
            decls,
            "train.submit",
            Arc::new(store),
            scheduler.clone(),
            Arc::new(ColumnLoss::new("loss")),
        )
        .unwrap_err();

        assert!(matches!(err, TunerError::Config(_)));
        assert_eq!(scheduler.submit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gaps_are_skipped_and_duplicates_use_first_row() {
        let store = InMemoryResultsStore::new("results.csv");
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine(&store, &scheduler);

        let writer = store.clone();
        tokio::spawn(async move {
            writer.append(row(6, 0, 0.9));
            writer.append(row(6, 0, 0.1));
            writer.append(row(6, 2, 0.5));
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.append(row(6, -1, 0.4));
        });

        let mut trial = ScriptedTrial::new(6);
        let value = engine.run_trial(&mut trial).await.unwrap();

        assert_eq!(value, 0.4);
        assert_eq!(trial.reports, vec![(0.9, 0), (0.5, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_id_report_key() {
        let store = InMemoryResultsStore::new("results.csv");
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine(&store, &scheduler).with_options(EngineOptions {
            report_key: ReportKey::TrialId,
            ..fast_options()
        });

        let writer = store.clone();
        tokio::spawn(async move {
            writer.append(row(9, 0, 0.3));
            writer.append(row(9, 1, 0.2));
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.append(row(9, -1, 0.1));
        });

        let mut trial = ScriptedTrial::new(9);
        engine.run_trial(&mut trial).await.unwrap();
        assert_eq!(trial.reports, vec![(0.3, 9), (0.2, 9)]);
    }

    #[tokio::test(start_paused = true)]
    async fn row_timeout_releases_the_job() {
        let store = InMemoryResultsStore::with_rows("results.csv", vec![row(8, 0, 0.5)]);
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut options = fast_options();
        options.poll = options.poll.with_timeouts(None, Some(Duration::from_millis(100)));
        let engine = engine(&store, &scheduler).with_options(options);

        let mut trial = ScriptedTrial::new(8);
        match engine.run_trial(&mut trial).await.unwrap_err() {
            TunerError::Timeout { trial, waiting_for, .. } => {
                assert_eq!(trial, 8);
                assert_eq!(waiting_for, "step 1");
            }
            other => panic!("Expected Timeout, got: {:?}", other),
        }
        assert_eq!(trial.reports, vec![(0.5, 0)]);
        assert_eq!(scheduler.cancels(), vec![1008]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting_and_releases_the_job() {
        let store = InMemoryResultsStore::new("results.csv");
        let scheduler = Arc::new(RecordingScheduler::default());
        let cancellation = Cancellation::new();
        let engine = engine(&store, &scheduler).with_cancellation(cancellation.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(45)).await;
            cancellation.cancel();
        });

        let mut trial = ScriptedTrial::new(11);
        let err = engine.run_trial(&mut trial).await.unwrap_err();

        assert!(matches!(err, TunerError::Cancelled { trial: 11 }));
        assert_eq!(scheduler.cancels(), vec![1011]);
    }

    #[tokio::test(start_paused = true)]
    async fn non_finite_loss_fails_the_trial() {
        let store = InMemoryResultsStore::with_rows("results.csv", vec![row(12, 0, f64::NAN)]);
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine(&store, &scheduler);

        let mut trial = ScriptedTrial::new(12);
        let err = engine.run_trial(&mut trial).await.unwrap_err();

        assert!(matches!(err, TunerError::Evaluation { trial: 12, .. }));
        assert!(trial.reports.is_empty());
        assert_eq!(scheduler.cancels(), vec![1012]);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_terminal_loss_does_not_cancel_finished_job() {
        let store = InMemoryResultsStore::with_rows("results.csv", vec![row(13, 0, 0.7), row(13, -1, f64::INFINITY)]);
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine(&store, &scheduler);

        let mut trial = ScriptedTrial::new(13);
        let err = engine.run_trial(&mut trial).await.unwrap_err();

        assert!(matches!(err, TunerError::Evaluation { trial: 13, .. }));
        assert!(scheduler.cancels().is_empty());
        assert_eq!(engine.job_for_trial(13).unwrap().state, JobState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn objective_delegates_to_run_trial() {
        let store = InMemoryResultsStore::with_rows("results.csv", vec![row(0, -1, 1.25)]);
        let scheduler = Arc::new(RecordingScheduler::default());
        let objective: Arc<dyn Objective> = Arc::new(engine(&store, &scheduler));

        let mut trial = ScriptedTrial::new(0);
        assert_eq!(objective.evaluate(&mut trial).await.unwrap(), 1.25);
        assert_eq!(scheduler.submit_count(), 1);
    }
}
