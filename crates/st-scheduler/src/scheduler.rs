//! Scheduler abstraction used by the evaluation engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use st_types::{JobId, TrialParams, TunerResult};

/// Everything needed to launch the job for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Job script handed to the scheduler.
    pub script: String,
    /// Where the job should append its result rows.
    pub results_location: String,
    pub trial: u64,
    /// Parameter values, already resolved, in declaration order.
    pub params: TrialParams,
}

impl SubmitRequest {
    pub fn new(
        script: impl Into<String>,
        results_location: impl Into<String>,
        trial: u64,
        params: TrialParams,
    ) -> Self {
        Self {
            script: script.into(),
            results_location: results_location.into(),
            trial,
            params,
        }
    }

    /// Arguments following the submit program: script, results location, trial, then every value.
    pub fn submission_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.params.len() + 3);
        args.push(self.script.clone());
        args.push(self.results_location.clone());
        args.push(self.trial.to_string());
        args.extend(self.params.values().map(|v| v.to_string()));
        args
    }
}

/// A program plus its arguments, as it will be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Launches one batch job per trial.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Submit the job and return the identifier the scheduler assigned.
    ///
    /// Never retried by callers: a second submission would launch a second job.
    async fn submit(&self, request: &SubmitRequest) -> TunerResult<JobId>;
}

/// Asks the scheduler to stop a job.
#[async_trait]
pub trait JobCanceller: Send + Sync {
    /// Success only means the request was accepted, not that the job has stopped writing.
    async fn cancel(&self, job_id: JobId) -> TunerResult<()>;
}

/// A scheduler that can both submit and cancel.
pub trait Scheduler: JobSubmitter + JobCanceller + fmt::Debug {
    fn name(&self) -> &str;
}
