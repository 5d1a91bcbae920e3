//! SLURM client built on `sbatch` / `scancel`.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use st_types::{CancellationError, JobId, SubmissionError, TunerResult};

use crate::scheduler::{CommandLine, JobCanceller, JobSubmitter, Scheduler, SubmitRequest};

static SUBMITTED_JOB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Submitted batch job (\d+)").expect("Invalid sbatch response regex"));

/// Extract the job id from `sbatch` output.
pub fn parse_job_id(output: &str) -> Option<JobId> {
    SUBMITTED_JOB_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Which programs to run for submission and cancellation.
///
/// `submit_args` / `cancel_args` are inserted right after the program, which
/// is where site-specific flags such as `--partition` go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlurmConfig {
    #[serde(default = "default_submit_program")]
    pub submit_program: String,
    #[serde(default)]
    pub submit_args: Vec<String>,
    #[serde(default = "default_cancel_program")]
    pub cancel_program: String,
    #[serde(default)]
    pub cancel_args: Vec<String>,
}

fn default_submit_program() -> String {
    "sbatch".to_string()
}

fn default_cancel_program() -> String {
    "scancel".to_string()
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            submit_program: default_submit_program(),
            submit_args: Vec::new(),
            cancel_program: default_cancel_program(),
            cancel_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SlurmScheduler {
    config: SlurmConfig,
}

impl SlurmScheduler {
    pub fn new(config: SlurmConfig) -> Self {
        Self { config }
    }

    pub fn submit_command(&self, request: &SubmitRequest) -> CommandLine {
        let mut args = self.config.submit_args.clone();
        args.extend(request.submission_args());
        CommandLine {
            program: self.config.submit_program.clone(),
            args,
        }
    }

    pub fn cancel_command(&self, job_id: JobId) -> CommandLine {
        let mut args = self.config.cancel_args.clone();
        args.push(job_id.to_string());
        CommandLine {
            program: self.config.cancel_program.clone(),
            args,
        }
    }

    async fn run(cmd: &CommandLine) -> std::io::Result<std::process::Output> {
        debug!("Running `{}`", cmd);
        Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .output()
            .await
    }
}

#[async_trait]
impl JobSubmitter for SlurmScheduler {
    async fn submit(&self, request: &SubmitRequest) -> TunerResult<JobId> {
        let cmd = self.submit_command(request);

        let output = Self::run(&cmd).await.map_err(|e| {
            error!(trial = request.trial, "Error submitting SLURM job: {}", e);
            SubmissionError::Spawn {
                command: cmd.to_string(),
                message: e.to_string(),
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(trial = request.trial, "Error submitting SLURM job: {} ({})", output.status, stderr);
            return Err(SubmissionError::CommandFailed {
                command: cmd.to_string(),
                status: output.status.to_string(),
                stderr,
            }
            .into());
        }

        let job_id = parse_job_id(&stdout).ok_or_else(|| {
            error!(trial = request.trial, "Unrecognized sbatch response: {:?}", stdout.trim());
            SubmissionError::UnrecognizedResponse {
                command: cmd.to_string(),
                output: stdout.trim().to_string(),
            }
        })?;

        info!(job_id, trial = request.trial, "SLURM job {} submitted with trial ID: {}", job_id, request.trial);
        info!(trial = request.trial, "Parameters: {}", request.params);
        Ok(job_id)
    }
}

#[async_trait]
impl JobCanceller for SlurmScheduler {
    async fn cancel(&self, job_id: JobId) -> TunerResult<()> {
        let cmd = self.cancel_command(job_id);

        let output = Self::run(&cmd).await.map_err(|e| {
            warn!(job_id, "Error cancelling SLURM job, resources have to be released manually: {}", e);
            CancellationError::Spawn {
                job_id,
                message: e.to_string(),
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                job_id,
                "Error cancelling SLURM job, resources have to be released manually: {} ({})",
                output.status,
                stderr
            );
            return Err(CancellationError::CommandFailed {
                job_id,
                status: output.status.to_string(),
                stderr,
            }
            .into());
        }

        info!(job_id, "SLURM job {} cancel requested", job_id);
        Ok(())
    }
}

impl Scheduler for SlurmScheduler {
    fn name(&self) -> &str {
        "slurm"
    }
}
