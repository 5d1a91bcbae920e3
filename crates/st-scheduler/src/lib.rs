//! # st-scheduler
//!
//! Client side of the batch scheduler: submitting one job per trial and
//! cancelling it when the trial is pruned.

mod scheduler;
mod slurm;

pub use scheduler::{CommandLine, JobCanceller, JobSubmitter, Scheduler, SubmitRequest};
pub use slurm::{parse_job_id, SlurmConfig, SlurmScheduler};
