//! Local mirror of a scheduler job.
//!
//! The scheduler owns the real job state; this is only what the engine saw
//! while driving one trial, and it is lost if the process dies.

use serde::{Deserialize, Serialize};

/// Scheduler-assigned job identifier.
pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Accepted by the scheduler, no results seen yet.
    Submitted,
    /// At least one result row has been observed.
    Running,
    /// A terminal row was observed.
    Finished,
    /// A cancel request was accepted by the scheduler.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub trial: u64,
    pub state: JobState,
}

impl Job {
    pub fn submitted(id: JobId, trial: u64) -> Self {
        Self {
            id,
            trial,
            state: JobState::Submitted,
        }
    }

    pub fn mark_running(&mut self) {
        if self.state == JobState::Submitted {
            self.state = JobState::Running;
        }
    }

    pub fn mark_finished(&mut self) {
        self.state = JobState::Finished;
    }

    pub fn mark_cancelled(&mut self) {
        self.state = JobState::Cancelled;
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, JobState::Submitted | JobState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_lifecycle() {
        let mut job = Job::submitted(1234, 7);
        assert!(job.is_active());

        job.mark_running();
        assert_eq!(job.state, JobState::Running);

        job.mark_finished();
        assert!(!job.is_active());

        // A late row must not resurrect a finished job.
        job.mark_running();
        assert_eq!(job.state, JobState::Finished);
    }

    #[test]
    fn cancelled_job_is_inactive() {
        let mut job = Job::submitted(1, 0);
        job.mark_cancelled();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(!job.is_active());
    }
}
