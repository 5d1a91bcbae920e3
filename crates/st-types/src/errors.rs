use thiserror::Error;

/// Main error type for slurm-tuner
#[derive(Error, Debug)]
pub enum TunerError {
    #[error("Submission error: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Cancellation error: {0}")]
    Cancellation(#[from] CancellationError),

    #[error("Results error: {0}")]
    Results(#[from] ResultsError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Loss evaluation failed for trial {trial}: {message}")]
    Evaluation { trial: u64, message: String },

    #[error("Trial {trial} pruned at step {step}")]
    TrialPruned { trial: u64, step: i64 },

    #[error("Trial {trial} timed out after {waited_secs}s waiting for {waiting_for}")]
    Timeout {
        trial: u64,
        waiting_for: String,
        waited_secs: u64,
    },

    #[error("Trial {trial} cancelled")]
    Cancelled { trial: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunerError {
    /// Pruning is a deliberate early stop, not a defect.
    pub fn is_pruned(&self) -> bool {
        matches!(self, TunerError::TrialPruned { .. })
    }
}

/// Scheduler submission errors
#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("Failed to launch `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Unrecognized response from `{command}`: {output:?}")]
    UnrecognizedResponse { command: String, output: String },
}

/// Scheduler cancellation errors
#[derive(Error, Debug)]
pub enum CancellationError {
    #[error("Failed to launch cancel for job {job_id}: {message}")]
    Spawn { job_id: u64, message: String },

    #[error("Cancel for job {job_id} exited with {status}: {stderr}")]
    CommandFailed {
        job_id: u64,
        status: String,
        stderr: String,
    },
}

/// Results store errors
#[derive(Error, Debug)]
pub enum ResultsError {
    #[error("Results source not found: {0}")]
    SourceNotFound(String),

    #[error("Missing required column: {column}")]
    MissingColumn { column: String },

    #[error("Invalid value {value:?} in column {column}")]
    InvalidValue { column: String, value: String },

    #[error("Results parsing error: {message}")]
    ParseError { message: String },
}

/// Result type alias for slurm-tuner operations
pub type TunerResult<T> = Result<T, TunerError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TunerError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SubmissionError::UnrecognizedResponse {
            command: "sbatch job.submit".to_string(),
            output: "queue full".to_string(),
        };

        assert!(error.to_string().contains("sbatch job.submit"));
        assert!(error.to_string().contains("queue full"));
    }

    #[test]
    fn test_error_conversion() {
        let cancel_error = CancellationError::CommandFailed {
            job_id: 42,
            status: "exit status: 1".to_string(),
            stderr: "Invalid job id".to_string(),
        };
        let err: TunerError = cancel_error.into();

        match err {
            TunerError::Cancellation(_) => (),
            _ => panic!("Expected Cancellation error"),
        }
    }

    #[test]
    fn test_pruned_is_not_a_failure() {
        assert!(TunerError::TrialPruned { trial: 3, step: 1 }.is_pruned());
        assert!(!config_error!("bad kind {}", "foo").is_pruned());
    }

    #[test]
    fn test_macros() {
        let config_err = config_error!("Unknown parameter kind: {}", "integer");
        assert!(matches!(config_err, TunerError::Config(_)));
        assert_eq!(config_err.to_string(), "Configuration error: Unknown parameter kind: integer");
    }
}
