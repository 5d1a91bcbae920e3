//! Polling protocol over a [`ResultsStore`].
//!
//! Jobs never notify us; the only way to learn about progress is to re-read the
//! store on a fixed interval. Both waits below are cancellable and can be given
//! a deadline.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use st_types::{ResultRow, TunerError, TunerResult};

use crate::store::ResultsStore;

/// Intervals and deadlines for the two polling phases.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Sleep between checks for the results file.
    pub file_interval: Duration,
    /// Sleep between re-reads while waiting for the next row.
    pub row_interval: Duration,
    /// Give up waiting for the results file after this long.
    pub file_timeout: Option<Duration>,
    /// Give up waiting for any single next row after this long.
    pub row_timeout: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            file_interval: Duration::from_secs(5),
            row_interval: Duration::from_secs(5),
            file_timeout: None,
            row_timeout: None,
        }
    }
}

impl PollConfig {
    pub fn with_intervals(file_interval: Duration, row_interval: Duration) -> Self {
        Self {
            file_interval,
            row_interval,
            ..Self::default()
        }
    }

    pub fn with_timeouts(mut self, file_timeout: Option<Duration>, row_timeout: Option<Duration>) -> Self {
        self.file_timeout = file_timeout;
        self.row_timeout = row_timeout;
        self
    }
}

/// Cooperative cancellation shared between a driver and its trial evaluations.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// What the next poll cycle found for a trial.
#[derive(Debug, Clone, PartialEq)]
pub enum PollSignal {
    /// The job wrote its final row.
    Terminal(ResultRow),
    /// The job wrote an intermediate row at or after the expected step.
    Step(ResultRow),
}

/// Polls one store on behalf of one trial.
#[derive(Debug)]
pub struct ResultsPoller<'a> {
    store: &'a dyn ResultsStore,
    config: &'a PollConfig,
    cancel: &'a Cancellation,
    trial: u64,
}

impl<'a> ResultsPoller<'a> {
    pub fn new(
        store: &'a dyn ResultsStore,
        config: &'a PollConfig,
        cancel: &'a Cancellation,
        trial: u64,
    ) -> Self {
        Self {
            store,
            config,
            cancel,
            trial,
        }
    }

    /// Block until the results store exists.
    pub async fn wait_for_store(&self) -> TunerResult<()> {
        let started = Instant::now();
        let deadline = self.config.file_timeout.map(|t| started + t);

        loop {
            self.check_cancelled()?;
            match self.store.exists().await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!(trial = self.trial, "results store {} not there yet", self.store.location()),
                Err(e) => warn!(trial = self.trial, "checking results store failed, retrying: {}", e),
            }
            self.check_deadline(deadline, started, "the results store")?;
            self.pause(self.config.file_interval, deadline).await?;
        }
    }

    /// Block until a terminal row, or an intermediate row at step `>= expected_step`, exists.
    ///
    /// A terminal row always takes precedence over an intermediate one seen on
    /// the same cycle. If the expected step is missing but a later one is
    /// present, the later row is returned and the gap is logged.
    pub async fn wait_for_signal(&self, expected_step: i64) -> TunerResult<PollSignal> {
        let started = Instant::now();
        let deadline = self.config.row_timeout.map(|t| started + t);

        loop {
            self.check_cancelled()?;
            match self.store.load_trial(self.trial).await {
                Ok(rows) => {
                    if !rows.invalid_steps().is_empty() {
                        warn!(trial = self.trial, steps = ?rows.invalid_steps(), "ignoring rows with invalid step numbers");
                    }

                    if let Some(row) = rows.terminal() {
                        if rows.is_duplicate(row.step) {
                            warn!(trial = self.trial, "multiple terminal rows; using the first");
                        }
                        return Ok(PollSignal::Terminal(row.clone()));
                    }

                    if let Some(row) = rows.next_from(expected_step) {
                        if row.step > expected_step {
                            warn!(
                                trial = self.trial,
                                "step {} missing, continuing from step {}",
                                expected_step,
                                row.step
                            );
                        }
                        if rows.is_duplicate(row.step) {
                            warn!(trial = self.trial, "multiple rows for step {}; using the first", row.step);
                        }
                        return Ok(PollSignal::Step(row.clone()));
                    }

                    debug!(trial = self.trial, step = expected_step, "no new rows");
                }
                Err(e) if is_transient(&e) => {
                    warn!(trial = self.trial, "reading results failed, retrying: {}", e);
                }
                Err(e) => return Err(e),
            }
            self.check_deadline(deadline, started, &format!("step {expected_step}"))?;
            self.pause(self.config.row_interval, deadline).await?;
        }
    }

    fn check_cancelled(&self) -> TunerResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TunerError::Cancelled { trial: self.trial });
        }
        Ok(())
    }

    fn check_deadline(&self, deadline: Option<Instant>, started: Instant, waiting_for: &str) -> TunerResult<()> {
        match deadline {
            Some(deadline) if Instant::now() >= deadline => Err(TunerError::Timeout {
                trial: self.trial,
                waiting_for: waiting_for.to_string(),
                waited_secs: started.elapsed().as_secs(),
            }),
            _ => Ok(()),
        }
    }

    async fn pause(&self, interval: Duration, deadline: Option<Instant>) -> TunerResult<()> {
        let mut wake = Instant::now() + interval;
        if let Some(deadline) = deadline {
            wake = wake.min(deadline);
        }
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => Ok(()),
            _ = self.cancel.cancelled() => Err(TunerError::Cancelled { trial: self.trial }),
        }
    }
}

/// Errors a concurrent writer can cause for a single read; the next cycle may succeed.
fn is_transient(err: &TunerError) -> bool {
    use st_types::ResultsError;

    matches!(
        err,
        TunerError::Io(_)
            | TunerError::Results(ResultsError::SourceNotFound(_))
            | TunerError::Results(ResultsError::ParseError { .. })
    )
}
