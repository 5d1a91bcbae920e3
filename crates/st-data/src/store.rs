use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use st_types::{ResultRow, ResultsError, TunerResult, STEP_COLUMN, TRIAL_COLUMN};

use crate::rows::TrialRows;

/// Read-only view over the shared results written by remote jobs.
#[async_trait]
pub trait ResultsStore: Send + Sync + std::fmt::Debug {
    /// Location passed to jobs on their command line so they know where to append.
    fn location(&self) -> String;

    /// Whether the store has been created yet.
    async fn exists(&self) -> TunerResult<bool>;

    /// Re-read the store and return every row belonging to `trial`.
    async fn load_trial(&self, trial: u64) -> TunerResult<TrialRows>;
}

/// Results kept in a CSV file shared with the cluster.
///
/// The file must have a header with at least `trial` and `step` columns. Jobs
/// append to it concurrently, so every read re-parses the whole file and only
/// complete lines are considered.
#[derive(Debug, Clone)]
pub struct CsvResultsStore {
    path: PathBuf,
}

impl CsvResultsStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse CSV bytes into rows, tolerating a trailing partially written line.
    pub fn parse_rows(bytes: &[u8]) -> TunerResult<Vec<ResultRow>> {
        use csv::ReaderBuilder;

        // A job may be halfway through appending; drop everything after the last newline.
        let complete = match bytes.iter().rposition(|b| *b == b'\n') {
            Some(pos) => &bytes[..=pos],
            None => return Ok(Vec::new()),
        };

        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(complete);

        let headers = rdr
            .headers()
            .map_err(|e| ResultsError::ParseError {
                message: format!("Failed to read CSV headers: {}", e),
            })?
            .clone();

        let trial_idx = Self::column_index(&headers, TRIAL_COLUMN)?;
        let step_idx = Self::column_index(&headers, STEP_COLUMN)?;

        // Other trials share the file, so one bad record must not hide the rest.
        let mut rows = Vec::new();
        for (line_num, result) in rdr.byte_records().enumerate() {
            let raw = match result {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Skipping unreadable results line {}: {}", line_num + 2, e);
                    continue;
                }
            };
            let record = match csv::StringRecord::from_byte_record(raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping results line {}: {}", line_num + 2, e.utf8_error());
                    continue;
                }
            };

            if record.len() != headers.len() {
                warn!(
                    "Skipping results line {}: {} fields, expected {}",
                    line_num + 2,
                    record.len(),
                    headers.len()
                );
                continue;
            }

            match Self::parse_record(&record, &headers, trial_idx, step_idx) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!("Skipping invalid results line {}: {}", line_num + 2, e);
                    continue;
                }
            }
        }

        Ok(rows)
    }

    fn column_index(headers: &csv::StringRecord, column: &str) -> TunerResult<usize> {
        headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(column))
            .ok_or_else(|| {
                ResultsError::MissingColumn {
                    column: column.to_string(),
                }
                .into()
            })
    }

    fn parse_record(
        record: &csv::StringRecord,
        headers: &csv::StringRecord,
        trial_idx: usize,
        step_idx: usize,
    ) -> TunerResult<ResultRow> {
        let trial = Self::parse_integer::<u64>(record, trial_idx, TRIAL_COLUMN)?;
        let step = Self::parse_integer::<i64>(record, step_idx, STEP_COLUMN)?;

        let mut row = ResultRow::new(trial, step);
        for (i, (header, value)) in headers.iter().zip(record.iter()).enumerate() {
            if i != trial_idx && i != step_idx {
                row.metrics.insert(header.to_string(), value.to_string());
            }
        }
        Ok(row)
    }

    /// Integers may be written as `3` or `3.0` depending on the writer.
    fn parse_integer<T>(record: &csv::StringRecord, idx: usize, column: &str) -> TunerResult<T>
    where
        T: std::str::FromStr + TryFrom<i64>,
    {
        let raw = record.get(idx).unwrap_or("");
        let invalid = || ResultsError::InvalidValue {
            column: column.to_string(),
            value: raw.to_string(),
        };

        if let Ok(value) = raw.parse::<T>() {
            return Ok(value);
        }
        let float = raw.parse::<f64>().map_err(|_| invalid())?;
        if float.fract() != 0.0 || !float.is_finite() {
            return Err(invalid().into());
        }
        T::try_from(float as i64).map_err(|_| invalid().into())
    }
}

#[async_trait]
impl ResultsStore for CsvResultsStore {
    fn location(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    async fn exists(&self) -> TunerResult<bool> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    async fn load_trial(&self, trial: u64) -> TunerResult<TrialRows> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResultsError::SourceNotFound(self.location()).into());
            }
            Err(e) => return Err(e.into()),
        };

        let rows = Self::parse_rows(&bytes)?;
        debug!("Read {} result rows from {}", rows.len(), self.path.display());
        Ok(TrialRows::from_rows(trial, rows))
    }
}

/// Results held in memory; shares its rows between clones.
///
/// Useful for simulations and tests, where a fake scheduler appends rows the
/// way a remote job would.
#[derive(Debug, Clone, Default)]
pub struct InMemoryResultsStore {
    name: String,
    rows: Arc<RwLock<Option<Vec<ResultRow>>>>,
    reads: Arc<AtomicUsize>,
}

impl InMemoryResultsStore {
    /// A store that does not exist until the first row is appended.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_rows(name: impl Into<String>, rows: Vec<ResultRow>) -> Self {
        let store = Self::new(name);
        *store.rows.write() = Some(rows);
        store
    }

    pub fn create(&self) {
        self.rows.write().get_or_insert_with(Vec::new);
    }

    pub fn append(&self, row: ResultRow) {
        self.rows.write().get_or_insert_with(Vec::new).push(row);
    }

    /// Number of `exists`/`load_trial` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultsStore for InMemoryResultsStore {
    fn location(&self) -> String {
        self.name.clone()
    }

    async fn exists(&self) -> TunerResult<bool> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.read().is_some())
    }

    async fn load_trial(&self, trial: u64) -> TunerResult<TrialRows> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let guard = self.rows.read();
        let rows = guard
            .as_ref()
            .ok_or_else(|| ResultsError::SourceNotFound(self.name.clone()))?;
        Ok(TrialRows::from_rows(trial, rows.iter().cloned()))
    }
}
