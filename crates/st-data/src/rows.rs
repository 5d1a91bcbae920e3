//! Per-trial index over result rows.

use std::collections::BTreeMap;

use st_types::{ResultRow, TERMINAL_STEP};

/// The rows of a single trial, indexed by step.
///
/// When the same `(trial, step)` appears more than once the first row in
/// store order is kept and the step is recorded in `duplicate_steps`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialRows {
    trial: u64,
    steps: BTreeMap<i64, ResultRow>,
    duplicate_steps: Vec<i64>,
    invalid_steps: Vec<i64>,
}

impl TrialRows {
    pub fn from_rows<I>(trial: u64, rows: I) -> Self
    where
        I: IntoIterator<Item = ResultRow>,
    {
        let mut index = Self {
            trial,
            ..Self::default()
        };

        for row in rows.into_iter().filter(|r| r.trial == trial) {
            if row.step < TERMINAL_STEP {
                index.invalid_steps.push(row.step);
                continue;
            }
            if index.steps.contains_key(&row.step) {
                if !index.duplicate_steps.contains(&row.step) {
                    index.duplicate_steps.push(row.step);
                }
                continue;
            }
            index.steps.insert(row.step, row);
        }

        index
    }

    pub fn trial(&self) -> u64 {
        self.trial
    }

    pub fn terminal(&self) -> Option<&ResultRow> {
        self.steps.get(&TERMINAL_STEP)
    }

    pub fn at(&self, step: i64) -> Option<&ResultRow> {
        self.steps.get(&step)
    }

    /// The lowest intermediate row whose step is `>= step`.
    pub fn next_from(&self, step: i64) -> Option<&ResultRow> {
        self.steps.range(step.max(0)..).next().map(|(_, row)| row)
    }

    pub fn is_duplicate(&self, step: i64) -> bool {
        self.duplicate_steps.contains(&step)
    }

    pub fn duplicate_steps(&self) -> &[i64] {
        &self.duplicate_steps
    }

    /// Steps below the terminal sentinel, which no job should write.
    pub fn invalid_steps(&self) -> &[i64] {
        &self.invalid_steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(trial: u64, step: i64, loss: f64) -> ResultRow {
        ResultRow::new(trial, step).with_metric("loss", loss)
    }

    #[test]
    fn filters_by_trial_and_indexes_steps() {
        let rows = vec![row(1, 0, 0.5), row(2, 0, 0.7), row(1, 1, 0.4), row(1, -1, 0.3)];
        let index = TrialRows::from_rows(1, rows);

        assert_eq!(index.trial(), 1);
        assert_eq!(index.len(), 3);
        assert_eq!(index.at(1).unwrap().metric("loss").unwrap(), 0.4);
        assert_eq!(index.terminal().unwrap().metric("loss").unwrap(), 0.3);
        assert!(index.at(2).is_none());
    }

    #[test]
    fn first_duplicate_wins() {
        let rows = vec![row(4, 0, 0.9), row(4, 0, 0.1), row(4, 0, 0.2)];
        let index = TrialRows::from_rows(4, rows);

        assert_eq!(index.at(0).unwrap().metric("loss").unwrap(), 0.9);
        assert_eq!(index.duplicate_steps(), &[0]);
        assert!(index.is_duplicate(0));
    }

    #[test]
    fn next_from_skips_gaps_and_ignores_terminal() {
        let rows = vec![row(5, 2, 0.2), row(5, -1, 0.1), row(5, 4, 0.05)];
        let index = TrialRows::from_rows(5, rows);

        assert_eq!(index.next_from(0).unwrap().step, 2);
        assert_eq!(index.next_from(3).unwrap().step, 4);
        assert!(index.next_from(5).is_none());
    }

    #[test]
    fn steps_below_sentinel_are_set_aside() {
        let index = TrialRows::from_rows(1, vec![row(1, -3, 0.0)]);
        assert!(index.is_empty());
        assert_eq!(index.invalid_steps(), &[-3]);
    }
}
