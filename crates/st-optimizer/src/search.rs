//! Random parameter sampling.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use st_types::{FloatRange, IntRange, ParameterSampler, TunerResult};

/// Independent random sampling across the search space.
///
/// Each trial gets its own sampler; with a study seed the stream for trial `n`
/// depends only on `(seed, n)`, so concurrent trials stay reproducible.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    rng: StdRng,
}

impl RandomSampler {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn for_trial(study_seed: Option<u64>, trial: u64) -> Self {
        match study_seed {
            // Spread trial numbers so neighbouring trials do not get neighbouring seeds.
            Some(seed) => Self::seeded(seed ^ trial.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => Self::new(),
        }
    }

    fn sample_int(&mut self, range: &IntRange) -> i64 {
        if range.log {
            let log_low = (range.low as f64).ln();
            let log_high = (range.high as f64 + 1.0).ln();
            let v = self.rng.random_range(log_low..log_high).exp().floor() as i64;
            return v.clamp(range.low, range.high);
        }
        // Offsets are unsigned so ranges spanning most of i64 cannot overflow.
        let step = range.step.max(1) as u64;
        let slots = range.high.abs_diff(range.low) / step;
        let offset = self.rng.random_range(0..=slots) * step;
        range.low.checked_add_unsigned(offset).unwrap_or(range.high)
    }

    fn sample_float(&mut self, range: &FloatRange) -> f64 {
        if range.low == range.high {
            return range.low;
        }
        if range.log {
            let log_low = range.low.ln();
            let log_high = range.high.ln();
            let log_val: f64 = self.rng.random_range(log_low..=log_high);
            return log_val.exp().clamp(range.low, range.high);
        }
        match range.step {
            Some(step) => {
                let slots = ((range.high - range.low) / step).floor() as u64;
                let k = self.rng.random_range(0..=slots);
                (range.low + k as f64 * step).min(range.high)
            }
            None => self.rng.random_range(range.low..=range.high),
        }
    }
}

impl Default for RandomSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterSampler for RandomSampler {
    fn suggest_int(&mut self, _name: &str, range: &IntRange) -> TunerResult<i64> {
        Ok(self.sample_int(range))
    }

    fn suggest_float(&mut self, _name: &str, range: &FloatRange) -> TunerResult<f64> {
        Ok(self.sample_float(range))
    }

    fn suggest_categorical(&mut self, name: &str, choices: &[Value]) -> TunerResult<Value> {
        if choices.is_empty() {
            return Err(st_types::config_error!("parameter '{}': no choices", name));
        }
        let idx = self.rng.random_range(0..choices.len());
        Ok(choices[idx].clone())
    }
}
