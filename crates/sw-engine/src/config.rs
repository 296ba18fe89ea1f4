//! Scheduler configuration and admission arithmetic.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use sw_types::{config_error, SweepResult, TrialSet};

use crate::cluster::Resources;

/// Per-run scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// CPUs reserved by each trial's worker.
    pub cpus_per_trial: f64,
    /// GPUs reserved by each trial's worker.
    pub gpus_per_trial: f64,
    /// Upper bound on how long one drain waits for a completion.
    pub refresh_wait_secs: f64,
    /// Pause between iterations with nothing outstanding and nothing dispatched.
    pub idle_wait_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            cpus_per_trial: 1.0,
            gpus_per_trial: 0.0,
            refresh_wait_secs: 30.0,
            idle_wait_ms: 50,
        }
    }
}

impl SearchConfig {
    pub fn with_resources(mut self, cpus_per_trial: f64, gpus_per_trial: f64) -> Self {
        self.cpus_per_trial = cpus_per_trial;
        self.gpus_per_trial = gpus_per_trial;
        self
    }

    pub fn with_refresh_wait(mut self, wait: Duration) -> Self {
        self.refresh_wait_secs = wait.as_secs_f64();
        self
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> SweepResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SweepResult<()> {
        if !(self.cpus_per_trial > 0.0) {
            return Err(config_error!("cpus_per_trial must be positive, got {}", self.cpus_per_trial));
        }
        if !(self.gpus_per_trial >= 0.0) {
            return Err(config_error!("gpus_per_trial must not be negative, got {}", self.gpus_per_trial));
        }
        if !(self.refresh_wait_secs > 0.0 && self.refresh_wait_secs.is_finite()) {
            return Err(config_error!("refresh_wait_secs must be positive, got {}", self.refresh_wait_secs));
        }
        Ok(())
    }

    pub fn per_trial(&self) -> Resources {
        Resources::new(self.cpus_per_trial, self.gpus_per_trial)
    }

    pub fn refresh_wait(&self) -> Duration {
        Duration::from_secs_f64(self.refresh_wait_secs)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

/// How many more trials fit in `available` at `per_trial` each.
pub fn admission_budget(available: Resources, per_trial: Resources) -> usize {
    let mut budget = floor_div(available.cpus, per_trial.cpus);
    if per_trial.gpus > 0.0 {
        budget = budget.min(floor_div(available.gpus, per_trial.gpus));
    }
    budget
}

/// Debug runs admit only once every tracked trial has finished.
pub fn debug_budget(trials: &TrialSet) -> usize {
    usize::from(trials.values().all(|t| t.is_finished()))
}

fn floor_div(available: f64, per_trial: f64) -> usize {
    if !(per_trial > 0.0) || !(available > 0.0) {
        return 0;
    }
    // Clamp before the cast so float noise never yields a negative count.
    (available / per_trial).floor().max(0.0) as usize
}
