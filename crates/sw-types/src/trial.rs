//! Trial state machine.
//!
//! ```text
//! CREATED -> RESUMING -> RUNNING -> { HAS_RESULT | TERMINATED | ERROR }
//! HAS_RESULT -> { RESUMING | PAUSED | TERMINATED }
//! PAUSED     -> { RESUMING | TERMINATED }
//! ```
//!
//! TERMINATED and ERROR are terminal. Every status change goes through
//! [`Trial::transition`], which rejects edges outside this graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::TransitionError;
use crate::params::Assignment;

/// Unique trial identifier. Also the name of the trial's output directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(String);

impl TrialId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Sequential id such as `grid_0003`.
    pub fn numbered(prefix: &str, number: usize) -> Self {
        Self(format!("{prefix}_{number:04}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrialId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialStatus {
    Created,
    Resuming,
    Running,
    HasResult,
    Paused,
    Terminated,
    Error,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TrialStatus::Terminated | TrialStatus::Error)
    }

    /// Whether `self -> next` is an edge of the trial graph.
    pub fn can_transition_to(self, next: TrialStatus) -> bool {
        use TrialStatus::*;
        matches!(
            (self, next),
            (Created, Resuming)
                | (Resuming, Running)
                | (Running, HasResult)
                | (Running, Terminated)
                | (Running, Error)
                | (HasResult, Resuming)
                | (HasResult, Paused)
                | (HasResult, Terminated)
                | (Paused, Resuming)
                | (Paused, Terminated)
        )
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrialStatus::Created => "CREATED",
            TrialStatus::Resuming => "RESUMING",
            TrialStatus::Running => "RUNNING",
            TrialStatus::HasResult => "HAS_RESULT",
            TrialStatus::Paused => "PAUSED",
            TrialStatus::Terminated => "TERMINATED",
            TrialStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// One hyperparameter assignment under evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    #[serde(with = "crate::params::dotted_keys")]
    pub parameters: Assignment,
    status: TrialStatus,
    /// Latest metric reported by a continuing step. Algorithms that want a
    /// running best across resumes keep it themselves.
    pub best_metric: Option<f64>,
    pub steps_completed: usize,
    history: Vec<TrialStatus>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(id: TrialId, parameters: Assignment) -> Self {
        Self {
            id,
            parameters,
            status: TrialStatus::Created,
            best_metric: None,
            steps_completed: 0,
            history: vec![TrialStatus::Created],
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> TrialStatus {
        self.status
    }

    /// Every status this trial has held, oldest first.
    pub fn history(&self) -> &[TrialStatus] {
        &self.history
    }

    pub fn transition(&mut self, next: TrialStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                trial: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        if next == TrialStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.status = next;
        self.history.push(next);
        Ok(())
    }

    pub fn set_resume(&mut self) -> Result<(), TransitionError> {
        self.transition(TrialStatus::Resuming)
    }

    pub fn set_running(&mut self) -> Result<(), TransitionError> {
        self.transition(TrialStatus::Running)
    }

    pub fn set_has_result(&mut self) -> Result<(), TransitionError> {
        self.transition(TrialStatus::HasResult)
    }

    pub fn set_paused(&mut self) -> Result<(), TransitionError> {
        self.transition(TrialStatus::Paused)
    }

    pub fn set_terminated(&mut self) -> Result<(), TransitionError> {
        self.transition(TrialStatus::Terminated)
    }

    pub fn set_error(&mut self) -> Result<(), TransitionError> {
        self.transition(TrialStatus::Error)
    }

    /// Overwrite the recorded metric with the latest observation.
    pub fn set_metric(&mut self, metric: Option<f64>) {
        self.best_metric = metric;
    }

    pub fn record_step(&mut self) {
        self.steps_completed += 1;
    }

    pub fn is_created(&self) -> bool {
        self.status == TrialStatus::Created
    }

    pub fn is_resuming(&self) -> bool {
        self.status == TrialStatus::Resuming
    }

    pub fn is_running(&self) -> bool {
        self.status == TrialStatus::Running
    }

    pub fn has_result(&self) -> bool {
        self.status == TrialStatus::HasResult
    }

    pub fn is_paused(&self) -> bool {
        self.status == TrialStatus::Paused
    }

    pub fn is_terminated(&self) -> bool {
        self.status == TrialStatus::Terminated
    }

    pub fn is_error(&self) -> bool {
        self.status == TrialStatus::Error
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// All trials of a run, ordered by id.
pub type TrialSet = BTreeMap<TrialId, Trial>;

/// What one worker step reports back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub should_continue: bool,
    pub metric: Option<f64>,
}

impl StepOutcome {
    pub fn new(should_continue: bool, metric: Option<f64>) -> Self {
        Self {
            should_continue,
            metric,
        }
    }

    /// Clean stop with nothing to report.
    pub fn finished() -> Self {
        Self::new(false, None)
    }
}

/// Check that `history` is a walk of the trial graph starting at CREATED.
pub fn is_valid_walk(history: &[TrialStatus]) -> bool {
    match history.split_first() {
        Some((TrialStatus::Created, rest)) => {
            let mut current = TrialStatus::Created;
            for next in rest {
                if !current.can_transition_to(*next) {
                    return false;
                }
                current = *next;
            }
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParamPath, ParameterValue};

    fn sample_trial() -> Trial {
        let mut params = Assignment::new();
        params.insert(ParamPath::from("lr"), ParameterValue::Float(0.01));
        Trial::new(TrialId::numbered("grid", 1), params)
    }

    #[test]
    fn trial_lifecycle() {
        let mut trial = sample_trial();
        assert!(trial.is_created());
        assert_eq!(trial.id.as_str(), "grid_0001");

        trial.set_resume().unwrap();
        trial.set_running().unwrap();
        assert!(trial.started_at.is_some());

        trial.set_metric(Some(0.8));
        trial.set_has_result().unwrap();
        trial.set_resume().unwrap();
        trial.set_running().unwrap();
        trial.set_terminated().unwrap();

        assert!(trial.is_finished());
        assert!(trial.finished_at.is_some());
        assert_eq!(trial.best_metric, Some(0.8));
        assert!(is_valid_walk(trial.history()));
    }

    #[test]
    fn trial_failure() {
        let mut trial = sample_trial();
        trial.set_resume().unwrap();
        trial.set_running().unwrap();
        trial.set_error().unwrap();
        assert!(trial.is_error());
        assert!(trial.status().is_terminal());
    }

    #[test]
    fn terminal_states_reject_everything() {
        let mut trial = sample_trial();
        trial.set_resume().unwrap();
        trial.set_running().unwrap();
        trial.set_terminated().unwrap();

        let err = trial.set_resume().unwrap_err();
        assert_eq!(err.from, TrialStatus::Terminated);
        assert_eq!(err.to, TrialStatus::Resuming);
        assert!(trial.is_terminated());
    }

    #[test]
    fn created_is_never_revisited() {
        for status in [
            TrialStatus::Created,
            TrialStatus::Resuming,
            TrialStatus::Running,
            TrialStatus::HasResult,
            TrialStatus::Paused,
            TrialStatus::Terminated,
            TrialStatus::Error,
        ] {
            assert!(!status.can_transition_to(TrialStatus::Created));
        }
    }

    #[test]
    fn created_cannot_skip_to_running() {
        let mut trial = sample_trial();
        assert!(trial.set_running().is_err());
        assert!(trial.set_error().is_err());
        assert_eq!(trial.history(), &[TrialStatus::Created]);
    }

    #[test]
    fn paused_trial_can_resume_or_stop() {
        let mut trial = sample_trial();
        trial.set_resume().unwrap();
        trial.set_running().unwrap();
        trial.set_has_result().unwrap();
        trial.set_paused().unwrap();
        assert!(trial.is_paused());
        trial.set_resume().unwrap();
        assert!(trial.is_resuming());
    }

    #[test]
    fn walk_validation() {
        use TrialStatus::*;
        assert!(is_valid_walk(&[Created, Resuming, Running, Error]));
        assert!(!is_valid_walk(&[Resuming, Running]));
        assert!(!is_valid_walk(&[Created, Running]));
        assert!(!is_valid_walk(&[]));
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&TrialStatus::HasResult).unwrap();
        assert_eq!(json, "\"HAS_RESULT\"");
        assert_eq!(TrialStatus::HasResult.to_string(), "HAS_RESULT");
    }
}
