//! One trial's execution unit: materialize, step, checkpoint, report.

use tracing::{debug, info, info_span, warn};

use sw_types::{CheckpointError, Environment, ExecutionFault, StepOutcome, TaskError, TrialId};

use crate::checkpoint::Checkpoint;
use crate::logging::TrialLogging;
use crate::schema::Schema;
use crate::task::Searchable;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl From<WorkerError> for ExecutionFault {
    fn from(error: WorkerError) -> Self {
        match error {
            WorkerError::Checkpoint(e) => ExecutionFault::Checkpoint {
                message: e.to_string(),
            },
            WorkerError::Task(e) => ExecutionFault::Task {
                message: e.to_string(),
            },
        }
    }
}

/// Bound to a single trial for as long as the trial holds resources.
///
/// The task is built on the first [`Worker::step`], once the trial's output
/// path and environment are final. Nothing is retried here; errors go back to
/// the caller as they are.
pub struct Worker {
    trial: TrialId,
    schema: Schema,
    checkpoint: Checkpoint,
    environment: Environment,
    searchable: Option<Box<dyn Searchable>>,
    logging: TrialLogging,
    steps: usize,
}

impl Worker {
    pub fn new(trial: TrialId, schema: Schema, checkpoint: Checkpoint, environment: Environment) -> Self {
        let logging = TrialLogging::new(trial.clone(), &checkpoint.path);
        Self {
            trial,
            schema,
            checkpoint,
            environment,
            searchable: None,
            logging,
            steps: 0,
        }
    }

    pub fn trial(&self) -> &TrialId {
        &self.trial
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn step(&mut self) -> Result<StepOutcome, WorkerError> {
        let span = info_span!("trial", trial = %self.trial);
        let _enter = span.enter();

        if self.searchable.is_none() {
            if let Err(e) = self.logging.setup() {
                warn!(path = %self.logging.path().display(), error = %e, "trial log unavailable");
            }
            match self.schema.build()?.into_searchable() {
                Some(searchable) => self.searchable = Some(searchable),
                None => {
                    info!(task = self.schema.task_name(), "task cannot be stepped, finishing trial");
                    return Ok(StepOutcome::finished());
                }
            }
        }
        let Some(searchable) = self.searchable.as_mut() else {
            return Ok(StepOutcome::finished());
        };

        let should_continue = searchable.step(&self.environment)?;
        let metric = searchable.metric(&self.environment)?;
        self.checkpoint.set(&searchable.state()?)?;
        self.steps += 1;

        let outcome = StepOutcome::new(should_continue, metric);
        if let Err(e) = self.logging.record_step(self.steps, &outcome) {
            warn!(step = self.steps, error = %e, "trial log write failed");
        }
        debug!(step = self.steps, should_continue, ?metric, "step finished");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use serde_json::json;
    use std::path::Path;

    struct Countdown {
        left: u32,
    }

    impl Task for Countdown {
        fn into_searchable(self: Box<Self>) -> Option<Box<dyn Searchable>> {
            Some(self)
        }
    }

    impl Searchable for Countdown {
        fn step(&mut self, _env: &Environment) -> Result<bool, TaskError> {
            if self.left == 0 {
                return Err(TaskError::step("already finished"));
            }
            self.left -= 1;
            Ok(self.left > 0)
        }

        fn metric(&self, _env: &Environment) -> Result<Option<f64>, TaskError> {
            Ok(Some(f64::from(self.left)))
        }

        fn state(&self) -> Result<serde_json::Value, TaskError> {
            Ok(json!({ "left": self.left }))
        }
    }

    struct Opaque;

    impl Task for Opaque {}

    fn worker(dir: &Path, schema: Schema) -> Worker {
        let trial_dir = dir.join("trial");
        Worker::new(
            TrialId::new("trial"),
            schema,
            Checkpoint::new(&trial_dir, "localhost", "tester"),
            Environment::new(&trial_dir),
        )
    }

    fn countdown_schema(left: u32) -> Schema {
        Schema::from_fn("countdown", move |_| Ok(Box::new(Countdown { left }) as Box<dyn Task>))
    }

    #[test]
    fn steps_until_task_stops_and_checkpoints_each_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = worker(dir.path(), countdown_schema(2));

        let first = worker.step().unwrap();
        assert_eq!(first, StepOutcome::new(true, Some(1.0)));
        assert_eq!(worker.checkpoint.get().unwrap(), json!({"left": 1}));

        let second = worker.step().unwrap();
        assert_eq!(second, StepOutcome::new(false, Some(0.0)));
        assert_eq!(worker.checkpoint.get().unwrap(), json!({"left": 0}));
        assert_eq!(worker.steps(), 2);
    }

    #[test]
    fn non_searchable_task_finishes_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::from_fn("opaque", |_| Ok(Box::new(Opaque) as Box<dyn Task>));
        let mut worker = worker(dir.path(), schema);

        assert_eq!(worker.step().unwrap(), StepOutcome::finished());
        assert!(!worker.checkpoint.exists());
    }

    #[test]
    fn task_errors_surface_as_faults() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = worker(dir.path(), countdown_schema(1));
        worker.step().unwrap();

        let fault: ExecutionFault = worker.step().unwrap_err().into();
        assert!(matches!(fault, ExecutionFault::Task { .. }));
    }

    #[test]
    fn build_failure_is_an_error_not_a_finish() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::from_fn("broken", |_| Err(TaskError::build("no such model")));
        let mut worker = worker(dir.path(), schema);
        assert!(matches!(worker.step(), Err(WorkerError::Task(TaskError::Build { .. }))));
    }

    #[test]
    fn log_write_failure_does_not_fail_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = worker(dir.path(), countdown_schema(3));
        worker.step().unwrap();
        worker.logging.reopen_read_only().unwrap();

        assert_eq!(worker.step().unwrap(), StepOutcome::new(true, Some(1.0)));
        assert_eq!(worker.checkpoint.get().unwrap(), json!({"left": 1}));
        assert_eq!(worker.steps(), 2);
    }

    #[test]
    fn unopenable_trial_log_does_not_fail_the_step() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("trial").join("trial.log")).unwrap();
        let mut worker = worker(dir.path(), countdown_schema(1));

        assert_eq!(worker.step().unwrap(), StepOutcome::new(false, Some(0.0)));
        assert!(worker.checkpoint.exists());
    }

    #[test]
    fn dropping_worker_closes_trial_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = worker(dir.path(), countdown_schema(3));
        worker.step().unwrap();
        let log = worker.logging.path().to_path_buf();
        drop(worker);

        let contents = std::fs::read_to_string(log).unwrap();
        assert!(contents.lines().last().unwrap().contains("teardown"));
    }
}
