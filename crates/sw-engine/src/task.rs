//! Capability traits for the objects a schema materializes.

use sw_types::{Environment, TaskError};

/// The minimal interface a task must expose to take part in a trial.
pub trait Searchable: Send {
    /// Advance by one unit of work. Returns `false` once the task is finished.
    fn step(&mut self, env: &Environment) -> Result<bool, TaskError>;

    /// Current value of the objective, if the task has one yet.
    fn metric(&self, env: &Environment) -> Result<Option<f64>, TaskError>;

    /// Snapshot persisted through the trial checkpoint after every step.
    fn state(&self) -> Result<serde_json::Value, TaskError> {
        Ok(serde_json::Value::Null)
    }
}

/// Anything a [`crate::Schema`] can build.
///
/// Tasks that support stepping hand themselves over as a [`Searchable`];
/// everything else keeps the default and is finished without running.
pub trait Task: Send {
    fn into_searchable(self: Box<Self>) -> Option<Box<dyn Searchable>> {
        None
    }
}
