use thiserror::Error;

use crate::params::ParamPath;
use crate::trial::{TrialId, TrialStatus};

/// Main error type for the Sweep system
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Trial transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SweepError {
    /// Whether this is the pre-run capacity check failure.
    pub fn is_resource_exceeded(&self) -> bool {
        matches!(self, SweepError::Resource(ResourceError::Exceeded { .. }))
    }
}

/// Resource-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("{resource} required per trial ({requested}) is larger than the cluster total ({total})")]
    Exceeded {
        resource: String,
        requested: f64,
        total: f64,
    },

    #[error("Insufficient {resource}: requested {requested}, available {available}")]
    Insufficient {
        resource: String,
        requested: f64,
        available: f64,
    },

    #[error("Invalid resource request: {message}")]
    InvalidRequest { message: String },
}

/// Schema binding and materialization errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Unknown parameter path: {path}")]
    UnknownPath { path: ParamPath },

    #[error("Parameter {path} is still a search distribution and has no bound value")]
    UnboundParameter { path: ParamPath },

    #[error("Parameter path {path} crosses a non-group node")]
    NotAGroup { path: ParamPath },

    #[error("Empty parameter path")]
    EmptyPath,
}

/// Search algorithm errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    #[error("Invalid distribution for {path}: {message}")]
    InvalidDistribution { path: ParamPath, message: String },
}

/// Errors raised by user tasks while building or stepping
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Task build failed: {message}")]
    Build { message: String },

    #[error("Task step failed: {message}")]
    Step { message: String },

    #[error("Invalid task parameters: {0}")]
    Parameters(#[from] serde_json::Error),
}

impl TaskError {
    pub fn build(message: impl Into<String>) -> Self {
        TaskError::Build { message: message.into() }
    }

    pub fn step(message: impl Into<String>) -> Self {
        TaskError::Step { message: message.into() }
    }
}

/// Checkpoint persistence errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No checkpoint stored at {path}")]
    Missing { path: String },
}

/// Rejected trial status change
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Trial {trial} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub trial: TrialId,
    pub from: TrialStatus,
    pub to: TrialStatus,
}

/// Failure surfaced by the execution substrate for one outstanding operation.
///
/// Faults stay attached to the trial that produced them; the scheduler turns
/// them into an ERROR status and never propagates them out of a run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFault {
    #[error("task failed: {message}")]
    Task { message: String },

    #[error("worker panicked: {message}")]
    Panicked { message: String },

    #[error("checkpoint write failed: {message}")]
    Checkpoint { message: String },

    #[error("operation {operation} is unknown or its result was already fetched")]
    Lost { operation: String },
}

/// Result type alias for Sweep operations
pub type SweepResult<T> = Result<T, SweepError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::SweepError::Config(format!($($arg)*))
    };
}
