// Sweep trial scheduler
// Admits trials against cluster capacity and steps them to completion

pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod logging;
pub mod schema;
pub mod search;
pub mod task;
pub mod worker;

pub use checkpoint::{current_user, Checkpoint};
pub use cluster::{
    ClusterConfig, ExecutionSubstrate, LocalCluster, OperationId, ResourceTracker, Resources,
    WorkerHandle,
};
pub use config::{admission_budget, debug_budget, SearchConfig};
pub use logging::TrialLogging;
pub use schema::{ParamNode, Schema, TaskFactory};
pub use search::{ResultRecord, Search};
pub use task::{Searchable, Task};
pub use worker::{Worker, WorkerError};
