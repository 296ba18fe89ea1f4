//! Execution substrate and resource tracking.
//!
//! The scheduler talks to compute through two traits: [`ResourceTracker`]
//! reports capacity, and [`ExecutionSubstrate`] allocates resource-reserved
//! workers, dispatches their steps, and hands back completions. [`LocalCluster`]
//! implements both on top of the tokio blocking pool.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use sw_types::{ExecutionFault, ResourceError, StepOutcome, SweepError, SweepResult};

use crate::worker::Worker;

pub const ENV_NUM_CPUS: &str = "SWEEP_NUM_CPUS";
pub const ENV_NUM_GPUS: &str = "SWEEP_NUM_GPUS";

/// Quantities along the two tracked resource dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub gpus: f64,
}

impl Resources {
    pub fn new(cpus: f64, gpus: f64) -> Self {
        Self { cpus, gpus }
    }

    pub fn fits_within(&self, capacity: &Resources) -> bool {
        self.cpus <= capacity.cpus && self.gpus <= capacity.gpus
    }

    fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpus: (self.cpus - other.cpus).max(0.0),
            gpus: (self.gpus - other.gpus).max(0.0),
        }
    }
}

pub trait ResourceTracker {
    fn total_capacity(&self) -> Resources;

    fn available_capacity(&self) -> Resources;
}

/// Handle for one dispatched worker step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{:06}", self.0)
    }
}

#[derive(Debug, Default)]
struct ResourcePool {
    in_use: Resources,
}

/// Capacity held by one worker. Returned to the pool on drop.
struct Reservation {
    pool: Arc<Mutex<ResourcePool>>,
    amount: Resources,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut pool = self.pool.lock();
        pool.in_use = pool.in_use.saturating_sub(&self.amount);
    }
}

struct WorkerSlot {
    worker: Mutex<Worker>,
    reservation: Reservation,
}

/// Shared handle to an allocated worker.
///
/// The reservation lives as long as any clone of the handle, including the
/// one carried by an in-flight step.
#[derive(Clone)]
pub struct WorkerHandle {
    slot: Arc<WorkerSlot>,
}

impl WorkerHandle {
    /// Run one step on the calling thread.
    pub fn run_step(&self) -> Result<StepOutcome, ExecutionFault> {
        self.slot.worker.lock().step().map_err(ExecutionFault::from)
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("reserved", &self.slot.reservation.amount)
            .finish()
    }
}

#[async_trait]
pub trait ExecutionSubstrate: ResourceTracker + Send {
    /// Reserve `request` and bind `worker` to it.
    fn allocate(&mut self, request: Resources, worker: Worker) -> Result<WorkerHandle, ResourceError>;

    /// Start one step of `worker` and return its handle immediately.
    fn dispatch(&mut self, worker: &WorkerHandle) -> OperationId;

    /// Wait until at least one of `pending` completes or `timeout` elapses.
    /// Returns `(ready, still_pending)`.
    async fn wait(
        &mut self,
        pending: Vec<OperationId>,
        timeout: Duration,
    ) -> (Vec<OperationId>, Vec<OperationId>);

    /// Take the result of a completed operation.
    fn fetch_result(&mut self, operation: OperationId) -> Result<StepOutcome, ExecutionFault>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub num_cpus: f64,
    #[serde(default)]
    pub num_gpus: f64,
    /// Run steps inline at dispatch, one at a time, without capacity checks.
    #[serde(default)]
    pub local_mode: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            num_cpus: cpus as f64,
            num_gpus: 0.0,
            local_mode: false,
        }
    }
}

impl ClusterConfig {
    pub fn new(num_cpus: f64, num_gpus: f64) -> Self {
        Self {
            num_cpus,
            num_gpus,
            local_mode: false,
        }
    }

    pub fn with_local_mode(mut self, local_mode: bool) -> Self {
        self.local_mode = local_mode;
        self
    }

    pub fn from_env() -> SweepResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> SweepResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_NUM_CPUS) {
            config.num_cpus = parse_quantity(ENV_NUM_CPUS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_NUM_GPUS) {
            config.num_gpus = parse_quantity(ENV_NUM_GPUS, &raw)?;
        }
        Ok(config)
    }

    pub fn validate(&self) -> SweepResult<()> {
        if !(self.num_cpus >= 0.0 && self.num_gpus >= 0.0) {
            return Err(SweepError::Config(
                "cluster capacity must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_quantity(key: &str, raw: &str) -> SweepResult<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|e| SweepError::Config(format!("{key}={raw:?}: {e}")))
}

type Completion = (OperationId, Result<StepOutcome, ExecutionFault>);

/// In-process cluster backed by the tokio blocking pool.
pub struct LocalCluster {
    config: ClusterConfig,
    pool: Arc<Mutex<ResourcePool>>,
    next_operation: u64,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
    completed: HashMap<OperationId, Result<StepOutcome, ExecutionFault>>,
}

impl LocalCluster {
    /// The single startup call; the returned handle is passed to the scheduler.
    pub fn connect(config: ClusterConfig) -> SweepResult<Self> {
        config.validate()?;
        info!(
            cpus = config.num_cpus,
            gpus = config.num_gpus,
            local_mode = config.local_mode,
            "local cluster started"
        );
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            pool: Arc::new(Mutex::new(ResourcePool::default())),
            next_operation: 0,
            tx,
            rx,
            completed: HashMap::new(),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Capacity currently held by live workers.
    pub fn in_use(&self) -> Resources {
        self.pool.lock().in_use
    }

    fn drain_channel(&mut self) {
        while let Ok((operation, result)) = self.rx.try_recv() {
            self.completed.insert(operation, result);
        }
    }
}

impl ResourceTracker for LocalCluster {
    fn total_capacity(&self) -> Resources {
        Resources::new(self.config.num_cpus, self.config.num_gpus)
    }

    fn available_capacity(&self) -> Resources {
        self.total_capacity().saturating_sub(&self.in_use())
    }
}

#[async_trait]
impl ExecutionSubstrate for LocalCluster {
    fn allocate(&mut self, request: Resources, worker: Worker) -> Result<WorkerHandle, ResourceError> {
        if !(request.cpus >= 0.0 && request.gpus >= 0.0) {
            return Err(ResourceError::InvalidRequest {
                message: format!("negative reservation {request:?}"),
            });
        }
        {
            let mut pool = self.pool.lock();
            if !self.config.local_mode {
                let available = self.total_capacity().saturating_sub(&pool.in_use);
                if request.cpus > available.cpus {
                    return Err(ResourceError::Insufficient {
                        resource: "CPU".to_string(),
                        requested: request.cpus,
                        available: available.cpus,
                    });
                }
                if request.gpus > available.gpus {
                    return Err(ResourceError::Insufficient {
                        resource: "GPU".to_string(),
                        requested: request.gpus,
                        available: available.gpus,
                    });
                }
            }
            pool.in_use.cpus += request.cpus;
            pool.in_use.gpus += request.gpus;
        }
        debug!(trial = %worker.trial(), cpus = request.cpus, gpus = request.gpus, "worker allocated");

        Ok(WorkerHandle {
            slot: Arc::new(WorkerSlot {
                worker: Mutex::new(worker),
                reservation: Reservation {
                    pool: Arc::clone(&self.pool),
                    amount: request,
                },
            }),
        })
    }

    fn dispatch(&mut self, worker: &WorkerHandle) -> OperationId {
        let operation = OperationId(self.next_operation);
        self.next_operation += 1;

        if self.config.local_mode {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| worker.run_step()))
                .unwrap_or_else(|payload| {
                    Err(ExecutionFault::Panicked {
                        message: panic_message(payload.as_ref()),
                    })
                });
            self.completed.insert(operation, result);
            return operation;
        }

        let tx = self.tx.clone();
        let worker = worker.clone();
        tokio::spawn(async move {
            // The handle is dropped inside the blocking closure, so the
            // reservation can be freed before the completion is observed.
            let result = match tokio::task::spawn_blocking(move || worker.run_step()).await {
                Ok(result) => result,
                Err(join_error) => Err(ExecutionFault::Panicked {
                    message: match join_error.try_into_panic() {
                        Ok(payload) => panic_message(payload.as_ref()),
                        Err(join_error) => join_error.to_string(),
                    },
                }),
            };
            let _ = tx.send((operation, result));
        });
        operation
    }

    async fn wait(
        &mut self,
        pending: Vec<OperationId>,
        timeout: Duration,
    ) -> (Vec<OperationId>, Vec<OperationId>) {
        let deadline = tokio::time::Instant::now() + timeout;
        self.drain_channel();
        while !pending.iter().any(|op| self.completed.contains_key(op)) {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some((operation, result))) => {
                    self.completed.insert(operation, result);
                }
                Ok(None) | Err(_) => break,
            }
        }
        self.drain_channel();
        pending
            .into_iter()
            .partition(|op| self.completed.contains_key(op))
    }

    fn fetch_result(&mut self, operation: OperationId) -> Result<StepOutcome, ExecutionFault> {
        self.completed
            .remove(&operation)
            .unwrap_or_else(|| {
                Err(ExecutionFault::Lost {
                    operation: operation.to_string(),
                })
            })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::schema::Schema;
    use crate::task::{Searchable, Task};
    use std::path::Path;
    use sw_types::{Environment, TaskError, TrialId};

    struct Sleepy {
        millis: u64,
        panic: bool,
    }

    impl Task for Sleepy {
        fn into_searchable(self: Box<Self>) -> Option<Box<dyn Searchable>> {
            Some(self)
        }
    }

    impl Searchable for Sleepy {
        fn step(&mut self, _env: &Environment) -> Result<bool, TaskError> {
            std::thread::sleep(Duration::from_millis(self.millis));
            if self.panic {
                panic!("exploded");
            }
            Ok(false)
        }

        fn metric(&self, _env: &Environment) -> Result<Option<f64>, TaskError> {
            Ok(Some(1.0))
        }
    }

    fn sleepy_worker(dir: &Path, name: &str, millis: u64, panic: bool) -> Worker {
        let trial_dir = dir.join(name);
        let schema = Schema::from_fn("sleepy", move |_| {
            Ok(Box::new(Sleepy { millis, panic }) as Box<dyn Task>)
        });
        Worker::new(
            TrialId::new(name),
            schema,
            Checkpoint::new(&trial_dir, "localhost", "tester"),
            Environment::new(&trial_dir),
        )
    }

    #[test]
    fn operation_ids_display_padded() {
        assert_eq!(OperationId(7).to_string(), "op-000007");
    }

    #[test]
    fn config_from_lookup() {
        let config = ClusterConfig::from_lookup(|key| match key {
            ENV_NUM_CPUS => Some("8".into()),
            ENV_NUM_GPUS => Some("2".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.num_cpus, 8.0);
        assert_eq!(config.num_gpus, 2.0);

        let err = ClusterConfig::from_lookup(|key| (key == ENV_NUM_CPUS).then(|| "many".into()));
        assert!(matches!(err, Err(SweepError::Config(_))));
    }

    #[tokio::test]
    async fn reservations_are_released_with_the_last_handle() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = LocalCluster::connect(ClusterConfig::new(2.0, 0.0)).unwrap();

        let a = cluster
            .allocate(Resources::new(1.0, 0.0), sleepy_worker(dir.path(), "a", 0, false))
            .unwrap();
        let b = cluster
            .allocate(Resources::new(1.0, 0.0), sleepy_worker(dir.path(), "b", 0, false))
            .unwrap();
        assert_eq!(cluster.available_capacity(), Resources::new(0.0, 0.0));

        let err = cluster
            .allocate(Resources::new(1.0, 0.0), sleepy_worker(dir.path(), "c", 0, false))
            .unwrap_err();
        assert!(matches!(err, ResourceError::Insufficient { .. }));

        drop(a);
        assert_eq!(cluster.available_capacity(), Resources::new(1.0, 0.0));
        drop(b);
        assert_eq!(cluster.in_use(), Resources::default());
    }

    #[tokio::test]
    async fn wait_returns_ready_and_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = LocalCluster::connect(ClusterConfig::new(2.0, 0.0)).unwrap();
        let fast = cluster
            .allocate(Resources::new(1.0, 0.0), sleepy_worker(dir.path(), "fast", 0, false))
            .unwrap();
        let slow = cluster
            .allocate(Resources::new(1.0, 0.0), sleepy_worker(dir.path(), "slow", 500, false))
            .unwrap();

        let fast_op = cluster.dispatch(&fast);
        let slow_op = cluster.dispatch(&slow);
        let (ready, pending) = cluster
            .wait(vec![fast_op, slow_op], Duration::from_secs(5))
            .await;
        assert_eq!(ready, vec![fast_op]);
        assert_eq!(pending, vec![slow_op]);
        assert_eq!(cluster.fetch_result(fast_op).unwrap(), StepOutcome::new(false, Some(1.0)));

        let (ready, pending) = cluster.wait(pending, Duration::from_secs(5)).await;
        assert_eq!(ready, vec![slow_op]);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn wait_times_out_empty_handed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = LocalCluster::connect(ClusterConfig::new(1.0, 0.0)).unwrap();
        let slow = cluster
            .allocate(Resources::new(1.0, 0.0), sleepy_worker(dir.path(), "slow", 300, false))
            .unwrap();
        let op = cluster.dispatch(&slow);

        let (ready, pending) = cluster.wait(vec![op], Duration::from_millis(10)).await;
        assert!(ready.is_empty());
        assert_eq!(pending, vec![op]);

        let (ready, _) = cluster.wait(pending, Duration::from_secs(5)).await;
        assert_eq!(ready, vec![op]);
    }

    #[tokio::test]
    async fn panics_become_faults() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = LocalCluster::connect(ClusterConfig::new(1.0, 0.0)).unwrap();
        let worker = cluster
            .allocate(Resources::new(1.0, 0.0), sleepy_worker(dir.path(), "boom", 0, true))
            .unwrap();
        let op = cluster.dispatch(&worker);
        let (ready, _) = cluster.wait(vec![op], Duration::from_secs(5)).await;
        assert_eq!(ready, vec![op]);

        match cluster.fetch_result(op) {
            Err(ExecutionFault::Panicked { message }) => assert!(message.contains("exploded")),
            other => panic!("expected panic fault, got {other:?}"),
        }
        assert!(matches!(cluster.fetch_result(op), Err(ExecutionFault::Lost { .. })));
    }

    #[tokio::test]
    async fn local_mode_runs_inline_without_capacity_checks() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster =
            LocalCluster::connect(ClusterConfig::new(1.0, 0.0).with_local_mode(true)).unwrap();
        let a = cluster
            .allocate(Resources::new(1.0, 0.0), sleepy_worker(dir.path(), "a", 0, false))
            .unwrap();
        let b = cluster
            .allocate(Resources::new(1.0, 0.0), sleepy_worker(dir.path(), "b", 0, true))
            .unwrap();

        let ok = cluster.dispatch(&a);
        let boom = cluster.dispatch(&b);
        let (ready, pending) = cluster.wait(vec![ok, boom], Duration::ZERO).await;
        assert_eq!(ready, vec![ok, boom]);
        assert!(pending.is_empty());
        assert!(cluster.fetch_result(ok).is_ok());
        assert!(cluster.fetch_result(boom).is_err());
    }
}
