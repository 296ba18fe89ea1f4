//! The scheduler loop.
//!
//! A [`Search`] owns one run: it asks the algorithm for trials, admits them
//! against the cluster's capacity, dispatches one worker step per trial at a
//! time, folds completions back into trial state, and stops when the
//! algorithm says it is done.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use sw_search::{Algorithm, GridSearch};
use sw_types::{
    is_valid_walk, Assignment, Environment, ResourceError, SweepResult, Trial, TrialId,
    TrialSet, TrialStatus,
};

use crate::checkpoint::{current_user, Checkpoint};
use crate::cluster::{ExecutionSubstrate, OperationId, ResourceTracker, Resources, WorkerHandle};
use crate::config::{admission_budget, debug_budget, SearchConfig};
use crate::schema::Schema;
use crate::worker::Worker;

/// Final report for one trial.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRecord {
    pub trial_id: TrialId,
    pub status: TrialStatus,
    pub history: Vec<TrialStatus>,
    #[serde(serialize_with = "sw_types::params::dotted_keys::serialize")]
    pub parameters: Assignment,
    pub steps_completed: usize,
    /// Bound schema; `None` if the trial never left CREATED.
    pub schema: Option<Schema>,
    pub checkpoint: Option<Checkpoint>,
    pub error: bool,
    pub metric: Option<f64>,
    /// Last operation dispatched for this trial.
    pub var_id: Option<OperationId>,
}

/// Per-trial state that exists once a trial has been admitted.
struct TrialRunState {
    schema: Schema,
    checkpoint: Checkpoint,
    worker: Option<WorkerHandle>,
}

pub struct Search<C> {
    id: Uuid,
    schema: Schema,
    algorithm: Box<dyn Algorithm>,
    config: SearchConfig,
    cluster: C,
}

impl<C: ExecutionSubstrate> Search<C> {
    /// Search over `schema` on `cluster` with a grid search and default settings.
    pub fn new(schema: Schema, cluster: C) -> Self {
        Self {
            id: Uuid::new_v4(),
            schema,
            algorithm: Box::new(GridSearch::default()),
            config: SearchConfig::default(),
            cluster,
        }
    }

    pub fn with_algorithm(mut self, algorithm: impl Algorithm + 'static) -> Self {
        self.algorithm = Box::new(algorithm);
        self
    }

    pub fn with_config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// Run the search to completion and report every trial it produced.
    pub async fn run(&mut self, env: &Environment) -> SweepResult<BTreeMap<TrialId, ResultRecord>> {
        let span = info_span!("search", run = %self.id, algorithm = self.algorithm.name());
        self.execute(env).instrument(span).await
    }

    async fn execute(&mut self, env: &Environment) -> SweepResult<BTreeMap<TrialId, ResultRecord>> {
        self.config.validate()?;
        if !env.debug {
            self.check_capacity()?;
        }
        self.algorithm.initialize(self.schema.extract_search_space())?;
        info!(
            output = %env.output_path.display(),
            debug = env.debug,
            cpus_per_trial = self.config.cpus_per_trial,
            gpus_per_trial = self.config.gpus_per_trial,
            "search started"
        );

        let per_trial = self.config.per_trial();
        let refresh_wait = self.config.refresh_wait();
        let idle_wait = self.config.idle_wait();
        let mut run = RunState::new(&self.schema, &mut self.cluster, env, per_trial);

        while !self.algorithm.is_done() {
            let ready = run.drain(refresh_wait).await;
            run.reconcile(ready);

            let budget = if env.debug {
                debug_budget(&run.trials)
            } else {
                admission_budget(run.cluster.available_capacity(), per_trial)
            };
            let updated = self.algorithm.update(run.trials.clone(), budget);
            run.adopt(updated);

            let dispatched = run.dispatch()?;
            run.check_invariants();
            debug!(budget, dispatched, outstanding = run.running.len(), "iteration finished");

            if run.running.is_empty() && dispatched == 0 && !self.algorithm.is_done() {
                tokio::time::sleep(idle_wait).await;
            }
        }

        let results = run.finalize();
        let failed = results.values().filter(|r| r.error).count();
        info!(trials = results.len(), failed, "search finished");
        Ok(results)
    }

    /// A trial that can never fit must fail the run before anything is created.
    fn check_capacity(&self) -> Result<(), ResourceError> {
        let total = self.cluster.total_capacity();
        if self.config.cpus_per_trial > total.cpus {
            return Err(ResourceError::Exceeded {
                resource: "CPU".to_string(),
                requested: self.config.cpus_per_trial,
                total: total.cpus,
            });
        }
        if self.config.gpus_per_trial > total.gpus {
            return Err(ResourceError::Exceeded {
                resource: "GPU".to_string(),
                requested: self.config.gpus_per_trial,
                total: total.gpus,
            });
        }
        Ok(())
    }
}

/// Whether `after` is a status change the algorithm may make to `before`.
///
/// The algorithm only moves trials out of HAS_RESULT and PAUSED, and only to
/// RESUMING, PAUSED or TERMINATED. Admission and every move out of RESUMING
/// or RUNNING belong to the scheduler.
fn algorithm_may_move(before: &Trial, after: &Trial) -> bool {
    if after.history() == before.history() {
        return true;
    }
    let owned = matches!(before.status(), TrialStatus::HasResult | TrialStatus::Paused);
    owned
        && after.history().starts_with(before.history())
        && is_valid_walk(after.history())
        && after.history()[before.history().len()..].iter().all(|status| {
            matches!(
                status,
                TrialStatus::Resuming | TrialStatus::Paused | TrialStatus::Terminated
            )
        })
}

/// Everything the loop tracks between iterations.
struct RunState<'a, C> {
    schema: &'a Schema,
    cluster: &'a mut C,
    env: &'a Environment,
    per_trial: Resources,
    user: String,
    trials: TrialSet,
    run_states: BTreeMap<TrialId, TrialRunState>,
    op_to_trial: HashMap<OperationId, TrialId>,
    trial_to_op: HashMap<TrialId, OperationId>,
    running: Vec<OperationId>,
}

impl<'a, C: ExecutionSubstrate> RunState<'a, C> {
    fn new(schema: &'a Schema, cluster: &'a mut C, env: &'a Environment, per_trial: Resources) -> Self {
        Self {
            schema,
            cluster,
            env,
            per_trial,
            user: current_user(),
            trials: TrialSet::new(),
            run_states: BTreeMap::new(),
            op_to_trial: HashMap::new(),
            trial_to_op: HashMap::new(),
            running: Vec::new(),
        }
    }

    async fn drain(&mut self, refresh_wait: std::time::Duration) -> Vec<OperationId> {
        if self.running.is_empty() {
            return Vec::new();
        }
        let pending = std::mem::take(&mut self.running);
        let (ready, pending) = self.cluster.wait(pending, refresh_wait).await;
        self.running = pending;
        ready
    }

    fn reconcile(&mut self, ready: Vec<OperationId>) {
        for op in ready {
            let Some(trial_id) = self.op_to_trial.remove(&op) else {
                warn!(op = %op, "completion for an unknown operation");
                continue;
            };
            let result = self.cluster.fetch_result(op);
            let Some(trial) = self.trials.get_mut(&trial_id) else {
                warn!(trial = %trial_id, op = %op, "completion for an unknown trial");
                continue;
            };

            let transition = match result {
                Ok(outcome) => {
                    trial.record_step();
                    if outcome.should_continue {
                        trial.set_metric(outcome.metric);
                        trial.set_has_result()
                    } else {
                        trial.set_terminated()
                    }
                }
                Err(fault) => {
                    if self.env.debug {
                        error!(trial = %trial_id, op = %op, fault = ?fault, "step fault");
                    }
                    warn!(trial = %trial_id, error = %fault, "trial failed");
                    trial.set_error()
                }
            };
            if let Err(e) = transition {
                warn!(error = %e, "completion ignored");
            }

            if trial.is_finished() {
                self.release(&trial_id);
            }
        }
    }

    /// Take the algorithm's view of the trials, keeping the ones it dropped
    /// and undoing status changes the algorithm does not own.
    fn adopt(&mut self, mut updated: TrialSet) {
        let mut previous = std::mem::take(&mut self.trials);
        for (id, trial) in updated.iter_mut() {
            match previous.remove(id) {
                Some(before) => {
                    if trial.id != *id || !algorithm_may_move(&before, trial) {
                        warn!(
                            trial = %id,
                            from = %before.status(),
                            to = %trial.status(),
                            "status change not allowed for the algorithm, keeping previous state"
                        );
                        *trial = before;
                    }
                }
                None if !trial.is_created() || trial.id != *id || trial.history().len() != 1 => {
                    warn!(trial = %id, status = %trial.status(), "new trial not in CREATED, resetting");
                    *trial = Trial::new(id.clone(), trial.parameters.clone());
                }
                None => {}
            }
        }
        for (id, before) in previous {
            warn!(trial = %id, "algorithm dropped a trial, keeping it");
            updated.insert(id, before);
        }
        self.trials = updated;
    }

    /// Apply per-status actions. Returns how many steps were dispatched.
    fn dispatch(&mut self) -> SweepResult<usize> {
        let ids: Vec<TrialId> = self.trials.keys().cloned().collect();
        let mut dispatched = 0;
        for id in ids {
            let Some(status) = self.trials.get(&id).map(Trial::status) else {
                continue;
            };
            match status {
                TrialStatus::Paused | TrialStatus::Running | TrialStatus::HasResult => {}
                TrialStatus::Terminated | TrialStatus::Error => self.release(&id),
                TrialStatus::Created => self.admit(&id)?,
                TrialStatus::Resuming => {}
            }
            if self.trials.get(&id).is_some_and(Trial::is_resuming) && self.launch(&id) {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    fn admit(&mut self, id: &TrialId) -> SweepResult<()> {
        let Some(trial) = self.trials.get_mut(id) else {
            return Ok(());
        };
        let schema = self.schema.bind(&trial.parameters)?;
        let trial_path = self.env.output_path.join(id.as_str());
        let checkpoint = Checkpoint::new(&trial_path, &self.env.head_node_ip, &self.user);
        let worker = Worker::new(
            id.clone(),
            schema.clone(),
            checkpoint.clone(),
            self.env.clone_with_output_path(&trial_path),
        );

        match self.cluster.allocate(self.per_trial, worker) {
            Ok(handle) => {
                trial.set_resume()?;
                self.run_states.insert(
                    id.clone(),
                    TrialRunState {
                        schema,
                        checkpoint,
                        worker: Some(handle),
                    },
                );
                debug!(trial = %id, path = %trial_path.display(), "trial admitted");
            }
            Err(e) => debug!(trial = %id, error = %e, "trial waiting for capacity"),
        }
        Ok(())
    }

    fn launch(&mut self, id: &TrialId) -> bool {
        let outstanding = self
            .trial_to_op
            .get(id)
            .is_some_and(|op| self.op_to_trial.contains_key(op));
        if outstanding {
            debug!(trial = %id, "previous step still outstanding");
            return false;
        }
        let Some(worker) = self.run_states.get(id).and_then(|s| s.worker.as_ref()) else {
            warn!(trial = %id, "resuming trial has no worker");
            return false;
        };

        let op = self.cluster.dispatch(worker);
        self.op_to_trial.insert(op, id.clone());
        self.trial_to_op.insert(id.clone(), op);
        self.running.push(op);
        if let Some(trial) = self.trials.get_mut(id) {
            if let Err(e) = trial.set_running() {
                warn!(error = %e, "dispatched trial not marked running");
            }
        }
        debug!(trial = %id, op = %op, "step dispatched");
        true
    }

    fn release(&mut self, id: &TrialId) {
        if let Some(worker) = self.run_states.get_mut(id).and_then(|s| s.worker.take()) {
            drop(worker);
            debug!(trial = %id, "worker released");
        }
    }

    fn check_invariants(&self) {
        debug_assert!(self.op_to_trial.values().all(|id| self.trials.contains_key(id)));
        debug_assert_eq!(self.running.len(), self.op_to_trial.len());
        debug_assert!(self
            .run_states
            .iter()
            .all(|(id, s)| s.worker.is_none() || self.trials.get(id).is_some_and(|t| !t.is_finished())));
    }

    fn finalize(self) -> BTreeMap<TrialId, ResultRecord> {
        if !self.op_to_trial.is_empty() {
            warn!(outstanding = self.op_to_trial.len(), "search finished with steps still in flight");
        }
        let RunState {
            trials,
            mut run_states,
            trial_to_op,
            ..
        } = self;

        trials
            .into_iter()
            .map(|(id, trial)| {
                let state = run_states.remove(&id);
                let record = ResultRecord {
                    trial_id: id.clone(),
                    status: trial.status(),
                    history: trial.history().to_vec(),
                    steps_completed: trial.steps_completed,
                    error: trial.is_error(),
                    metric: trial.best_metric,
                    var_id: trial_to_op.get(&id).copied(),
                    schema: state.as_ref().map(|s| s.schema.clone()),
                    checkpoint: state.map(|s| s.checkpoint),
                    parameters: trial.parameters,
                };
                (id, record)
            })
            .collect()
    }
}
