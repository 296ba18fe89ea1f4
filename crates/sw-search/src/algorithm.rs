//! The contract between the scheduler and a search strategy.

use sw_types::{Assignment, SearchError, Trial, TrialId, TrialSet};
use tracing::{debug, warn};

use crate::space::SearchSpace;

/// A pluggable search strategy.
///
/// The scheduler calls [`Algorithm::update`] once per loop iteration with the
/// reconciled trial set and the number of new trials it can currently admit.
/// The algorithm may introduce up to `maximum` CREATED trials, resume or pause
/// trials that have a result, and terminate trials it no longer wants.
pub trait Algorithm: Send {
    fn initialize(&mut self, space: SearchSpace) -> Result<(), SearchError>;

    /// True once the algorithm will never dispatch more work.
    fn is_done(&self) -> bool;

    fn update(&mut self, trials: TrialSet, maximum: usize) -> TrialSet;

    /// Human-readable algorithm name.
    fn name(&self) -> &str;
}

impl<A: Algorithm + ?Sized> Algorithm for Box<A> {
    fn initialize(&mut self, space: SearchSpace) -> Result<(), SearchError> {
        (**self).initialize(space)
    }

    fn is_done(&self) -> bool {
        (**self).is_done()
    }

    fn update(&mut self, trials: TrialSet, maximum: usize) -> TrialSet {
        (**self).update(trials, maximum)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Bookkeeping shared by the run-to-completion algorithms: resume trials that
/// reported a result until they hit `max_steps`, and mint new trials from a
/// stream of assignments within the admission budget.
#[derive(Debug, Clone)]
pub(crate) struct TrialBook {
    prefix: &'static str,
    max_steps: Option<usize>,
    created: usize,
}

impl TrialBook {
    pub(crate) fn new(prefix: &'static str, max_steps: Option<usize>) -> Self {
        Self {
            prefix,
            max_steps,
            created: 0,
        }
    }

    pub(crate) fn created(&self) -> usize {
        self.created
    }

    /// Resume or finish every trial that reported a result.
    pub(crate) fn advance(&self, trials: &mut TrialSet) {
        for trial in trials.values_mut().filter(|t| t.has_result()) {
            let exhausted = self
                .max_steps
                .is_some_and(|max| trial.steps_completed >= max);
            let outcome = if exhausted {
                debug!(trial = %trial.id, steps = trial.steps_completed, "step limit reached");
                trial.set_terminated()
            } else {
                trial.set_resume()
            };
            if let Err(e) = outcome {
                warn!(error = %e, "unexpected trial state");
            }
        }
    }

    pub(crate) fn create<I>(&mut self, trials: &mut TrialSet, assignments: I)
    where
        I: IntoIterator<Item = Assignment>,
    {
        for parameters in assignments {
            let id = TrialId::numbered(self.prefix, self.created);
            self.created += 1;
            trials.insert(id.clone(), Trial::new(id, parameters));
        }
    }
}

pub(crate) fn all_finished(trials: &TrialSet) -> bool {
    trials.values().all(Trial::is_finished)
}
