//! Independent random sampling across the search space.

use rand::rngs::StdRng;
use rand::SeedableRng;
use sw_types::{Assignment, SearchError, TrialSet};
use tracing::info;

use crate::algorithm::{all_finished, Algorithm, TrialBook};
use crate::space::SearchSpace;

/// Samples `n_trials` assignments independently. With a seed, the proposals
/// are reproducible for the same sequence of budgets.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    n_trials: usize,
    space: Option<SearchSpace>,
    rng: StdRng,
    book: TrialBook,
    done: bool,
}

impl RandomSearch {
    pub fn new(n_trials: usize) -> Self {
        Self {
            n_trials,
            space: None,
            rng: StdRng::from_os_rng(),
            book: TrialBook::new("random", None),
            done: n_trials == 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.book = TrialBook::new("random", Some(max_steps));
        self
    }

    fn sample_one(&mut self, space: &SearchSpace) -> Assignment {
        space
            .parameters
            .iter()
            .map(|p| (p.path.clone(), p.distribution.sample(&mut self.rng)))
            .collect()
    }
}

impl Algorithm for RandomSearch {
    fn initialize(&mut self, space: SearchSpace) -> Result<(), SearchError> {
        space.validate()?;
        info!(trials = self.n_trials, dims = space.len(), "random search initialized");
        self.space = Some(space);
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn update(&mut self, mut trials: TrialSet, maximum: usize) -> TrialSet {
        let Some(space) = self.space.take() else {
            return trials;
        };
        self.book.advance(&mut trials);

        let count = maximum.min(self.n_trials - self.book.created());
        let batch: Vec<Assignment> = (0..count).map(|_| self.sample_one(&space)).collect();
        self.book.create(&mut trials, batch);
        self.space = Some(space);

        self.done = self.book.created() == self.n_trials && all_finished(&trials);
        trials
    }

    fn name(&self) -> &str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sw_types::{ParamPath, ParameterValue};

    fn sample_space() -> SearchSpace {
        SearchSpace::new()
            .add_int("short_period", 5, 15)
            .add_float(ParamPath::dotted("optim.momentum"), 0.5, 1.0)
    }

    #[test]
    fn random_search_respects_bounds() {
        let mut rs = RandomSearch::new(50).with_seed(1);
        rs.initialize(sample_space()).unwrap();
        let trials = rs.update(TrialSet::new(), 50);
        assert_eq!(trials.len(), 50);

        for trial in trials.values() {
            match trial.parameters.get(&ParamPath::from("short_period")) {
                Some(ParameterValue::Int(v)) => assert!(*v >= 5 && *v <= 15),
                other => panic!("unexpected short_period value: {other:?}"),
            }
            match trial.parameters.get(&ParamPath::dotted("optim.momentum")) {
                Some(ParameterValue::Float(v)) => assert!(*v >= 0.5 && *v <= 1.0),
                other => panic!("unexpected momentum value: {other:?}"),
            }
        }
    }

    #[test]
    fn never_exceeds_trial_count() {
        let mut rs = RandomSearch::new(3).with_seed(2);
        rs.initialize(sample_space()).unwrap();
        let trials = rs.update(TrialSet::new(), 2);
        assert_eq!(trials.len(), 2);
        let trials = rs.update(trials, 10);
        assert_eq!(trials.len(), 3);
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let mut a = RandomSearch::new(4).with_seed(42);
        let mut b = RandomSearch::new(4).with_seed(42);
        a.initialize(sample_space()).unwrap();
        b.initialize(sample_space()).unwrap();
        let ta = a.update(TrialSet::new(), 4);
        let tb = b.update(TrialSet::new(), 4);
        let pa: Vec<_> = ta.values().map(|t| t.parameters.clone()).collect();
        let pb: Vec<_> = tb.values().map(|t| t.parameters.clone()).collect();
        assert_eq!(pa, pb);
    }

    #[test]
    fn update_before_initialize_is_a_no_op() {
        let mut rs = RandomSearch::new(2);
        let trials = rs.update(TrialSet::new(), 2);
        assert!(trials.is_empty());
        assert!(!rs.is_done());
    }

    #[test]
    fn zero_trials_is_immediately_done() {
        assert!(RandomSearch::new(0).is_done());
    }
}
