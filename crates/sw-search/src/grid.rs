//! Exhaustive grid search.

use sw_types::{Assignment, SearchError, TrialSet};
use tracing::info;

use crate::algorithm::{all_finished, Algorithm, TrialBook};
use crate::space::SearchSpace;

/// Exhaustive grid search over discrete parameter combinations.
///
/// Every grid point becomes one trial. A trial keeps stepping until its task
/// stops on its own or `max_steps` is reached.
#[derive(Debug, Clone)]
pub struct GridSearch {
    /// Number of steps for continuous dimensions.
    float_steps: usize,
    book: TrialBook,
    combos: Vec<Assignment>,
    cursor: usize,
    initialized: bool,
    done: bool,
}

impl GridSearch {
    pub fn new() -> Self {
        Self {
            float_steps: 5,
            book: TrialBook::new("grid", None),
            combos: Vec::new(),
            cursor: 0,
            initialized: false,
            done: false,
        }
    }

    pub fn with_float_steps(mut self, steps: usize) -> Self {
        self.float_steps = steps;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.book = TrialBook::new("grid", Some(max_steps));
        self
    }

    /// Grid points not yet turned into trials.
    pub fn remaining(&self) -> usize {
        self.combos.len() - self.cursor
    }

    fn build_grid(space: &SearchSpace, float_steps: usize) -> Vec<Assignment> {
        // Cartesian product; an empty space yields a single empty assignment.
        let mut result: Vec<Assignment> = vec![Assignment::new()];
        for param in &space.parameters {
            let axis = param.distribution.grid_points(float_steps);
            let mut next = Vec::with_capacity(result.len() * axis.len());
            for existing in &result {
                for value in &axis {
                    let mut combo = existing.clone();
                    combo.insert(param.path.clone(), value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }
        result
    }
}

impl Default for GridSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for GridSearch {
    fn initialize(&mut self, space: SearchSpace) -> Result<(), SearchError> {
        space.validate()?;
        self.combos = Self::build_grid(&space, self.float_steps);
        self.cursor = 0;
        self.initialized = true;
        self.done = self.combos.is_empty();
        info!(points = self.combos.len(), "grid search initialized");
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn update(&mut self, mut trials: TrialSet, maximum: usize) -> TrialSet {
        if !self.initialized {
            return trials;
        }
        self.book.advance(&mut trials);

        let end = (self.cursor + maximum).min(self.combos.len());
        let batch = self.combos[self.cursor..end].to_vec();
        self.cursor = end;
        self.book.create(&mut trials, batch);

        self.done = self.remaining() == 0 && all_finished(&trials);
        trials
    }

    fn name(&self) -> &str {
        "grid"
    }
}
