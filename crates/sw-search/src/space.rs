//! Search space definitions.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sw_types::{ParamPath, ParameterValue, SearchError};

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Distribution {
    /// Continuous uniform range [low, high].
    Uniform { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

impl Distribution {
    pub fn uniform(low: f64, high: f64) -> Self {
        Self::Uniform { low, high }
    }

    pub fn int_range(low: i64, high: i64) -> Self {
        Self::IntRange { low, high }
    }

    pub fn log_uniform(low: f64, high: f64) -> Self {
        Self::LogUniform { low, high }
    }

    pub fn choice<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<serde_json::Value>,
    {
        Self::Choice {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self, path: &ParamPath) -> Result<(), SearchError> {
        let invalid = |message: &str| SearchError::InvalidDistribution {
            path: path.clone(),
            message: message.to_string(),
        };
        match self {
            Self::Uniform { low, high } if !(low <= high) => Err(invalid("low must not exceed high")),
            Self::IntRange { low, high } if low > high => Err(invalid("low must not exceed high")),
            Self::LogUniform { low, high } if !(*low > 0.0 && low <= high) => {
                Err(invalid("log-uniform bounds must be positive and ordered"))
            }
            Self::Choice { values } if values.is_empty() => Err(invalid("no choices given")),
            _ => Ok(()),
        }
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> ParameterValue {
        match self {
            Self::Uniform { low, high } => ParameterValue::Float(rng.random_range(*low..=*high)),
            Self::IntRange { low, high } => ParameterValue::Int(rng.random_range(*low..=*high)),
            Self::LogUniform { low, high } => {
                let log_val: f64 = rng.random_range(low.ln()..=high.ln());
                ParameterValue::Float(log_val.exp())
            }
            Self::Choice { values } => {
                let idx = rng.random_range(0..values.len());
                ParameterValue::Json(values[idx].clone())
            }
        }
    }

    /// Discrete points used by grid search. Continuous ranges are cut into
    /// `float_steps` evenly spaced points (at least two).
    pub fn grid_points(&self, float_steps: usize) -> Vec<ParameterValue> {
        match self {
            Self::Uniform { low, high } => {
                let steps = float_steps.max(2);
                (0..steps)
                    .map(|i| {
                        let t = i as f64 / (steps - 1) as f64;
                        ParameterValue::Float(low + t * (high - low))
                    })
                    .collect()
            }
            Self::IntRange { low, high } => (*low..=*high).map(ParameterValue::Int).collect(),
            Self::LogUniform { low, high } => {
                let steps = float_steps.max(2);
                let log_low = low.ln();
                let log_high = high.ln();
                (0..steps)
                    .map(|i| {
                        let t = i as f64 / (steps - 1) as f64;
                        ParameterValue::Float((log_low + t * (log_high - log_low)).exp())
                    })
                    .collect()
            }
            Self::Choice { values } => values.iter().cloned().map(ParameterValue::Json).collect(),
        }
    }

    /// Number of natural grid points; `None` for continuous ranges.
    pub fn discrete_size(&self) -> Option<usize> {
        match self {
            Self::IntRange { low, high } => Some((high - low + 1).max(0) as usize),
            Self::Choice { values } => Some(values.len()),
            _ => None,
        }
    }
}

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub path: ParamPath,
    pub distribution: Distribution,
}

/// The full search space, extracted once from a schema at run start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, path: impl Into<ParamPath>, distribution: Distribution) -> Self {
        self.insert(path.into(), distribution);
        self
    }

    pub fn add_float(self, path: impl Into<ParamPath>, low: f64, high: f64) -> Self {
        self.add(path, Distribution::uniform(low, high))
    }

    pub fn add_int(self, path: impl Into<ParamPath>, low: i64, high: i64) -> Self {
        self.add(path, Distribution::int_range(low, high))
    }

    pub fn add_log_uniform(self, path: impl Into<ParamPath>, low: f64, high: f64) -> Self {
        self.add(path, Distribution::log_uniform(low, high))
    }

    pub fn add_choice(self, path: impl Into<ParamPath>, values: Vec<serde_json::Value>) -> Self {
        self.add(path, Distribution::Choice { values })
    }

    /// Insert or replace the distribution at `path`.
    pub fn insert(&mut self, path: ParamPath, distribution: Distribution) {
        match self.parameters.iter_mut().find(|p| p.path == path) {
            Some(existing) => existing.distribution = distribution,
            None => self.parameters.push(ParameterDef { path, distribution }),
        }
    }

    pub fn get(&self, path: &ParamPath) -> Option<&Distribution> {
        self.parameters
            .iter()
            .find(|p| &p.path == path)
            .map(|p| &p.distribution)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        self.parameters
            .iter()
            .try_for_each(|p| p.distribution.validate(&p.path))
    }

    /// Total number of grid points (returns `None` if any parameter is
    /// continuous without a natural grid).
    pub fn grid_size(&self) -> Option<usize> {
        self.parameters
            .iter()
            .try_fold(1usize, |total, p| total.checked_mul(p.distribution.discrete_size()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn grid_size_counts_discrete_dimensions() {
        let space = SearchSpace::new()
            .add_int("a", 1, 3) // 3 values
            .add_choice("b", vec![serde_json::json!("x"), serde_json::json!("y")]);
        assert_eq!(space.grid_size(), Some(6));
    }

    #[test]
    fn grid_size_none_for_float() {
        let space = SearchSpace::new().add_float("x", 0.0, 1.0);
        assert_eq!(space.grid_size(), None);
    }

    #[test]
    fn insert_replaces_existing_path() {
        let mut space = SearchSpace::new().add_int(ParamPath::dotted("model.layers"), 1, 2);
        space.insert(ParamPath::dotted("model.layers"), Distribution::int_range(4, 8));
        assert_eq!(space.len(), 1);
        assert_eq!(
            space.get(&ParamPath::dotted("model.layers")),
            Some(&Distribution::int_range(4, 8))
        );
    }

    #[test]
    fn validation_rejects_bad_ranges() {
        assert!(SearchSpace::new().add_float("x", 2.0, 1.0).validate().is_err());
        assert!(SearchSpace::new().add_log_uniform("lr", 0.0, 1.0).validate().is_err());
        assert!(SearchSpace::new().add_choice("c", vec![]).validate().is_err());
        assert!(SearchSpace::new().add_int("n", 1, 1).validate().is_ok());
    }

    #[test]
    fn samples_respect_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let lr = Distribution::log_uniform(1e-5, 1e-1);
        let layers = Distribution::int_range(2, 4);
        for _ in 0..100 {
            match lr.sample(&mut rng) {
                ParameterValue::Float(v) => assert!((1e-5..=1e-1).contains(&v), "lr out of bounds: {v}"),
                other => panic!("unexpected lr value: {other:?}"),
            }
            match layers.sample(&mut rng) {
                ParameterValue::Int(v) => assert!((2..=4).contains(&v)),
                other => panic!("unexpected layers value: {other:?}"),
            }
        }
    }

    #[test]
    fn float_grid_includes_endpoints() {
        let points = Distribution::uniform(0.0, 1.0).grid_points(3);
        assert_eq!(
            points,
            vec![
                ParameterValue::Float(0.0),
                ParameterValue::Float(0.5),
                ParameterValue::Float(1.0)
            ]
        );
    }

    #[test]
    fn distribution_serializes_with_kind_tag() {
        let json = serde_json::to_value(Distribution::int_range(1, 2)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "int_range", "low": 1, "high": 2}));
    }
}
