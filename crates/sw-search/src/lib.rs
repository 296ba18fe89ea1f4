//! # sw-search
//!
//! Search spaces and the strategies that propose trials for Sweep.
//!
//! The scheduler only consumes the [`Algorithm`] trait; [`GridSearch`] and
//! [`RandomSearch`] are the built-in strategies.

mod algorithm;
mod grid;
mod random;
mod space;

pub use algorithm::Algorithm;
pub use grid::GridSearch;
pub use random::RandomSearch;
pub use space::{Distribution, ParameterDef, SearchSpace};
