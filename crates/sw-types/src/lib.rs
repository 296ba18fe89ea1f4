pub mod params;
pub mod trial;
pub mod environment;
pub mod errors;

pub use params::*;
pub use trial::*;
pub use environment::*;
pub use errors::*;
