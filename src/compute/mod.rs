//! Numeric evaluation: sparse group matrices, inversion, means, fit and
//! simulation.
pub mod asym;
pub mod engine;
pub mod fit;
pub mod group;
pub mod mean;
pub mod simulate;
pub mod sparse;

pub use engine::RelationalState;
pub use group::GroupState;
pub use mean::{expected_means, MeanMode, MeanOutcome};
pub use simulate::{SimulatedData, SimulatedTable};
pub use sparse::SparseMatrix;
