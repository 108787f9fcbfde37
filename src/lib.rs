// Relational RAM core: flattens keyed datasets into units, collapses
// exchangeable siblings with Rampart rotations, partitions the units into
// independent groups and evaluates the implied distribution per group.

pub mod analysis;
pub mod compute;
pub mod config;
pub mod display;
pub mod error;
pub mod expectation;
pub mod graph;
pub mod model;
pub mod store;

#[cfg(test)]
pub mod testing;

// Re-export key types for convenient access
pub use compute::{RelationalState, SimulatedData, SimulatedTable};
pub use config::EngineOptions;
pub use display::Export;
pub use error::{EngineError, ErrorKind, Result};
pub use expectation::{Component, RelationalExpectation};
pub use model::{Cell, CellMatrix, EvalContext, ExpectationModel, RamModel};
pub use store::{Dataset, DatasetId, ModelId, Registry, UnitId};
