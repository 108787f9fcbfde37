//! Data collaborators: typed ids, in-memory datasets and the model registry.
pub mod dataset;
pub mod registry;
pub mod types;

pub use dataset::{Column, Dataset};
pub use registry::Registry;
pub use types::{DatasetId, ModelId, RowKey, UnitId};
