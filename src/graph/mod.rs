//! Unit graph: the flattened arena of (dataset, row) units and its
//! connectivity.
pub mod connected;
pub mod flatten;
pub mod layout;

pub use connected::{connected_components, Components};
pub use flatten::flatten;
pub use layout::{Layout, Membership, SkipMean, Unit, UnitSetup};
