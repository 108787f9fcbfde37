//! Planning: symmetry detection, Rampart rotation and group partitioning.
pub mod compare;
pub mod partition;
pub mod plan;
pub mod rampart;
pub mod rotation;

// Re-export key types for convenient access
pub use compare::Comparator;
pub use partition::{GroupPlan, Placement, SufficientSet};
pub use plan::Plan;
pub use rampart::{Rampart, RampartOutcome};
pub use rotation::{GroupVectors, ObsAccess, RotationEntry, RotationPlan};
