//! Human- and machine-readable diagnostics.
pub mod export;

pub use export::{export, Export, GroupExport, SufficientSetExport, UnitRow};
