//! Expectation models: the capability set the relational core needs from a
//! model variant, plus the RAM (reticular action model) implementation.
pub mod cells;
pub mod influence;
pub mod ram;

pub use cells::{Cell, CellMatrix, EvalContext, RowBinding};
pub use influence::{analyze_influence, DefVarInfluence};
pub use ram::RamModel;

use crate::store::{Dataset, DatasetId, ModelId};
use nalgebra::{DMatrix, DVector};
use std::fmt::Debug;

/// Which parameter matrix a definition variable is substituted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatrixSlot {
    Path,
    Residual,
    Mean,
    Between(usize),
}

/// A data column substituted into one cell of a model matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DefVar {
    pub column: usize,
    pub slot: MatrixSlot,
    pub row: usize,
    pub col: usize,
}

/// A foreign-key link from a child model to its parent ("upper level") model.
///
/// `between` is `child_vars x parent_vars`; entry `(r, c)` regresses child
/// variable `r` on parent variable `c`.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub foreign_key: usize,
    pub parent: ModelId,
    pub between: CellMatrix,
}

/// Capability set implemented by each model variant. Units record a `ModelId`
/// and the core dispatches through this trait.
pub trait ExpectationModel: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn dataset(&self) -> DatasetId;
    fn num_vars(&self) -> usize;
    fn var_names(&self) -> &[String];

    /// For every model variable, the data column it is observed in (manifest)
    /// or `None` (latent).
    fn manifest(&self) -> &[Option<usize>];
    fn has_mean_structure(&self) -> bool;
    fn joins(&self) -> &[Join];
    fn def_vars(&self) -> &[DefVar];

    fn path_matrix(&self, ctx: &EvalContext, binding: &RowBinding<'_>) -> DMatrix<f64>;
    fn residual_matrix(&self, ctx: &EvalContext, binding: &RowBinding<'_>) -> DMatrix<f64>;
    fn mean_vector(&self, ctx: &EvalContext, binding: &RowBinding<'_>) -> Option<DVector<f64>>;

    fn path_pattern(&self) -> DMatrix<bool>;
    fn residual_pattern(&self) -> DMatrix<bool>;
    fn mean_pattern(&self) -> Option<Vec<bool>>;

    fn between_matrix(&self, jx: usize, ctx: &EvalContext, binding: &RowBinding<'_>) -> DMatrix<f64> {
        self.joins()[jx].between.evaluate(ctx, binding)
    }

    fn between_pattern(&self, jx: usize) -> DMatrix<bool> {
        self.joins()[jx].between.pattern()
    }

    fn load_def_vars<'a>(&self, data: &'a Dataset, row: usize) -> RowBinding<'a> {
        RowBinding::new(data, row)
    }

    /// Data columns of the manifest variables, in variable order.
    fn data_columns(&self) -> Vec<usize> {
        self.manifest().iter().flatten().copied().collect()
    }

    fn num_manifest(&self) -> usize {
        self.manifest().iter().filter(|m| m.is_some()).count()
    }
}
