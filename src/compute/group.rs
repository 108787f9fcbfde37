//! Per-group numeric state: the assembled path and residual matrices of the
//! first clump, its inverse and the implied observed covariance.

use super::asym::{filtered_cov, invert};
use super::sparse::SparseMatrix;
use crate::analysis::{GroupPlan, Plan};
use crate::error::{EngineError, Result};
use crate::model::EvalContext;
use crate::store::Registry;
use nalgebra::{DMatrix, DVector};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct GroupState {
    pub index: usize,
    /// Transposed path matrix, `(from, to)`.
    pub full_a: SparseMatrix,
    /// Residual matrix, lower triangle.
    pub full_s: SparseMatrix,
    pub inverse: Option<SparseMatrix>,
    /// Implied covariance of one clump's observations.
    pub cov: DMatrix<f64>,
    /// Expected observations, rotated, for the whole group.
    pub expected: DVector<f64>,
    /// Means of every variable of the group before filtering and rotation.
    pub full_mean: DVector<f64>,
    pub cov_failure: Option<EngineError>,
    pub mean_failure: Option<EngineError>,
    pub fit_failure: Option<EngineError>,
}

impl GroupState {
    pub fn new(gp: &GroupPlan) -> Self {
        Self {
            index: gp.index,
            full_a: SparseMatrix::zeros(gp.clump_vars, gp.clump_vars),
            full_s: SparseMatrix::zeros(gp.clump_vars, gp.clump_vars),
            inverse: None,
            cov: DMatrix::zeros(gp.clump_obs, gp.clump_obs),
            expected: DVector::zeros(gp.data_vec.len()),
            full_mean: DVector::zeros(0),
            cov_failure: None,
            mean_failure: None,
            fit_failure: None,
        }
    }

    /// Assembles `A'` and `S` for the first clump from the current parameters.
    pub fn assemble(&mut self, gp: &GroupPlan, plan: &Plan, registry: &Registry, ctx: &EvalContext) -> Result<()> {
        let layout = &plan.layout;
        let mut a_entries = Vec::new();
        let mut s_entries = Vec::new();

        for ax in 0..gp.clump_size.min(gp.units.len()) {
            let uid = gp.units[ax];
            let ms = gp.placements[ax].model_start;
            let unit = layout.unit(uid);
            let model = registry.model(unit.model);
            let binding = model.load_def_vars(registry.dataset(unit.dataset), unit.row);

            if unit.rampart_scale != 0.0 {
                for jx in 0..model.joins().len() {
                    let Some(parent) = layout.joined_with(uid, jx) else { continue };
                    let ps = gp.parent_start(layout, registry, parent)?;
                    let between = model.between_matrix(jx, ctx, &binding);
                    for c in 0..between.ncols() {
                        for r in 0..between.nrows() {
                            let v = between[(r, c)];
                            if v != 0.0 {
                                a_entries.push((ps + c, ms + r, v * unit.rampart_scale));
                            }
                        }
                    }
                }
            }

            let a = model.path_matrix(ctx, &binding);
            for c in 0..a.ncols() {
                for r in 0..a.nrows() {
                    let v = a[(r, c)];
                    if v == 0.0 { continue; }
                    if r == c {
                        return Err(EngineError::NonzeroDiagonal { model: model.name().to_string(), index: ms + c });
                    }
                    a_entries.push((ms + c, ms + r, v));
                }
            }

            let s = model.residual_matrix(ctx, &binding);
            for c in 0..s.ncols() {
                for r in c..s.nrows() {
                    s_entries.push((ms + r, ms + c, s[(r, c)]));
                }
            }
        }

        self.full_a = SparseMatrix::from_triplets(gp.clump_vars, gp.clump_vars, a_entries);
        self.full_s = SparseMatrix::from_triplets(gp.clump_vars, gp.clump_vars, s_entries);
        Ok(())
    }

    /// Refreshes the implied covariance. A singular `I - A` is recorded on the
    /// group and leaves a NaN covariance.
    pub fn compute_cov(&mut self, gp: &GroupPlan, plan: &Plan, registry: &Registry, ctx: &EvalContext) -> Result<()> {
        self.cov_failure = None;
        self.assemble(gp, plan, registry, ctx)?;
        self.inverse = invert(&self.full_a, gp.depth);
        match &self.inverse {
            Some(z) => {
                self.cov = filtered_cov(z, &self.full_s, &gp.clump_observed);
                trace!(group = gp.index, nnz = z.nnz(), "inverted path matrix");
            }
            None => {
                self.cov = DMatrix::from_element(gp.clump_obs, gp.clump_obs, f64::NAN);
                self.cov_failure = Some(EngineError::SingularPathMatrix {
                    model: registry.model(plan.home).name().to_string(),
                    group: gp.index,
                });
            }
        }
        Ok(())
    }

    pub fn failures(&self) -> impl Iterator<Item = &EngineError> {
        self.cov_failure.iter().chain(&self.mean_failure).chain(&self.fit_failure)
    }
}
