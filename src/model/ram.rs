//! RAM model variant: asymmetric paths `A`, symmetric residuals `S`, optional
//! means `M`, a manifest filter, and between-level joins.

use super::{Cell, CellMatrix, DefVar, EvalContext, ExpectationModel, Join, MatrixSlot, RowBinding};
use crate::error::{EngineError, Result};
use crate::store::{DatasetId, ModelId};
use nalgebra::{DMatrix, DVector};

#[derive(Debug, Clone)]
pub struct RamModel {
    name: String,
    dataset: DatasetId,
    var_names: Vec<String>,
    a: CellMatrix,
    s: CellMatrix,
    m: Option<CellMatrix>,
    manifest: Vec<Option<usize>>,
    joins: Vec<Join>,
    def_vars: Vec<DefVar>,
}

impl RamModel {
    pub fn new(name: impl Into<String>, dataset: DatasetId, vars: &[&str]) -> Self {
        let k = vars.len();
        Self {
            name: name.into(),
            dataset,
            var_names: vars.iter().map(|v| v.to_string()).collect(),
            a: CellMatrix::zeros(k, k),
            s: CellMatrix::zeros(k, k),
            m: None,
            manifest: vec![None; k],
            joins: Vec::new(),
            def_vars: Vec::new(),
        }
    }

    /// Regression path `from -> to`, i.e. `A[to, from]`.
    pub fn path(mut self, to: usize, from: usize, cell: Cell) -> Self {
        self.a.set(to, from, cell);
        self.refresh_def_vars();
        self
    }

    pub fn variance(self, var: usize, cell: Cell) -> Self {
        self.covariance(var, var, cell)
    }

    pub fn covariance(mut self, r: usize, c: usize, cell: Cell) -> Self {
        self.s.set(r, c, cell);
        self.s.set(c, r, cell);
        self.refresh_def_vars();
        self
    }

    /// Declares a (possibly all-zero) mean structure.
    pub fn with_means(mut self) -> Self {
        if self.m.is_none() {
            self.m = Some(CellMatrix::zeros(self.var_names.len(), 1));
        }
        self
    }

    pub fn mean(mut self, var: usize, cell: Cell) -> Self {
        self = self.with_means();
        if let Some(m) = self.m.as_mut() {
            m.set(var, 0, cell);
        }
        self.refresh_def_vars();
        self
    }

    /// Marks `var` as observed in data column `column`.
    pub fn manifest(mut self, var: usize, column: usize) -> Self {
        self.manifest[var] = Some(column);
        self
    }

    pub fn join(mut self, foreign_key: usize, parent: ModelId, between: CellMatrix) -> Self {
        self.joins.push(Join { foreign_key, parent, between });
        self.refresh_def_vars();
        self
    }

    pub fn a(&self) -> &CellMatrix { &self.a }
    pub fn s(&self) -> &CellMatrix { &self.s }
    pub fn m(&self) -> Option<&CellMatrix> { self.m.as_ref() }

    fn refresh_def_vars(&mut self) {
        let mut out = Vec::new();
        let mut collect = |m: &CellMatrix, slot: MatrixSlot, lower_only: bool| {
            for (row, col, column) in m.data_cells() {
                if lower_only && row < col { continue; }
                out.push(DefVar { column, slot, row, col });
            }
        };
        collect(&self.a, MatrixSlot::Path, false);
        collect(&self.s, MatrixSlot::Residual, true);
        if let Some(m) = &self.m {
            collect(m, MatrixSlot::Mean, false);
        }
        for (jx, join) in self.joins.iter().enumerate() {
            collect(&join.between, MatrixSlot::Between(jx), false);
        }
        self.def_vars = out;
    }
}

impl ExpectationModel for RamModel {
    fn name(&self) -> &str { &self.name }
    fn dataset(&self) -> DatasetId { self.dataset }
    fn num_vars(&self) -> usize { self.var_names.len() }
    fn var_names(&self) -> &[String] { &self.var_names }
    fn manifest(&self) -> &[Option<usize>] { &self.manifest }
    fn has_mean_structure(&self) -> bool { self.m.is_some() }
    fn joins(&self) -> &[Join] { &self.joins }
    fn def_vars(&self) -> &[DefVar] { &self.def_vars }

    fn path_matrix(&self, ctx: &EvalContext, binding: &RowBinding<'_>) -> DMatrix<f64> {
        self.a.evaluate(ctx, binding)
    }

    fn residual_matrix(&self, ctx: &EvalContext, binding: &RowBinding<'_>) -> DMatrix<f64> {
        self.s.evaluate(ctx, binding)
    }

    fn mean_vector(&self, ctx: &EvalContext, binding: &RowBinding<'_>) -> Option<DVector<f64>> {
        self.m.as_ref().map(|m| m.evaluate_vector(ctx, binding))
    }

    fn path_pattern(&self) -> DMatrix<bool> { self.a.pattern() }
    fn residual_pattern(&self) -> DMatrix<bool> { self.s.pattern() }

    fn mean_pattern(&self) -> Option<Vec<bool>> {
        self.m.as_ref().map(|m| (0..m.rows()).map(|r| m.is_populated(r, 0)).collect())
    }
}

/// `(I - A)^-1` for a single unit, or `None` when singular.
pub fn path_inverse(a: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = a.nrows();
    (DMatrix::<f64>::identity(n, n) - a).try_inverse()
}

/// Model-implied manifest covariance `F Z S Z' F'` and mean `F Z M` of one
/// model evaluated on its own, without any joins.
pub fn implied_distribution(
    model: &dyn ExpectationModel,
    ctx: &EvalContext,
    binding: &RowBinding<'_>,
) -> Result<(DMatrix<f64>, Option<DVector<f64>>)> {
    let a = model.path_matrix(ctx, binding);
    if let Some(index) = (0..a.nrows()).find(|&i| a[(i, i)] != 0.0) {
        return Err(EngineError::NonzeroDiagonal { model: model.name().to_string(), index });
    }
    let s = model.residual_matrix(ctx, binding);
    let z = path_inverse(&a)
        .ok_or_else(|| EngineError::SingularPathMatrix { model: model.name().to_string(), group: 0 })?;

    let rows: Vec<usize> = model.manifest().iter().enumerate()
        .filter_map(|(i, m)| m.map(|_| i))
        .collect();
    let y = z.select_rows(rows.iter());

    let cov = &y * s * y.transpose();
    let mean = model.mean_vector(ctx, binding).map(|m| &y * m);
    Ok((cov, mean))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Dataset;

    #[test]
    fn test_single_factor_distribution() {
        // F -> x1, F -> x2 with loadings 1 and 2, var(F) = 1, residuals 0.5
        let ds = Dataset::new("d")
            .with_numeric("x1", vec![0.0]).unwrap()
            .with_numeric("x2", vec![0.0]).unwrap();
        let model = RamModel::new("factor", DatasetId(0), &["x1", "x2", "F"])
            .path(0, 2, Cell::Fixed(1.0))
            .path(1, 2, Cell::Free(0))
            .variance(2, Cell::Fixed(1.0))
            .variance(0, Cell::Fixed(0.5))
            .variance(1, Cell::Fixed(0.5))
            .mean(2, Cell::Fixed(3.0))
            .manifest(0, 0)
            .manifest(1, 1);
        let ctx = EvalContext::new(vec![2.0]);

        let (cov, mean) = implied_distribution(&model, &ctx, &RowBinding::new(&ds, 0)).unwrap();
        assert!((cov[(0, 0)] - 1.5).abs() < 1e-12);
        assert!((cov[(0, 1)] - 2.0).abs() < 1e-12);
        assert!((cov[(1, 1)] - 4.5).abs() < 1e-12);
        let mean = mean.unwrap();
        assert!((mean[0] - 3.0).abs() < 1e-12);
        assert!((mean[1] - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_nonzero_diagonal_is_structural() {
        let ds = Dataset::new("d").with_numeric("x", vec![0.0]).unwrap();
        let model = RamModel::new("bad", DatasetId(0), &["x"]).path(0, 0, Cell::Fixed(0.3));
        let err = implied_distribution(&model, &EvalContext::default(), &RowBinding::new(&ds, 0)).unwrap_err();
        assert!(matches!(err, EngineError::NonzeroDiagonal { index: 0, .. }));
    }

    #[test]
    fn test_def_vars_are_collected_once_for_symmetric_slots() {
        let model = RamModel::new("m", DatasetId(0), &["x", "y"])
            .covariance(0, 1, Cell::Data(4))
            .mean(0, Cell::Data(5));
        let slots: Vec<_> = model.def_vars().iter().map(|d| (d.slot, d.column)).collect();
        assert_eq!(slots, vec![(MatrixSlot::Residual, 4), (MatrixSlot::Mean, 5)]);
    }
}
