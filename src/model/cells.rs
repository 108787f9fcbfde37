//! Parameterised matrices and the explicit evaluation context.
//!
//! A `CellMatrix` is the stand-in for the algebra collaborator: every entry is
//! a fixed value, a free parameter, or a definition variable read from the
//! current data row. Nothing is cached globally; callers pass an `EvalContext`.

use crate::store::Dataset;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Versions are drawn from one process-wide counter, so two contexts never
/// share a version unless one was cloned from the other.
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Cell {
    #[default]
    Zero,
    Fixed(f64),
    /// Index into the parameter vector.
    Free(usize),
    /// Definition variable: column of the owning model's dataset.
    Data(usize),
}

impl Cell {
    /// Whether the entry can be non-zero for some parameter/data values.
    pub fn is_populated(&self) -> bool {
        match self {
            Cell::Zero => false,
            Cell::Fixed(v) => *v != 0.0,
            Cell::Free(_) | Cell::Data(_) => true,
        }
    }
}

/// Current parameter values plus a version counter and the fit sink.
#[derive(Debug, Clone)]
pub struct EvalContext {
    params: Vec<f64>,
    version: u64,
    fit: Option<f64>,
}

impl EvalContext {
    pub fn new(params: Vec<f64>) -> Self {
        Self { params, version: next_version(), fit: None }
    }

    pub fn params(&self) -> &[f64] { &self.params }
    pub fn version(&self) -> u64 { self.version }

    pub fn set_params(&mut self, params: Vec<f64>) {
        self.params = params;
        self.version = next_version();
    }

    pub fn set_param(&mut self, index: usize, value: f64) {
        if index >= self.params.len() {
            self.params.resize(index + 1, 0.0);
        }
        self.params[index] = value;
        self.version = next_version();
    }

    #[inline]
    pub fn param(&self, index: usize) -> f64 {
        self.params.get(index).copied().unwrap_or(f64::NAN)
    }

    pub fn record_fit(&mut self, value: f64) { self.fit = Some(value); }
    pub fn fit(&self) -> Option<f64> { self.fit }
}

impl Default for EvalContext {
    fn default() -> Self { Self::new(Vec::new()) }
}

/// Definition variables of one data row, as loaded for evaluation.
#[derive(Debug, Clone, Copy)]
pub struct RowBinding<'a> {
    pub data: &'a Dataset,
    pub row: usize,
}

impl<'a> RowBinding<'a> {
    pub fn new(data: &'a Dataset, row: usize) -> Self { Self { data, row } }

    #[inline]
    pub fn value(&self, col: usize) -> f64 { self.data.column_value(self.row, col) }
}

/// Column-major matrix of cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellMatrix {
    rows: usize,
    cols: usize,
    cells: Vec<Cell>,
}

impl CellMatrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self { rows, cols, cells: vec![Cell::Zero; rows * cols] }
    }

    pub fn from_fixed(rows: usize, cols: usize, values: &[f64]) -> Self {
        let mut m = Self::zeros(rows, cols);
        for (i, &v) in values.iter().enumerate().take(rows * cols) {
            if v != 0.0 { m.cells[i] = Cell::Fixed(v); }
        }
        m
    }

    pub fn rows(&self) -> usize { self.rows }
    pub fn cols(&self) -> usize { self.cols }
    pub fn shape(&self) -> (usize, usize) { (self.rows, self.cols) }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> Cell { self.cells[c * self.rows + r] }

    pub fn set(&mut self, r: usize, c: usize, cell: Cell) {
        self.cells[c * self.rows + r] = cell;
    }

    pub fn with(mut self, r: usize, c: usize, cell: Cell) -> Self {
        self.set(r, c, cell);
        self
    }

    pub fn is_populated(&self, r: usize, c: usize) -> bool { self.get(r, c).is_populated() }

    /// Definition-variable cells as `(row, col, data column)`.
    pub fn data_cells(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        self.cells.iter().enumerate().filter_map(move |(i, cell)| match cell {
            Cell::Data(col) => Some((i % self.rows, i / self.rows, *col)),
            _ => None,
        })
    }

    pub fn evaluate(&self, ctx: &EvalContext, binding: &RowBinding<'_>) -> DMatrix<f64> {
        DMatrix::from_fn(self.rows, self.cols, |r, c| match self.get(r, c) {
            Cell::Zero => 0.0,
            Cell::Fixed(v) => v,
            Cell::Free(p) => ctx.param(p),
            Cell::Data(col) => binding.value(col),
        })
    }

    /// Evaluates a single-row or single-column matrix as a vector.
    pub fn evaluate_vector(&self, ctx: &EvalContext, binding: &RowBinding<'_>) -> DVector<f64> {
        let m = self.evaluate(ctx, binding);
        DVector::from_iterator(m.len(), m.iter().copied())
    }

    /// Boolean non-zero pattern.
    pub fn pattern(&self) -> DMatrix<bool> {
        DMatrix::from_fn(self.rows, self.cols, |r, c| self.is_populated(r, c))
    }
}
