//! Compressed sparse column matrix for the group path and residual matrices.
//!
//! Same layout idea as a CSR adjacency (offsets + flat targets), indexed by
//! column: entries of column `c` live in `row_idx[col_ptr[c]..col_ptr[c+1]]`.

use nalgebra::DMatrix;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseMatrix {
    rows: usize,
    cols: usize,
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    values: Vec<f64>,
}

impl SparseMatrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self { rows, cols, col_ptr: vec![0; cols + 1], row_idx: Vec::new(), values: Vec::new() }
    }

    pub fn identity(n: usize) -> Self {
        Self {
            rows: n,
            cols: n,
            col_ptr: (0..=n).collect(),
            row_idx: (0..n).collect(),
            values: vec![1.0; n],
        }
    }

    /// Builds from `(row, col, value)` triplets. A later triplet for the same
    /// position overwrites an earlier one; zeros are dropped.
    pub fn from_triplets(rows: usize, cols: usize, triplets: impl IntoIterator<Item = (usize, usize, f64)>) -> Self {
        let mut t: Vec<(usize, usize, usize, f64)> = triplets
            .into_iter()
            .enumerate()
            .map(|(seq, (r, c, v))| (c, r, seq, v))
            .collect();
        t.sort_unstable_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

        let mut m = Self::zeros(rows, cols);
        let mut counts = vec![0usize; cols];
        let mut ix = 0;
        while ix < t.len() {
            let (c, r) = (t[ix].0, t[ix].1);
            let mut last = ix;
            while last + 1 < t.len() && t[last + 1].0 == c && t[last + 1].1 == r {
                last += 1;
            }
            let v = t[last].3;
            if v != 0.0 {
                m.row_idx.push(r);
                m.values.push(v);
                counts[c] += 1;
            }
            ix = last + 1;
        }
        for c in 0..cols {
            m.col_ptr[c + 1] = m.col_ptr[c] + counts[c];
        }
        m
    }

    pub fn from_dense(d: &DMatrix<f64>) -> Self {
        let mut m = Self::zeros(d.nrows(), d.ncols());
        for c in 0..d.ncols() {
            for r in 0..d.nrows() {
                let v = d[(r, c)];
                if v != 0.0 {
                    m.row_idx.push(r);
                    m.values.push(v);
                }
            }
            m.col_ptr[c + 1] = m.row_idx.len();
        }
        m
    }

    pub fn rows(&self) -> usize { self.rows }
    pub fn cols(&self) -> usize { self.cols }
    pub fn nnz(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    #[inline]
    fn column(&self, c: usize) -> (&[usize], &[f64]) {
        let (s, e) = (self.col_ptr[c], self.col_ptr[c + 1]);
        (&self.row_idx[s..e], &self.values[s..e])
    }

    pub fn get(&self, r: usize, c: usize) -> f64 {
        let (rows, vals) = self.column(c);
        rows.binary_search(&r).map_or(0.0, |i| vals[i])
    }

    /// Non-zero entries as `(row, col, value)`, column by column.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        (0..self.cols).flat_map(move |c| {
            let (rows, vals) = self.column(c);
            rows.iter().zip(vals).map(move |(&r, &v)| (r, c, v))
        })
    }

    pub fn transpose(&self) -> Self {
        Self::from_triplets(self.cols, self.rows, self.iter().map(|(r, c, v)| (c, r, v)))
    }

    /// Sparse product (Gustavson, column by column).
    pub fn mul(&self, rhs: &SparseMatrix) -> SparseMatrix {
        debug_assert_eq!(self.cols, rhs.rows);
        let mut out = Self::zeros(self.rows, rhs.cols);
        let mut acc = vec![0.0; self.rows];
        let mut mark = vec![usize::MAX; self.rows];
        let mut touched: Vec<usize> = Vec::new();

        for j in 0..rhs.cols {
            touched.clear();
            let (krows, kvals) = rhs.column(j);
            for (&k, &bkj) in krows.iter().zip(kvals) {
                let (irows, ivals) = self.column(k);
                for (&i, &aik) in irows.iter().zip(ivals) {
                    if mark[i] != j {
                        mark[i] = j;
                        acc[i] = 0.0;
                        touched.push(i);
                    }
                    acc[i] += aik * bkj;
                }
            }
            touched.sort_unstable();
            for &i in &touched {
                if acc[i] != 0.0 {
                    out.row_idx.push(i);
                    out.values.push(acc[i]);
                }
            }
            out.col_ptr[j + 1] = out.row_idx.len();
        }
        out
    }

    /// `I + self` for a square matrix.
    pub fn add_identity(&self) -> Self {
        let n = self.rows.min(self.cols);
        let diag = (0..n).map(|i| (i, i, 1.0 + self.get(i, i)));
        Self::from_triplets(self.rows, self.cols, self.iter().filter(|(r, c, _)| r != c).chain(diag))
    }

    /// Keeps the listed columns, in order.
    pub fn select_columns(&self, cols: &[usize]) -> Self {
        let mut out = Self::zeros(self.rows, cols.len());
        for (j, &c) in cols.iter().enumerate() {
            let (rows, vals) = self.column(c);
            out.row_idx.extend_from_slice(rows);
            out.values.extend_from_slice(vals);
            out.col_ptr[j + 1] = out.row_idx.len();
        }
        out
    }

    /// Full symmetric matrix from one stored in its lower triangle.
    pub fn symmetric_from_lower(&self) -> Self {
        Self::from_triplets(
            self.rows,
            self.cols,
            self.iter()
                .filter(|(r, c, _)| r >= c)
                .flat_map(|(r, c, v)| {
                    let mirror = if r != c { Some((c, r, v)) } else { None };
                    std::iter::once((r, c, v)).chain(mirror)
                }),
        )
    }

    /// Same sparsity with every stored value set to one.
    pub fn to_pattern(&self) -> Self {
        Self { values: vec![1.0; self.values.len()], ..self.clone() }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut d = DMatrix::zeros(self.rows, self.cols);
        for (r, c, v) in self.iter() {
            d[(r, c)] = v;
        }
        d
    }
}
