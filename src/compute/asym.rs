//! Inversion of the group path matrix.
//!
//! The group matrix is stored transposed (`fullA = A'`): entry `(from, to)`
//! holds the coefficient of the path `from -> to`. `Z' = (I - A')^-1`; when
//! the pattern is nilpotent this is the finite series `I + A' + ... + A'^d`.

use super::sparse::SparseMatrix;
use nalgebra::DMatrix;

/// Smallest `d` with `P^(d+1) = 0` for the non-zero pattern `P`, or `None`
/// when no such `d <= max_depth` exists.
pub fn shallow_depth(pattern: &SparseMatrix, max_depth: usize) -> Option<usize> {
    let p = pattern.to_pattern();
    let mut power = p.clone();
    let mut depth = 0;
    while !power.is_empty() {
        if depth >= max_depth {
            return None;
        }
        power = power.mul(&p).to_pattern();
        depth += 1;
    }
    Some(depth)
}

/// `(I - A')^-1`. Uses the truncated series when `depth` is known, a dense
/// LU inverse otherwise. `None` when `I - A'` is singular.
pub fn invert(full_a: &SparseMatrix, depth: Option<usize>) -> Option<SparseMatrix> {
    match depth {
        Some(d) => {
            // Horner: Z = I + A(I + A(... (I + A)))
            let mut z = SparseMatrix::identity(full_a.rows());
            for _ in 0..d {
                z = full_a.mul(&z).add_identity();
            }
            Some(z)
        }
        None => {
            let n = full_a.rows();
            let dense = DMatrix::<f64>::identity(n, n) - full_a.to_dense();
            dense.try_inverse().map(|inv| SparseMatrix::from_dense(&inv))
        }
    }
}

/// Implied covariance of the observed variables: `IAF' S IAF` with
/// `IAF = Z'[:, observed]` and `S` stored in its lower triangle.
pub fn filtered_cov(z_t: &SparseMatrix, s_lower: &SparseMatrix, observed: &[usize]) -> DMatrix<f64> {
    let iaf = z_t.select_columns(observed);
    let s = s_lower.symmetric_from_lower();
    iaf.transpose().mul(&s.mul(&iaf)).to_dense()
}
