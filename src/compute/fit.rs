//! Gaussian -2 log-likelihood of a group.

use crate::analysis::GroupPlan;
use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;

/// `-2 log L` of the group's (rotated) data under the shared clump covariance
/// `cov` and the rotated `expected` vector. `None` when `cov` is not positive
/// definite.
pub fn minus2ll(gp: &GroupPlan, cov: &DMatrix<f64>, expected: &DVector<f64>) -> Option<f64> {
    let p = gp.clump_obs;
    if p == 0 || gp.data_vec.is_empty() {
        return Some(0.0);
    }
    let chol = cov.clone().cholesky()?;
    let log_det = 2.0 * chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>();
    let constant = p as f64 * (2.0 * PI).ln() + log_det;

    let clump_start = |c: usize| gp.placements[c * gp.clump_size].obs_start;
    let mut total = 0.0;

    for c in gp.loose_clumps() {
        let start = clump_start(c);
        let resid = gp.data_vec.rows(start, p) - expected.rows(start, p);
        let q = resid.dot(&chol.solve(&resid));
        total += constant + q;
    }

    for ss in &gp.sufficient_sets {
        let start = clump_start(ss.start);
        let n = ss.length as f64;
        let trace = chol.solve(&ss.data_cov).trace();
        let delta = &ss.data_mean - expected.rows(start, p);
        let q = delta.dot(&chol.solve(&delta));
        total += n * (constant + trace) + n * q;
    }
    Some(total)
}
