//! Helmert rotation plan.
//!
//! Each entry lists mutually exchangeable units. Applying an entry replaces
//! the per-unit observations `x_0..x_{n-1}` with
//!
//! ```text
//! y_0 = (x_0 + ... + x_{n-1}) / sqrt(n)
//! y_i = (x_i + ... + x_{n-1}) / sqrt(k(k+1)) - sqrt(k/(k+1)) x_{i-1},  k = n - i
//! ```
//!
//! The transform is orthonormal, so unapplying uses its transpose.

use crate::store::UnitId;
use nalgebra::DVector;
use serde::Serialize;

/// Read/write access to observation `obs` of `unit`, wherever it is stored.
pub trait ObsAccess {
    fn get(&self, unit: UnitId, obs: usize) -> f64;
    fn set(&mut self, unit: UnitId, obs: usize, value: f64);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RotationEntry {
    pub units: Vec<UnitId>,
    pub num_obs: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RotationPlan {
    entries: Vec<RotationEntry>,
}

impl RotationPlan {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, units: Vec<UnitId>, num_obs: usize) {
        self.entries.push(RotationEntry { units, num_obs });
    }

    pub fn entries(&self) -> &[RotationEntry] { &self.entries }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Total number of unit slots touched by the plan.
    pub fn rotation_count(&self) -> usize {
        self.entries.iter().map(|e| e.units.len()).sum()
    }

    pub fn retain_by(&self, mut keep: impl FnMut(usize, &RotationEntry) -> bool) -> RotationPlan {
        let entries = self
            .entries
            .iter()
            .enumerate()
            .filter(|(px, e)| keep(*px, e))
            .map(|(_, e)| e.clone())
            .collect();
        RotationPlan { entries }
    }

    pub fn apply<A: ObsAccess>(&self, acc: &mut A) {
        let mut x = Vec::new();
        for entry in &self.entries {
            for ox in 0..entry.num_obs {
                x.clear();
                x.extend(entry.units.iter().map(|&u| acc.get(u, ox)));
                let y = helmert_forward(&x);
                for (&u, v) in entry.units.iter().zip(y) {
                    acc.set(u, ox, v);
                }
            }
        }
    }

    /// Exact inverse of `apply`; entries are undone in reverse order since a
    /// representative can take part in several rounds.
    pub fn unapply<A: ObsAccess>(&self, acc: &mut A) {
        let mut y = Vec::new();
        for entry in self.entries.iter().rev() {
            for ox in 0..entry.num_obs {
                y.clear();
                y.extend(entry.units.iter().map(|&u| acc.get(u, ox)));
                let x = helmert_inverse(&y);
                for (&u, v) in entry.units.iter().zip(x) {
                    acc.set(u, ox, v);
                }
            }
        }
    }
}

fn helmert_forward(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    let mut out = vec![0.0; n];
    if n == 0 {
        return out;
    }
    // suffix[i] = x_i + ... + x_{n-1}
    let mut partial: f64 = x.iter().sum();
    out[0] = partial / (n as f64).sqrt();
    for i in 1..n {
        let k = (n - i) as f64;
        partial -= x[i - 1];
        out[i] = partial / (k * (k + 1.0)).sqrt() - (k / (k + 1.0)).sqrt() * x[i - 1];
    }
    out
}

fn helmert_inverse(y: &[f64]) -> Vec<f64> {
    let n = y.len();
    let mut out = vec![0.0; n];
    if n == 0 {
        return out;
    }
    let mut prefix = y[0] / (n as f64).sqrt();
    for j in 0..n {
        if j >= 1 {
            let k = (n - j) as f64;
            prefix += y[j] / (k * (k + 1.0)).sqrt();
        }
        let mut v = prefix;
        if j + 1 < n {
            let k = (n - j - 1) as f64;
            v -= (k / (k + 1.0)).sqrt() * y[j + 1];
        }
        out[j] = v;
    }
    out
}

/// Observations of every unit stored in per-group vectors.
pub struct GroupVectors<'a> {
    /// `(group, obs_start)` per unit.
    pub slots: &'a [(usize, usize)],
    pub vectors: Vec<&'a mut DVector<f64>>,
}

impl<'a> ObsAccess for GroupVectors<'a> {
    #[inline]
    fn get(&self, unit: UnitId, obs: usize) -> f64 {
        let (g, start) = self.slots[unit.index()];
        self.vectors[g][start + obs]
    }

    #[inline]
    fn set(&mut self, unit: UnitId, obs: usize, value: f64) {
        let (g, start) = self.slots[unit.index()];
        self.vectors[g][start + obs] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// One observation per unit, stored contiguously.
    struct Flat(Vec<f64>);

    impl ObsAccess for Flat {
        fn get(&self, unit: UnitId, _obs: usize) -> f64 { self.0[unit.index()] }
        fn set(&mut self, unit: UnitId, _obs: usize, value: f64) { self.0[unit.index()] = value; }
    }

    fn ids(v: &[u32]) -> Vec<UnitId> { v.iter().map(|&i| UnitId(i)).collect() }

    #[rstest]
    #[case(vec![3.0, 3.0, 3.0])]
    #[case(vec![1.0, -2.0])]
    #[case(vec![0.5, 4.0, -1.5, 2.25, 7.0])]
    fn test_unapply_restores_values(#[case] values: Vec<f64>) {
        let n = values.len() as u32;
        let mut plan = RotationPlan::new();
        plan.push(ids(&(0..n).collect::<Vec<_>>()), 1);

        let mut acc = Flat(values.clone());
        plan.apply(&mut acc);
        plan.unapply(&mut acc);
        for (a, b) in acc.0.iter().zip(&values) {
            assert!((a - b).abs() < 1e-12, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_equal_values_concentrate_in_first_unit() {
        let mut plan = RotationPlan::new();
        plan.push(ids(&[0, 1, 2]), 1);
        let mut acc = Flat(vec![2.0, 2.0, 2.0]);
        plan.apply(&mut acc);

        assert!((acc.0[0] - 2.0 * 3f64.sqrt()).abs() < 1e-12);
        assert!(acc.0[1].abs() < 1e-12);
        assert!(acc.0[2].abs() < 1e-12);
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = helmert_forward(&x);
        let nx: f64 = x.iter().map(|v| v * v).sum();
        let ny: f64 = y.iter().map(|v| v * v).sum();
        assert!((nx - ny).abs() < 1e-12);
    }

    #[test]
    fn test_overlapping_entries_round_trip() {
        // unit 0 is rotated twice, as a representative in consecutive rounds
        let mut plan = RotationPlan::new();
        plan.push(ids(&[0, 1]), 1);
        plan.push(ids(&[0, 2, 3]), 1);
        let values = vec![1.0, 5.0, -3.0, 0.25];

        let mut acc = Flat(values.clone());
        plan.apply(&mut acc);
        plan.unapply(&mut acc);
        for (a, b) in acc.0.iter().zip(&values) {
            assert!((a - b).abs() < 1e-12);
        }
        assert_eq!(plan.rotation_count(), 5);
    }
}
