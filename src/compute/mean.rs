//! Model-implied means, unit by unit in layout order.

use crate::analysis::{GroupVectors, Plan};
use crate::error::{EngineError, Result};
use crate::graph::Layout;
use crate::model::ram::path_inverse;
use crate::model::EvalContext;
use crate::store::{Registry, UnitId};
use nalgebra::DVector;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeanMode {
    /// Fit-time means: skip-mean strides, quick factors and the model plan.
    Model,
    /// Every unit, rotated by the data plan; used for simulation.
    Full,
}

#[derive(Debug, Clone, Default)]
pub struct MeanOutcome {
    /// Rotated expected observations per group.
    pub expected: Vec<DVector<f64>>,
    /// Unfiltered, unrotated means of every variable per group, in placement
    /// order.
    pub full: Vec<DVector<f64>>,
    /// Numerical failures as `(group, error)`.
    pub failures: Vec<(usize, EngineError)>,
}

/// Start of each unit's block in the flat mean vector.
pub fn mean_offsets(layout: &Layout) -> Vec<usize> {
    layout
        .units
        .iter()
        .scan(0, |acc, u| {
            let start = *acc;
            *acc += u.num_vars;
            Some(start)
        })
        .collect()
}

pub fn expected_means(plan: &Plan, registry: &Registry, ctx: &EvalContext, mode: MeanMode) -> Result<MeanOutcome> {
    let layout = &plan.layout;
    let offsets = mean_offsets(layout);
    let mut full_mean = vec![0.0; layout.max_size];
    let mut failures = Vec::new();

    let mut ax = 0;
    while ax < layout.len() {
        let uid = UnitId::new(ax);
        let unit = layout.unit(uid);
        let model = registry.model(unit.model);
        let binding = model.load_def_vars(registry.dataset(unit.dataset), unit.row);

        let mut seg = model.mean_vector(ctx, &binding).unwrap_or_else(|| DVector::zeros(unit.num_vars));
        for jx in 0..model.joins().len() {
            let Some(parent) = layout.joined_with(uid, jx) else { continue };
            if parent >= uid {
                return Err(EngineError::NotTopological { unit: uid, parent });
            }
            let pu = layout.unit(parent);
            let start = offsets[parent.index()];
            let parent_mean = DVector::from_column_slice(&full_mean[start..start + pu.num_vars]);
            seg += model.between_matrix(jx, ctx, &binding) * parent_mean;
        }

        let a = model.path_matrix(ctx, &binding);
        if let Some(i) = (0..a.nrows()).find(|&i| a[(i, i)] != 0.0) {
            return Err(EngineError::NonzeroDiagonal { model: model.name().to_string(), index: i });
        }
        let seg = match path_inverse(&a) {
            Some(z) => z * seg,
            None => {
                let group = unit.membership.map_or(0, |m| m.group);
                failures.push((group, EngineError::SingularPathMatrix { model: model.name().to_string(), group }));
                DVector::from_element(unit.num_vars, f64::NAN)
            }
        };
        full_mean[offsets[ax]..offsets[ax] + unit.num_vars].copy_from_slice(seg.as_slice());

        ax += match mode {
            MeanMode::Model => unit.next_mean.max(1),
            MeanMode::Full => 1,
        };
    }

    let quick = mode == MeanMode::Model && plan.optimize_mean >= 1;
    let mut expected: Vec<DVector<f64>> = plan
        .groups
        .iter()
        .map(|gp| {
            let mut out = DVector::zeros(gp.data_vec.len());
            let mut k = 0;
            for (&uid, pl) in gp.units.iter().zip(&gp.placements) {
                let unit = layout.unit(uid);
                let factor = if quick { unit.quick_rotation_factor } else { 1.0 };
                for vx in 0..unit.num_vars {
                    if !gp.latent_filter[pl.model_start + vx] { continue; }
                    out[k] = full_mean[offsets[uid.index()] + vx] * factor;
                    k += 1;
                }
            }
            out
        })
        .collect();

    let full: Vec<DVector<f64>> = plan
        .groups
        .iter()
        .map(|gp| {
            let values: Vec<f64> = gp
                .units
                .iter()
                .flat_map(|&uid| {
                    let start = offsets[uid.index()];
                    full_mean[start..start + layout.unit(uid).num_vars].iter().copied()
                })
                .collect();
            DVector::from_vec(values)
        })
        .collect();

    let rotation = match mode {
        MeanMode::Model => &plan.model_plan,
        MeanMode::Full => &plan.data_plan,
    };
    {
        let mut acc = GroupVectors { slots: &plan.obs_slots, vectors: expected.iter_mut().collect() };
        rotation.apply(&mut acc);
    }
    debug!(?mode, rotations = rotation.len(), "expected means");
    Ok(MeanOutcome { expected, full, failures })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::testing::{family_child, family_params};
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(1)]
    fn test_representative_mean_is_scaled_sum(#[case] optimize_mean: u8) {
        let (reg, home) = family_child();
        let options = EngineOptions { optimize_mean, ..Default::default() };
        let plan = Plan::build(&reg, home, &options).unwrap();
        let out = expected_means(&plan, &reg, &family_params(), MeanMode::Model).unwrap();

        // child mean 0.1 + 0.6 * 0.5, three copies collapse into sqrt(3) * 0.4
        let (g, start) = plan.obs_slots[1];
        assert!((out.expected[g][start] - 3f64.sqrt() * 0.4).abs() < 1e-12);
        let (g, start) = plan.obs_slots[2];
        assert!(out.expected[g][start].abs() < 1e-12);
        let (g, start) = plan.obs_slots[0];
        assert!((out.expected[g][start] - 0.5).abs() < 1e-12);
        assert!(out.failures.is_empty());
    }

    #[test]
    fn test_full_mode_matches_unrotated_means() {
        let (reg, home) = family_child();
        let options = EngineOptions { rampart_cycle_limit: Some(0), ..Default::default() };
        let plan = Plan::build(&reg, home, &options).unwrap();
        let out = expected_means(&plan, &reg, &family_params(), MeanMode::Full).unwrap();

        let expected = [0.5, 0.4, 0.4, 0.4, 0.5, 0.4, 0.4, 0.4];
        for (got, want) in out.expected[0].iter().zip(expected) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_offsets_follow_variable_counts() {
        let (reg, home) = family_child();
        let plan = Plan::build(&reg, home, &EngineOptions::default()).unwrap();
        assert_eq!(mean_offsets(&plan.layout), (0..8).collect::<Vec<_>>());
    }
}
