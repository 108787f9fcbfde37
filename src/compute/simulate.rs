//! Draws synthetic data from the model-implied distribution.

use super::group::GroupState;
use super::mean::{expected_means, MeanMode};
use crate::analysis::{GroupVectors, Plan};
use crate::error::{EngineError, Result};
use crate::model::EvalContext;
use crate::store::{DatasetId, Registry};
use nalgebra::DVector;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

/// Simulated values of one dataset, column-major, aligned with its rows.
/// Entries not produced by the model stay NaN.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulatedTable {
    pub dataset: DatasetId,
    pub name: String,
    pub column_names: Vec<String>,
    pub columns: Vec<Vec<f64>>,
}

impl SimulatedTable {
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.column_names.iter().position(|c| c == name).map(|i| self.columns[i].as_slice())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulatedData {
    pub tables: Vec<SimulatedTable>,
}

impl SimulatedData {
    pub fn table(&self, name: &str) -> Option<&SimulatedTable> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Group covariances in `states` must be current.
pub fn simulate(plan: &Plan, registry: &Registry, states: &[GroupState], ctx: &EvalContext, seed: u64) -> Result<SimulatedData> {
    let means = expected_means(plan, registry, ctx, MeanMode::Full)?;
    let home = registry.model(plan.home).name().to_string();

    let mut draws: Vec<DVector<f64>> = plan
        .groups
        .par_iter()
        .zip(states.par_iter())
        .zip(means.expected.par_iter())
        .map(|((gp, state), mu)| {
            let p = gp.clump_obs;
            let mut out = DVector::zeros(gp.data_vec.len());
            if p == 0 {
                return Ok(out);
            }
            let chol = state
                .cov
                .clone()
                .cholesky()
                .ok_or_else(|| EngineError::NonPositiveDefinite { model: home.clone(), group: gp.index })?;
            let l = chol.l();
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(gp.index as u64));
            for c in 0..gp.num_clumps() {
                let start = gp.placements[c * gp.clump_size].obs_start;
                let z: DVector<f64> = DVector::from_fn(p, |_, _| StandardNormal.sample(&mut rng));
                let x = mu.rows(start, p) + &l * z;
                out.rows_mut(start, p).copy_from(&x);
            }
            Ok(out)
        })
        .collect::<Result<Vec<_>>>()?;

    {
        let mut acc = GroupVectors { slots: &plan.obs_slots, vectors: draws.iter_mut().collect() };
        plan.data_plan.unapply(&mut acc);
    }

    let mut tables: Vec<SimulatedTable> = (0..registry.num_datasets())
        .map(|dx| {
            let id = DatasetId::new(dx);
            let data = registry.dataset(id);
            SimulatedTable {
                dataset: id,
                name: data.name().to_string(),
                column_names: (0..data.num_columns()).map(|c| data.column_name(c).to_string()).collect(),
                columns: vec![vec![f64::NAN; data.num_rows()]; data.num_columns()],
            }
        })
        .collect();

    for (gp, draw) in plan.groups.iter().zip(&draws) {
        let mut k = 0;
        for (&uid, pl) in gp.units.iter().zip(&gp.placements) {
            let unit = plan.layout.unit(uid);
            let model = registry.model(unit.model);
            for (vx, manifest) in model.manifest().iter().enumerate() {
                let Some(col) = *manifest else { continue };
                if !gp.latent_filter[pl.model_start + vx] { continue; }
                tables[unit.dataset.index()].columns[col][unit.row] = draw[k];
                k += 1;
            }
        }
    }
    info!(groups = plan.groups.len(), seed, "simulated data");
    Ok(SimulatedData { tables })
}
