//! Independent-group partitioning: serializes connected components into
//! clumps, groups covariance-compatible clumps, and detects sufficient sets.

use super::compare::Comparator;
use crate::compute::asym::shallow_depth;
use crate::compute::sparse::SparseMatrix;
use crate::config::EngineOptions;
use crate::error::{EngineError, Result};
use crate::graph::{connected_components, Components, Layout, Membership, SkipMean};
use crate::model::DefVarInfluence;
use crate::store::{Registry, UnitId};
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Placement {
    pub model_start: usize,
    pub obs_start: usize,
}

/// Run of mean- and covariance-identical clumps summarised by the mean and
/// (population) covariance of their observations.
#[derive(Debug, Clone, PartialEq)]
pub struct SufficientSet {
    /// Index of the first clump.
    pub start: usize,
    /// Number of clumps.
    pub length: usize,
    pub data_mean: DVector<f64>,
    pub data_cov: DMatrix<f64>,
}

#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub index: usize,
    pub units: Vec<UnitId>,
    pub placements: Vec<Placement>,
    pub clump_size: usize,
    pub clump_vars: usize,
    pub clump_obs: usize,
    /// Over all placed model variables: observed and non-missing.
    pub latent_filter: Vec<bool>,
    /// Positions of the observed variables within the first clump.
    pub clump_observed: Vec<usize>,
    pub data_vec: DVector<f64>,
    pub obs_names: Vec<String>,
    pub var_names: Vec<String>,
    pub sufficient_sets: Vec<SufficientSet>,
    /// Shallow inverse depth of the first clump; `None` selects the dense inverse.
    pub depth: Option<usize>,
    placement_of: HashMap<UnitId, usize>,
}

impl GroupPlan {
    pub fn new(index: usize, clump_size: usize) -> Self {
        Self {
            index,
            units: Vec::new(),
            placements: Vec::new(),
            clump_size,
            clump_vars: 0,
            clump_obs: 0,
            latent_filter: Vec::new(),
            clump_observed: Vec::new(),
            data_vec: DVector::zeros(0),
            obs_names: Vec::new(),
            var_names: Vec::new(),
            sufficient_sets: Vec::new(),
            depth: None,
            placement_of: HashMap::new(),
        }
    }

    pub fn num_clumps(&self) -> usize {
        if self.clump_size == 0 { 0 } else { self.placements.len() / self.clump_size }
    }

    pub fn placement_index(&self, unit: UnitId) -> Option<usize> {
        self.placement_of.get(&unit).copied()
    }

    /// Clump indices not covered by any sufficient set.
    pub fn loose_clumps(&self) -> Vec<usize> {
        let mut covered = vec![false; self.num_clumps()];
        for ss in &self.sufficient_sets {
            for c in ss.start..ss.start + ss.length {
                covered[c] = true;
            }
        }
        (0..covered.len()).filter(|&c| !covered[c]).collect()
    }

    pub fn num_loose_clumps(&self) -> usize { self.loose_clumps().len() }

    fn end(&self, layout: &Layout) -> Placement {
        match (self.placements.last(), self.units.last()) {
            (Some(prev), Some(&last)) => {
                let unit = layout.unit(last);
                Placement { model_start: prev.model_start + unit.num_vars, obs_start: prev.obs_start + unit.num_obs }
            }
            _ => Placement::default(),
        }
    }

    pub fn place(&mut self, layout: &mut Layout, unit: UnitId) -> Result<()> {
        if layout.unit(unit).membership.is_some() {
            return Err(EngineError::UnitAlreadyPlaced { unit });
        }
        let pl = self.end(layout);
        layout.unit_mut(unit).membership = Some(Membership { group: self.index, index: self.placements.len() });
        self.placement_of.insert(unit, self.placements.len());
        self.placements.push(pl);
        self.units.push(unit);
        Ok(())
    }

    /// Sizes the vectors, loads the observed data and discovers the shallow
    /// inverse depth.
    pub fn prep(&mut self, layout: &Layout, registry: &Registry, options: &EngineOptions) -> Result<()> {
        let end = self.end(layout);
        debug!(group = self.index, max_size = end.model_start, observed = end.obs_start, "prepare group");

        self.latent_filter = vec![false; end.model_start];
        let mut data = Vec::with_capacity(end.obs_start);
        self.obs_names.clear();
        self.var_names.clear();

        let last = self.clump_size.saturating_sub(1).min(self.placements.len().saturating_sub(1));
        if let (Some(pl), Some(&u)) = (self.placements.get(last), self.units.get(last)) {
            let unit = layout.unit(u);
            self.clump_vars = pl.model_start + unit.num_vars;
            self.clump_obs = pl.obs_start + unit.num_obs;
        }

        for (ax, (&uid, pl)) in self.units.iter().zip(&self.placements).enumerate() {
            let unit = layout.unit(uid);
            let model = registry.model(unit.model);
            let dataset = registry.dataset(unit.dataset);
            trace!(unit = %uid, row = unit.row, model_start = pl.model_start, obs_start = pl.obs_start, ax, "place");

            for (vx, manifest) in model.manifest().iter().enumerate() {
                self.var_names.push(format!("{}.{}", model.name(), model.var_names()[vx]));
                let Some(col) = *manifest else { continue };
                let val = dataset.column_value(unit.row, col);
                if !val.is_finite() { continue; }
                self.latent_filter[pl.model_start + vx] = true;
                self.obs_names.push(format!("{}.{}", dataset.name(), dataset.column_name(col)));
                data.push(val);
            }
        }
        self.data_vec = DVector::from_vec(data);
        self.clump_observed = (0..self.clump_vars).filter(|&i| self.latent_filter[i]).collect();

        self.determine_shallow_depth(layout, registry, options)
    }

    /// Structural non-zero pattern of the first clump's transposed path matrix.
    pub fn path_pattern(&self, layout: &Layout, registry: &Registry) -> Result<SparseMatrix> {
        let mut triplets = Vec::new();
        for ax in 0..self.clump_size.min(self.units.len()) {
            let uid = self.units[ax];
            let pl = self.placements[ax];
            let unit = layout.unit(uid);
            let model = registry.model(unit.model);

            if unit.rampart_scale != 0.0 {
                for jx in 0..model.joins().len() {
                    let Some(parent) = layout.joined_with(uid, jx) else { continue };
                    let p2 = self.parent_start(layout, registry, parent)?;
                    let between = model.between_pattern(jx);
                    for r in 0..between.nrows() {
                        for c in 0..between.ncols() {
                            if between[(r, c)] {
                                triplets.push((p2 + c, pl.model_start + r, 1.0));
                            }
                        }
                    }
                }
            }

            let a = model.path_pattern();
            for c in 0..a.ncols() {
                for r in 0..a.nrows() {
                    if r != c && a[(r, c)] {
                        triplets.push((pl.model_start + c, pl.model_start + r, 1.0));
                    }
                }
            }
        }
        Ok(SparseMatrix::from_triplets(self.clump_vars, self.clump_vars, triplets))
    }

    /// Model-vector start of `parent`, which must sit in the first clump.
    pub fn parent_start(&self, layout: &Layout, registry: &Registry, parent: UnitId) -> Result<usize> {
        let not_placed = || {
            let p = layout.unit(parent);
            EngineError::RowNotPlaced { dataset: registry.dataset(p.dataset).name().to_string(), row: p.row }
        };
        let px = self.placement_index(parent).ok_or_else(not_placed)?;
        if px >= self.clump_size {
            return Err(not_placed());
        }
        Ok(self.placements[px].model_start)
    }

    fn determine_shallow_depth(&mut self, layout: &Layout, registry: &Registry, options: &EngineOptions) -> Result<()> {
        if !options.inverse_optimization {
            self.depth = None;
            return Ok(());
        }
        let pattern = self.path_pattern(layout, registry)?;
        self.depth = shallow_depth(&pattern, options.max_shallow_depth);
        match self.depth {
            Some(depth) => info!(group = self.index, depth, "shallow inverse depth"),
            None => info!(group = self.index, "path pattern not nilpotent; using dense inverse"),
        }
        Ok(())
    }

    /// Summarises each sufficient set from the (rotated) data and, for mean
    /// optimisation level 2, marks every copy after the first mean-skippable.
    pub fn finalize_data(&mut self, layout: &mut Layout, optimize_mean: u8) {
        if self.clump_obs == 0 {
            return;
        }
        let p = self.clump_obs;
        for ss in &mut self.sufficient_sets {
            let first = self.placements[ss.start * self.clump_size].obs_start;
            let seg = &self.data_vec.as_slice()[first..first + ss.length * p];
            let (mean, cov) = mean_cov(seg, p);
            ss.data_mean = mean;
            ss.data_cov = cov;

            if optimize_mean < 2 { continue; }
            for cx in 0..self.clump_size {
                let sm = &mut layout.setup_mut(self.units[ss.start * self.clump_size + cx]).skip_mean;
                if *sm == SkipMean::Unknown { *sm = SkipMean::No; }
            }
            for px in 1..ss.length {
                for cx in 0..self.clump_size {
                    let sm = &mut layout.setup_mut(self.units[(ss.start + px) * self.clump_size + cx]).skip_mean;
                    if *sm == SkipMean::Unknown { *sm = SkipMean::Yes; }
                }
            }
        }
    }
}

/// Element-wise mean and population covariance of consecutive chunks of
/// length `p`.
pub fn mean_cov(data: &[f64], p: usize) -> (DVector<f64>, DMatrix<f64>) {
    let n = if p == 0 { 0 } else { data.len() / p };
    let mut mean = DVector::zeros(p);
    for chunk in data.chunks_exact(p.max(1)).take(n) {
        mean += DVector::from_column_slice(chunk);
    }
    if n > 0 { mean /= n as f64; }

    let mut cov = DMatrix::zeros(p, p);
    for chunk in data.chunks_exact(p.max(1)).take(n) {
        let d = DVector::from_column_slice(chunk) - &mean;
        cov += &d * d.transpose();
    }
    if n > 0 { cov /= n as f64; }
    (mean, cov)
}

/// Clumps of one group in placement order, plus the sufficient-set runs.
struct Arrangement {
    clump_size: usize,
    clumps: Vec<Vec<UnitId>>,
    sets: Vec<(usize, usize)>,
}

/// Partitions the layout into independent groups, placing every unit once.
pub fn plan_groups(
    layout: &mut Layout,
    registry: &Registry,
    influence: &[DefVarInfluence],
    options: &EngineOptions,
) -> Result<(Vec<GroupPlan>, Components)> {
    let components = connected_components(layout);

    if options.force_single_group {
        let mut ig = GroupPlan::new(0, layout.len());
        for id in layout.ids().collect::<Vec<_>>() {
            ig.place(layout, id)?;
        }
        ig.prep(layout, registry, options)?;
        return Ok((vec![ig], components));
    }

    let arrangements = arrange(layout, registry, influence, &components, options.use_sufficient_sets);
    info!(groups = arrangements.len(), components = components.len(), "creating independent groups");

    let mut groups = Vec::with_capacity(arrangements.len());
    for (gx, arr) in arrangements.into_iter().enumerate() {
        let mut ig = GroupPlan::new(gx, arr.clump_size);
        for clump in &arr.clumps {
            for &u in clump {
                ig.place(layout, u)?;
            }
        }
        ig.sufficient_sets = arr
            .sets
            .iter()
            .map(|&(start, length)| SufficientSet {
                start,
                length,
                data_mean: DVector::zeros(0),
                data_cov: DMatrix::zeros(0, 0),
            })
            .collect();
        ig.prep(layout, registry, options)?;
        groups.push(ig);
    }
    Ok((groups, components))
}

fn serialize_clumps(layout: &Layout, components: &Components) -> Vec<Vec<UnitId>> {
    let mut done = vec![false; components.len()];
    let mut clumps = Vec::new();
    for ax in layout.ids() {
        let Some(cx) = components.region[ax.index()] else {
            clumps.push(vec![ax]);
            continue;
        };
        if done[cx] { continue; }
        done[cx] = true;

        // unclumped roots with their clump trees first, then leftovers
        let mut remaining = components.members[cx].clone();
        let mut clump = Vec::with_capacity(remaining.len());
        loop {
            let Some(root) = remaining.iter().copied().find(|&u| !layout.setup(u).clumped) else { break };
            let before = clump.len();
            layout.append_clump(root, &mut clump);
            for u in &clump[before..] {
                remaining.remove(u);
            }
        }
        clump.extend(remaining);
        clumps.push(clump);
    }
    clumps
}

fn arrange(
    layout: &Layout,
    registry: &Registry,
    influence: &[DefVarInfluence],
    components: &Components,
    use_sufficient_sets: bool,
) -> Vec<Arrangement> {
    let cmp = Comparator::new(registry, layout, influence);
    let mut clumps = serialize_clumps(layout, components);
    clumps.sort_by(|a, b| cmp.compatible_cov(a, b).then_with(|| a.cmp(b)));

    let mut out = Vec::new();
    for class in clumps.chunk_by(|a, b| cmp.compatible_cov(a, b).is_eq()) {
        let clump_size = class[0].len();
        let mut by_mean = class.to_vec();
        by_mean.sort_by(|a, b| cmp.compatible_mean(a, b));
        let runs: Vec<&[Vec<UnitId>]> = by_mean.chunk_by(|a, b| cmp.compatible_mean(a, b).is_eq()).collect();

        let mut arr = Arrangement { clump_size, clumps: Vec::new(), sets: Vec::new() };
        for run in runs.iter().filter(|r| r.len() == 1) {
            arr.clumps.extend(run.iter().cloned());
        }
        for run in runs.iter().filter(|r| r.len() > 1) {
            let from = arr.clumps.len();
            arr.clumps.extend(run.iter().cloned());
            let heterogeneous = run.iter().flatten().any(|&u| layout.setup(u).heterogeneous_mean);
            if heterogeneous { continue; }
            trace!(from, to = arr.clumps.len() - 1, clump_size, "same mean");
            arr.sets.push((from, run.len()));
        }
        if !use_sufficient_sets {
            arr.sets.clear();
        }
        out.push(arr);
    }
    out
}
