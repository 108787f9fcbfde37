//! Diagnostic view of a relational state: the unit layout table, group
//! placements and matrices, sufficient-set summaries and rotation usage.

use crate::analysis::{Placement, Plan};
use crate::compute::RelationalState;
use crate::graph::SkipMean;
use nalgebra::DMatrix;
use serde::Serialize;
use std::fmt::Write;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct Export {
    pub home: String,
    pub num_groups: usize,
    pub component_count: usize,
    pub rampart_usage: Vec<usize>,
    pub rotation_count: usize,
    pub units: Vec<UnitRow>,
    pub groups: Vec<GroupExport>,
    /// Set when `max_debug_groups` cut the group list short.
    pub groups_truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitRow {
    pub unit: usize,
    pub model: String,
    pub dataset: String,
    pub row: usize,
    pub num_vars: usize,
    pub num_obs: usize,
    pub parent1: Option<usize>,
    pub fk1: Option<i64>,
    pub rampart_scale: f64,
    pub quick_rotation_factor: f64,
    pub skip_mean: SkipMean,
    pub heterogeneous_mean: bool,
    pub rset: Option<usize>,
    pub group: Option<usize>,
    pub index: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SufficientSetExport {
    pub start: usize,
    pub length: usize,
    pub mean: Vec<f64>,
    pub cov: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupExport {
    pub index: usize,
    pub clump_size: usize,
    pub num_clumps: usize,
    pub depth: Option<usize>,
    pub units: Vec<usize>,
    pub placements: Vec<Placement>,
    pub obs_names: Vec<String>,
    pub var_names: Vec<String>,
    /// Empty when the group has more than `max_export_obs` observations.
    pub data: Vec<f64>,
    pub expected: Vec<f64>,
    pub cov: Vec<Vec<f64>>,
    /// First clump's path matrix, `a[to][from]`.
    pub a: Vec<Vec<f64>>,
    /// First clump's residual matrix, both triangles.
    pub s: Vec<Vec<f64>>,
    pub full_mean: Vec<f64>,
    pub latent_filter: Vec<bool>,
    pub sufficient_sets: Vec<SufficientSetExport>,
    pub failures: Vec<String>,
}

fn rows(m: &DMatrix<f64>) -> Vec<Vec<f64>> {
    m.row_iter().map(|r| r.iter().copied().collect()).collect()
}

fn unit_rows(state: &RelationalState) -> Vec<UnitRow> {
    let (plan, registry) = (state.plan(), state.registry());
    plan.layout
        .ids()
        .map(|id| {
            let unit = plan.layout.unit(id);
            let setup = plan.layout.setup(id);
            UnitRow {
                unit: id.index(),
                model: registry.model(unit.model).name().to_string(),
                dataset: registry.dataset(unit.dataset).name().to_string(),
                row: unit.row,
                num_vars: unit.num_vars,
                num_obs: unit.num_obs,
                parent1: setup.parent1.map(|p| p.index()),
                fk1: setup.fk1,
                rampart_scale: unit.rampart_scale,
                quick_rotation_factor: unit.quick_rotation_factor,
                skip_mean: setup.skip_mean,
                heterogeneous_mean: setup.heterogeneous_mean,
                rset: setup.rset,
                group: unit.membership.map(|m| m.group),
                index: unit.membership.map(|m| m.index),
            }
        })
        .collect()
}

fn group_export(plan: &Plan, state: &RelationalState, gx: usize, max_obs: usize) -> GroupExport {
    let gp = plan.group(gx);
    let gs = state.group(gx);
    let small = gp.data_vec.len() <= max_obs;
    if !small {
        warn!(group = gx, observed = gp.data_vec.len(), max_obs, "group too large; matrices omitted from export");
    }
    GroupExport {
        index: gp.index,
        clump_size: gp.clump_size,
        num_clumps: gp.num_clumps(),
        depth: gp.depth,
        units: gp.units.iter().map(|u| u.index()).collect(),
        placements: gp.placements.clone(),
        obs_names: gp.obs_names.clone(),
        var_names: gp.var_names.clone(),
        data: if small { gp.data_vec.iter().copied().collect() } else { Vec::new() },
        expected: if small { gs.expected.iter().copied().collect() } else { Vec::new() },
        cov: if small { rows(&gs.cov) } else { Vec::new() },
        a: if small { rows(&gs.full_a.transpose().to_dense()) } else { Vec::new() },
        s: if small { rows(&gs.full_s.symmetric_from_lower().to_dense()) } else { Vec::new() },
        full_mean: if small { gs.full_mean.iter().copied().collect() } else { Vec::new() },
        latent_filter: if small { gp.latent_filter.clone() } else { Vec::new() },
        sufficient_sets: gp
            .sufficient_sets
            .iter()
            .map(|ss| SufficientSetExport {
                start: ss.start,
                length: ss.length,
                mean: ss.data_mean.iter().copied().collect(),
                cov: rows(&ss.data_cov),
            })
            .collect(),
        failures: gs.failures().map(|e| e.to_string()).collect(),
    }
}

pub fn export(state: &RelationalState) -> Export {
    let plan = state.plan();
    let options = state.options();
    let shown = plan.num_groups().min(options.max_debug_groups);
    if shown < plan.num_groups() && options.max_debug_groups > 0 {
        warn!(groups = plan.num_groups(), max_debug_groups = options.max_debug_groups, "export truncated");
    }
    Export {
        home: state.registry().model(plan.home).name().to_string(),
        num_groups: plan.num_groups(),
        component_count: plan.component_count,
        rampart_usage: plan.rampart_usage.clone(),
        rotation_count: plan.rotation_count,
        units: unit_rows(state),
        groups: (0..shown).map(|gx| group_export(plan, state, gx, options.max_export_obs)).collect(),
        groups_truncated: shown < plan.num_groups(),
    }
}

impl Export {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self).map_err(io::Error::from)
    }

    /// Fixed-width unit layout table followed by one line per group.
    pub fn format_layout(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "RELATIONAL LAYOUT for model '{}'", self.home);
        let _ = writeln!(
            out,
            "{} groups, {} components, rampart {:?}, {} rotations",
            self.num_groups, self.component_count, self.rampart_usage, self.rotation_count
        );
        let _ = writeln!(out, "--------------------------------------------------");
        let _ = writeln!(out, "{: >5} {: <12} {: >5} {: >7} {: >8} {: >6} {: >6}", "unit", "model", "row", "parent", "scale", "group", "index");
        for u in &self.units {
            let parent = u.parent1.map_or("-".to_string(), |p| p.to_string());
            let group = u.group.map_or("-".to_string(), |g| g.to_string());
            let index = u.index.map_or("-".to_string(), |i| i.to_string());
            let _ = writeln!(
                out,
                "{: >5} {: <12} {: >5} {: >7} {: >8.4} {: >6} {: >6}",
                u.unit, u.model, u.row, parent, u.rampart_scale, group, index
            );
        }
        for g in &self.groups {
            let _ = writeln!(
                out,
                "group {}: {} x {} units, {} sufficient sets, depth {:?}",
                g.index,
                g.num_clumps,
                g.clump_size,
                g.sufficient_sets.len(),
                g.depth
            );
        }
        out
    }
}
