//! Immutable evaluation plan: layout, influence flags, rotation plans and
//! independent groups, built once per structure and shared read-only.

use super::partition::{plan_groups, GroupPlan};
use super::rampart::{Rampart, RampartOutcome};
use super::rotation::{GroupVectors, RotationPlan};
use crate::config::EngineOptions;
use crate::error::Result;
use crate::graph::{flatten, Layout, SkipMean};
use crate::model::{analyze_influence, DefVarInfluence};
use crate::store::{ModelId, Registry};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Plan {
    pub home: ModelId,
    pub layout: Layout,
    pub influence: Vec<DefVarInfluence>,
    pub groups: Vec<GroupPlan>,
    /// Rotations applied to the observed data.
    pub data_plan: RotationPlan,
    /// Subset of `data_plan` that must also rotate model means.
    pub model_plan: RotationPlan,
    pub rampart_usage: Vec<usize>,
    pub rotation_count: usize,
    pub component_count: usize,
    /// `(group, obs_start)` per unit.
    pub obs_slots: Vec<(usize, usize)>,
    pub optimize_mean: u8,
}

impl Plan {
    pub fn build(registry: &Registry, home: ModelId, options: &EngineOptions) -> Result<Plan> {
        options.validate()?;
        let mut layout = flatten(registry, home)?;
        let influence = analyze_influence(registry, &layout.models, options.analyze_def_vars);

        let outcome = if options.rampart_enabled() {
            Rampart::new(registry, &influence, options.rampart_unit_limit, options.optimize_mean)
                .run(&mut layout, options.rampart_cycle_limit)
        } else {
            RampartOutcome::default()
        };

        let (mut groups, components) = plan_groups(&mut layout, registry, &influence, options)?;
        let obs_slots: Vec<(usize, usize)> = layout
            .units
            .iter()
            .map(|u| match u.membership {
                Some(m) => (m.group, groups[m.group].placements[m.index].obs_start),
                None => (0, 0),
            })
            .collect();

        let data_plan = outcome.plan;
        {
            let mut acc = GroupVectors { slots: &obs_slots, vectors: groups.iter_mut().map(|g| &mut g.data_vec).collect() };
            data_plan.apply(&mut acc);
        }
        for group in &mut groups {
            group.finalize_data(&mut layout, options.optimize_mean);
        }

        let model_plan = prune_model_plan(&mut layout, &data_plan, &outcome.model_filter, options.optimize_mean);
        assign_rotation_sets(&mut layout, &model_plan);
        assign_mean_strides(&mut layout);

        let plan = Plan {
            home,
            rotation_count: model_plan.rotation_count(),
            component_count: components.len(),
            layout,
            influence,
            groups,
            data_plan,
            model_plan,
            rampart_usage: outcome.usage,
            obs_slots,
            optimize_mean: options.optimize_mean,
        };
        info!(
            units = plan.layout.len(),
            groups = plan.groups.len(),
            components = plan.component_count,
            rotations = plan.data_plan.len(),
            "plan ready"
        );
        Ok(plan)
    }

    pub fn group(&self, gx: usize) -> &GroupPlan { &self.groups[gx] }

    pub fn num_groups(&self) -> usize { self.groups.len() }
}

/// Keeps the rotations that still act on model means. At level 2 an entry
/// with any mean-bearing unit pulls every unit it touches back in, so the
/// remaining plan is closed under the entries it depends on.
fn prune_model_plan(layout: &mut Layout, data_plan: &RotationPlan, filter: &[bool], optimize_mean: u8) -> RotationPlan {
    let mut model_plan = data_plan.retain_by(|px, _| filter.get(px).copied().unwrap_or(true));
    if optimize_mean < 2 {
        return model_plan;
    }
    for entry in model_plan.entries().iter().rev() {
        if entry.units.iter().all(|&u| layout.setup(u).skip_mean == SkipMean::Yes) {
            continue;
        }
        for &u in &entry.units {
            layout.setup_mut(u).skip_mean = SkipMean::No;
        }
    }
    model_plan = model_plan.retain_by(|_, e| layout.setup(e.units[0]).skip_mean == SkipMean::No);
    debug!(kept = model_plan.len(), of = data_plan.len(), "pruned model rotation plan");
    model_plan
}

fn assign_rotation_sets(layout: &mut Layout, model_plan: &RotationPlan) {
    for (r1, entry) in model_plan.entries().iter().enumerate() {
        for &u in &entry.units {
            let rset = &mut layout.setup_mut(u).rset;
            *rset = Some(match *rset {
                None => r1,
                Some(prev) => prev + 1000 + r1,
            });
        }
    }
}

/// Each mean-bearing unit records how far to step to the next one.
fn assign_mean_strides(layout: &mut Layout) {
    let n = layout.len();
    let mut ax = 0;
    while ax < n {
        let mut incr = 1;
        while ax + incr < n && layout.setup[ax + incr].skip_mean == SkipMean::Yes {
            incr += 1;
        }
        layout.units[ax].next_mean = incr;
        ax += incr;
    }
}
