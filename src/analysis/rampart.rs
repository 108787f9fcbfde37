//! Rampart: collapses exchangeable leaf siblings into one rotated
//! representative clumped with its parent.

use super::compare::Comparator;
use super::rotation::RotationPlan;
use crate::graph::{Layout, SkipMean};
use crate::model::DefVarInfluence;
use crate::store::{Registry, UnitId};
use smallvec::SmallVec;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Default)]
pub struct RampartOutcome {
    pub plan: RotationPlan,
    /// Parallel to `plan`: whether the entry must also rotate model means.
    pub model_filter: Vec<bool>,
    /// Units unlinked per round.
    pub usage: Vec<usize>,
}

pub struct Rampart<'a> {
    registry: &'a Registry,
    influence: &'a [DefVarInfluence],
    unit_limit: Option<usize>,
    optimize_mean: u8,
    outcome: RampartOutcome,
}

impl<'a> Rampart<'a> {
    pub fn new(
        registry: &'a Registry,
        influence: &'a [DefVarInfluence],
        unit_limit: Option<usize>,
        optimize_mean: u8,
    ) -> Self {
        Self { registry, influence, unit_limit, optimize_mean, outcome: RampartOutcome::default() }
    }

    /// Repeats rounds until one unlinks nothing or `cycle_limit` rounds ran.
    pub fn run(mut self, layout: &mut Layout, cycle_limit: Option<usize>) -> RampartOutcome {
        let mut remaining = cycle_limit;
        let mut total = 0;
        loop {
            let level = self.outcome.usage.len();
            let more = self.round(layout, level);
            if more == 0 {
                break;
            }
            self.outcome.usage.push(more);
            total += more;
            if let Some(r) = remaining.as_mut() {
                *r = r.saturating_sub(1);
                if *r == 0 {
                    break;
                }
            }
        }
        info!(unlinked = total, rounds = self.outcome.usage.len(), "rampart finished");
        self.outcome
    }

    /// One round; returns the number of units unlinked.
    pub fn round(&mut self, layout: &mut Layout, level: usize) -> usize {
        let loop_to = self.unit_limit.map_or(layout.len(), |l| l.min(layout.len()));
        let mut candidates: Vec<UnitId> = (0..loop_to)
            .map(UnitId::new)
            .filter(|&id| {
                let s = layout.setup(id);
                s.num_kids == 0 && s.num_joins == 1 && !s.clumped && s.parent1.is_some()
            })
            .collect();

        let groups: Vec<Vec<UnitId>> = {
            let cmp = Comparator::new(self.registry, layout, self.influence);
            candidates.sort_by(|&a, &b| cmp.rampart_todo(a, b));
            candidates
                .chunk_by(|&a, &b| cmp.rampart_todo(a, b).is_eq())
                .map(|c| c.to_vec())
                .collect()
        };

        let mut unlinked = 0;
        for t1 in groups {
            let Some(parent) = layout.setup(t1[0]).parent1 else { continue };
            let n = t1.len();
            if n >= 2 {
                trace!(level, units = ?t1, "rotate");
                self.oertzen_rotate(layout, &t1);
                layout.unit_mut(t1[0]).rampart_scale = (n as f64).sqrt();
                layout.setup_mut(parent).num_kids -= n;
                layout.clump_with(parent, t1[0]);
                for &u in &t1[1..] {
                    layout.unit_mut(u).rampart_scale = 0.0;
                    layout.setup_mut(u).num_joins = 0;
                }
            } else {
                layout.setup_mut(parent).num_kids -= 1;
                layout.clump_with(parent, t1[0]);
            }
            unlinked += n - 1;
        }

        let resorted: Vec<(UnitId, SmallVec<[UnitId; 4]>)> = {
            let cmp = Comparator::new(self.registry, layout, self.influence);
            layout
                .ids()
                .filter(|&id| layout.setup(id).clump.len() > 1)
                .map(|id| {
                    let mut clump = layout.setup(id).clump.clone();
                    clump.sort_by(|&a, &b| cmp.clump_order(a, b));
                    (id, clump)
                })
                .collect()
        };
        for (id, clump) in resorted {
            layout.setup_mut(id).clump = clump;
        }

        debug!(level, unlinked, "rampart round");
        unlinked
    }

    /// Records rotations for `t1` and, position by position, for the members
    /// already clumped into each unit of `t1`.
    fn oertzen_rotate(&mut self, layout: &mut Layout, t1: &[UnitId]) {
        let mut todo = Vec::new();
        collect_rotations(layout, t1.to_vec(), &mut todo);

        let can_optimize = self.optimize_mean >= 1;
        for units in todo {
            let mismatch = {
                let cmp = Comparator::new(self.registry, layout, self.influence);
                units[1..].iter().any(|&u| cmp.mean_deep(units[0], u).is_ne())
            };
            let mut keep = true;
            if mismatch {
                for &u in &units {
                    layout.setup_mut(u).heterogeneous_mean = true;
                }
            } else if can_optimize {
                layout.unit_mut(units[0]).quick_rotation_factor *= (units.len() as f64).sqrt();
                for &u in &units[1..] {
                    layout.setup_mut(u).skip_mean = SkipMean::Yes;
                    layout.unit_mut(u).quick_rotation_factor = 0.0;
                }
                keep = false;
            }
            let num_obs = layout.unit(units[0]).num_obs;
            self.outcome.model_filter.push(keep);
            self.outcome.plan.push(units, num_obs);
        }
    }
}

fn collect_rotations(layout: &Layout, t1: Vec<UnitId>, out: &mut Vec<Vec<UnitId>>) {
    let width = layout.setup(t1[0]).clump.len();
    let nested: Vec<Vec<UnitId>> = (0..width)
        .filter_map(|cx| t1.iter().map(|&u| layout.setup(u).clump.get(cx).copied()).collect::<Option<Vec<_>>>())
        .collect();
    out.push(t1);
    for t2 in nested {
        collect_rotations(layout, t2, out);
    }
}
