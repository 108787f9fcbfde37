//! Total orders over units and clumps used to detect exchangeable siblings
//! and compatible clumps.

use crate::graph::Layout;
use crate::model::DefVarInfluence;
use crate::store::{Registry, UnitId};
use std::cmp::Ordering;

#[derive(Clone, Copy)]
enum Influence {
    Mean,
    Var,
}

pub struct Comparator<'a> {
    pub registry: &'a Registry,
    pub layout: &'a Layout,
    pub influence: &'a [DefVarInfluence],
}

impl<'a> Comparator<'a> {
    pub fn new(registry: &'a Registry, layout: &'a Layout, influence: &'a [DefVarInfluence]) -> Self {
        Self { registry, layout, influence }
    }

    /// Model, variable count, missingness, rampart scale, then covariance
    /// relevant covariates.
    pub fn missingness_and_cov(&self, l: UnitId, r: UnitId) -> Ordering {
        let (lu, ru) = (self.layout.unit(l), self.layout.unit(r));
        lu.model
            .cmp(&ru.model)
            .then(lu.num_vars.cmp(&ru.num_vars))
            .then_with(|| {
                let (lm, rm) = (&self.layout.setup(l).observed, &self.layout.setup(r).observed);
                lm.len().cmp(&rm.len()).then_with(|| lm.cmp(rm))
            })
            .then_with(|| lu.rampart_scale.total_cmp(&ru.rampart_scale))
            .then_with(|| self.def_vars(l, r, Influence::Var))
    }

    /// `missingness_and_cov` applied recursively over clump members.
    pub fn cov_clump(&self, l: UnitId, r: UnitId) -> Ordering {
        self.missingness_and_cov(l, r).then_with(|| {
            let (lc, rc) = (&self.layout.setup(l).clump, &self.layout.setup(r).clump);
            lc.len().cmp(&rc.len()).then_with(|| {
                lc.iter()
                    .zip(rc.iter())
                    .map(|(&a, &b)| self.cov_clump(a, b))
                    .find(|o| o.is_ne())
                    .unwrap_or(Ordering::Equal)
            })
        })
    }

    /// Mean relevant covariates, recursively through the join ancestry.
    pub fn mean_deep(&self, l: UnitId, r: UnitId) -> Ordering {
        let (lu, ru) = (self.layout.unit(l), self.layout.unit(r));
        if lu.model != ru.model {
            return lu.model.cmp(&ru.model);
        }
        let joins = self.registry.model(lu.model).joins().len();
        for jx in 0..joins {
            let ord = match (self.layout.joined_with(l, jx), self.layout.joined_with(r, jx)) {
                (None, None) => continue,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(lp), Some(rp)) => self.mean_deep(lp, rp),
            };
            if ord.is_ne() {
                return ord;
            }
        }
        self.def_vars(l, r, Influence::Mean)
    }

    /// Clumps are ordered by size, then unit by unit.
    pub fn compatible_cov(&self, l: &[UnitId], r: &[UnitId]) -> Ordering {
        l.len().cmp(&r.len()).then_with(|| {
            l.iter()
                .zip(r)
                .map(|(&a, &b)| self.missingness_and_cov(a, b))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        })
    }

    pub fn compatible_mean(&self, l: &[UnitId], r: &[UnitId]) -> Ordering {
        l.iter()
            .zip(r)
            .map(|(&a, &b)| self.mean_deep(a, b))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Grouping key of Rampart candidates: first foreign key and parent, then
    /// clump shape.
    pub fn rampart_todo(&self, l: UnitId, r: UnitId) -> Ordering {
        self.layout
            .setup(l)
            .fk1
            .cmp(&self.layout.setup(r).fk1)
            .then_with(|| self.layout.setup(l).parent1.cmp(&self.layout.setup(r).parent1))
            .then_with(|| self.cov_clump(l, r))
    }

    /// Order of members inside a clump; ties broken by unit id.
    pub fn clump_order(&self, l: UnitId, r: UnitId) -> Ordering {
        self.cov_clump(l, r).then(l.cmp(&r))
    }

    fn def_vars(&self, l: UnitId, r: UnitId, which: Influence) -> Ordering {
        let (lu, ru) = (self.layout.unit(l), self.layout.unit(r));
        let model = self.registry.model(lu.model);
        let data = self.registry.dataset(lu.dataset);
        let Some(infl) = self.influence.get(lu.model.index()) else { return Ordering::Equal };

        for (k, dv) in model.def_vars().iter().enumerate() {
            let relevant = match which {
                Influence::Mean => infl.affects_mean(k),
                Influence::Var => infl.affects_var(k),
            };
            if !relevant { continue; }
            let lv = data.column_value(lu.row, dv.column);
            let rv = data.column_value(ru.row, dv.column);
            let ord = lv.total_cmp(&rv);
            if ord.is_ne() {
                return ord;
            }
        }
        Ordering::Equal
    }
}
