//! Definition-variable influence analysis.
//!
//! For every definition variable of every model, decides whether its value can
//! change the model-implied mean and/or variance. Comparisons used by the
//! symmetry detector and the partitioner only look at covariates flagged here.

use super::{ExpectationModel, MatrixSlot};
use crate::store::{ModelId, Registry};
use nalgebra::DMatrix;
use std::collections::BTreeSet;
use tracing::debug;

/// Per-model flags, indexed like `ExpectationModel::def_vars()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefVarInfluence {
    pub mean: Vec<bool>,
    pub var: Vec<bool>,
}

impl DefVarInfluence {
    pub fn affects_mean(&self, k: usize) -> bool { self.mean.get(k).copied().unwrap_or(true) }
    pub fn affects_var(&self, k: usize) -> bool { self.var.get(k).copied().unwrap_or(true) }
}

/// Which variables of a model carry a mean / variance, and which definition
/// variables (owner model, def var index) flow into each variable.
#[derive(Debug, Clone)]
struct Flow {
    has_mean: Vec<bool>,
    has_var: Vec<bool>,
    contribution: Vec<BTreeSet<(ModelId, usize)>>,
}

/// Runs the analysis over `order`, the models visited by flattening in order
/// of first appearance (parents before children).
///
/// With `analyze == false` definition variables in path and between matrices
/// are conservatively assumed to affect both mean and variance.
pub fn analyze_influence(registry: &Registry, order: &[ModelId], analyze: bool) -> Vec<DefVarInfluence> {
    let mut out = vec![DefVarInfluence::default(); registry.num_models()];
    let mut flows: Vec<Option<Flow>> = vec![None; registry.num_models()];

    // 1. Local effects from M and S
    for &id in order {
        let model = registry.model(id);
        let (flow, infl) = local_influence(id, model, analyze);
        flows[id.index()] = Some(flow);
        out[id.index()] = infl;
    }

    if analyze {
        // 2. Propagate through joins and within-model paths
        for &id in order {
            let model = registry.model(id);
            for (jx, join) in model.joins().iter().enumerate() {
                let transition = model.between_pattern(jx);
                propagate(&mut flows, &mut out, id, &transition, join.parent);
            }
            let z = reachability(&model.path_pattern());
            propagate(&mut flows, &mut out, id, &z, id);
        }

        // 3. Def vars sitting in between matrices and in A
        for &id in order {
            let model = registry.model(id);
            for (k, dv) in model.def_vars().iter().enumerate() {
                let source = match dv.slot {
                    MatrixSlot::Between(jx) => model.joins().get(jx).map(|j| j.parent),
                    MatrixSlot::Path => Some(id),
                    _ => None,
                };
                let Some(from) = source.and_then(|m| flows[m.index()].as_ref()) else { continue };
                out[id.index()].mean[k] = from.has_mean.get(dv.col).copied().unwrap_or(false);
                out[id.index()].var[k] = from.has_var.get(dv.col).copied().unwrap_or(false);
            }
        }
    }

    for &id in order {
        let model = registry.model(id);
        for (k, dv) in model.def_vars().iter().enumerate() {
            debug!(
                model = model.name(),
                column = dv.column,
                slot = ?dv.slot,
                mean = out[id.index()].mean[k],
                var = out[id.index()].var[k],
                "definition variable influence"
            );
        }
    }
    out
}

fn local_influence(id: ModelId, model: &dyn ExpectationModel, analyze: bool) -> (Flow, DefVarInfluence) {
    let k = model.num_vars();
    let n = model.def_vars().len();
    let has_mean = model.mean_pattern().unwrap_or_else(|| vec![false; k]);
    let s = model.residual_pattern();
    let has_var: Vec<bool> = (0..k).map(|i| s[(i, i)]).collect();

    let mut infl = DefVarInfluence { mean: vec![false; n], var: vec![false; n] };
    let mut contribution = vec![BTreeSet::new(); k];

    for (kx, dv) in model.def_vars().iter().enumerate() {
        match dv.slot {
            MatrixSlot::Mean => {
                infl.mean[kx] = true;
                infl.var[kx] |= has_var[dv.row];
                contribution[dv.row].insert((id, kx));
            }
            MatrixSlot::Residual => {
                infl.mean[kx] |= has_mean[dv.col];
                infl.var[kx] = true;
                contribution[dv.col].insert((id, kx));
            }
            MatrixSlot::Path | MatrixSlot::Between(_) => {
                if !analyze {
                    infl.mean[kx] = true;
                    infl.var[kx] = true;
                }
            }
        }
    }
    (Flow { has_mean, has_var, contribution }, infl)
}

/// Pushes mean/variance presence and def-var contributions from `from` into
/// `to` along the non-zero pattern of `transition` (`to_vars x from_vars`).
fn propagate(
    flows: &mut [Option<Flow>],
    out: &mut [DefVarInfluence],
    to: ModelId,
    transition: &DMatrix<bool>,
    from: ModelId,
) {
    let within = to == from;
    let Some(source) = flows[from.index()].clone() else { return };
    let Some(target) = flows[to.index()].as_mut() else { return };

    for r in 0..transition.nrows().min(target.has_mean.len()) {
        for c in 0..transition.ncols().min(source.has_mean.len()) {
            if !transition[(r, c)] { continue; }
            target.has_mean[r] |= source.has_mean[c];
            target.has_var[r] |= source.has_var[c];
        }
    }

    for r in 0..transition.nrows().min(target.contribution.len()) {
        for c in 0..transition.ncols().min(source.contribution.len()) {
            if within && r == c { continue; }
            if !transition[(r, c)] { continue; }

            let (has_mean, has_var) = if within {
                (false, false)
            } else {
                (source.has_mean[c], source.has_var[c])
            };
            if has_mean || has_var {
                for &(owner, k) in &source.contribution[c] {
                    if has_mean { out[owner.index()].mean[k] = true; }
                    if has_var { out[owner.index()].var[k] = true; }
                }
            }
            target.contribution[r].extend(source.contribution[c].iter().copied());
        }
    }
}

/// Non-zero pattern of `(I - A)^-1`: reflexive-transitive closure of `A`.
fn reachability(a: &DMatrix<bool>) -> DMatrix<bool> {
    let n = a.nrows();
    let mut z = DMatrix::from_fn(n, n, |r, c| r == c || a[(r, c)]);
    for k in 0..n {
        for r in 0..n {
            if !z[(r, k)] { continue; }
            for c in 0..n {
                if z[(k, c)] { z[(r, c)] = true; }
            }
        }
    }
    z
}
