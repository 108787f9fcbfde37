use super::fit::minus2ll;
use super::group::GroupState;
use super::mean::{expected_means, MeanMode};
use super::simulate::{simulate, SimulatedData};
use crate::analysis::Plan;
use crate::config::EngineOptions;
use crate::error::{EngineError, Result};
use crate::model::EvalContext;
use crate::store::{ModelId, Registry};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

/// Evaluation state of one relational expectation: the shared immutable plan
/// plus per-group scratch.
#[derive(Debug)]
pub struct RelationalState {
    registry: Arc<Registry>,
    options: EngineOptions,
    plan: Arc<Plan>,
    groups: Vec<GroupState>,
    cov_version: Option<u64>,
}

impl RelationalState {
    pub fn new(registry: Arc<Registry>, home: ModelId, options: EngineOptions) -> Result<Self> {
        let plan = Arc::new(Plan::build(&registry, home, &options)?);
        let groups = plan.groups.iter().map(GroupState::new).collect();
        Ok(Self { registry, options, plan, groups, cov_version: None })
    }

    pub fn plan(&self) -> &Arc<Plan> { &self.plan }
    pub fn registry(&self) -> &Registry { &self.registry }
    pub fn options(&self) -> &EngineOptions { &self.options }
    pub fn groups(&self) -> &[GroupState] { &self.groups }
    pub fn group(&self, gx: usize) -> &GroupState { &self.groups[gx] }

    /// Rebuilds the plan from scratch, for use after the data or the model
    /// structure changed.
    pub fn invalidate(&mut self) -> Result<()> {
        *self = Self::new(Arc::clone(&self.registry), self.plan.home, self.options.clone())?;
        Ok(())
    }

    /// Refreshes every group covariance unless `ctx` is unchanged since the
    /// last call.
    pub fn compute_cov(&mut self, ctx: &EvalContext) -> Result<()> {
        if self.cov_version == Some(ctx.version()) {
            return Ok(());
        }
        let (plan, registry) = (&self.plan, &self.registry);
        self.groups
            .par_iter_mut()
            .zip(plan.groups.par_iter())
            .map(|(state, gp)| state.compute_cov(gp, plan, registry, ctx))
            .collect::<Result<Vec<()>>>()?;
        self.cov_version = Some(ctx.version());

        for err in self.groups.iter().filter_map(|g| g.cov_failure.as_ref()) {
            debug!(%err, "covariance failure");
        }
        Ok(())
    }

    pub fn compute_mean(&mut self, ctx: &EvalContext) -> Result<()> {
        let outcome = expected_means(&self.plan, &self.registry, ctx, MeanMode::Model)?;
        for ((state, expected), full) in self.groups.iter_mut().zip(outcome.expected).zip(outcome.full) {
            state.expected = expected;
            state.full_mean = full;
            state.mean_failure = None;
        }
        for (gx, err) in outcome.failures {
            if let Some(state) = self.groups.get_mut(gx) {
                state.mean_failure = Some(err);
            }
        }
        Ok(())
    }

    /// Total -2 log-likelihood, also written to the fit sink of `ctx`. A group
    /// with a non positive definite covariance contributes NaN.
    pub fn fit(&mut self, ctx: &mut EvalContext) -> Result<f64> {
        self.compute_cov(ctx)?;
        self.compute_mean(ctx)?;

        let home = self.registry.model(self.plan.home).name().to_string();
        let plan = &self.plan;
        let values: Vec<f64> = self
            .groups
            .par_iter_mut()
            .zip(plan.groups.par_iter())
            .map(|(state, gp)| {
                let value = minus2ll(gp, &state.cov, &state.expected);
                state.fit_failure = match value {
                    Some(_) => None,
                    None => Some(EngineError::NonPositiveDefinite { model: home.clone(), group: gp.index }),
                };
                value.unwrap_or(f64::NAN)
            })
            .collect();

        let total: f64 = values.iter().sum();
        if total.is_nan() {
            warn!(model = %home, failed = self.groups.iter().filter(|g| g.fit_failure.is_some()).count(), "fit is NaN");
        }
        ctx.record_fit(total);
        Ok(total)
    }

    /// Draws data under the current parameters. Any group whose covariance
    /// cannot be factored aborts the simulation.
    pub fn simulate(&mut self, ctx: &EvalContext) -> Result<SimulatedData> {
        self.compute_cov(ctx)?;
        simulate(&self.plan, &self.registry, &self.groups, ctx, self.options.simulation_seed)
    }

    /// Numerical failures recorded by the last covariance, mean and fit
    /// evaluations.
    pub fn numerical_failures(&self) -> Vec<EngineError> {
        self.groups.iter().flat_map(|g| g.failures().cloned()).collect()
    }
}
