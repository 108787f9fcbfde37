//! Lazy facade over `RelationalState`: nothing is flattened until the first
//! request.

use crate::compute::{RelationalState, SimulatedData};
use crate::config::EngineOptions;
use crate::display::{export, Export};
use crate::error::Result;
use crate::model::EvalContext;
use crate::store::{ModelId, Registry};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Covariance,
    Means,
    /// Covariance, means and the fit.
    Distribution,
}

#[derive(Debug)]
pub struct RelationalExpectation {
    registry: Arc<Registry>,
    home: ModelId,
    options: EngineOptions,
    state: Option<RelationalState>,
}

impl RelationalExpectation {
    pub fn new(registry: Arc<Registry>, home: ModelId, options: EngineOptions) -> Self {
        Self { registry, home, options, state: None }
    }

    pub fn is_planned(&self) -> bool { self.state.is_some() }

    pub fn state(&mut self) -> Result<&mut RelationalState> {
        let state = match self.state.take() {
            Some(state) => state,
            None => {
                debug!(home = self.home.index(), "planning relational expectation");
                RelationalState::new(Arc::clone(&self.registry), self.home, self.options.clone())?
            }
        };
        Ok(self.state.insert(state))
    }

    pub fn compute(&mut self, ctx: &mut EvalContext, what: Component) -> Result<()> {
        let state = self.state()?;
        match what {
            Component::Covariance => state.compute_cov(ctx),
            Component::Means => state.compute_mean(ctx),
            Component::Distribution => state.fit(ctx).map(|_| ()),
        }
    }

    pub fn fit(&mut self, ctx: &mut EvalContext) -> Result<f64> {
        self.state()?.fit(ctx)
    }

    /// Drops the plan; the next request rebuilds it.
    pub fn invalidate_cache(&mut self) {
        self.state = None;
    }

    pub fn generate_data(&mut self, ctx: &EvalContext) -> Result<SimulatedData> {
        self.state()?.simulate(ctx)
    }

    pub fn export(&mut self) -> Result<Export> {
        Ok(export(self.state()?))
    }
}
