//! Engine options.
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Maximum number of Rampart rounds; `Some(0)` disables Rampart.
    pub rampart_cycle_limit: Option<usize>,
    /// Only the first `n` units are Rampart candidates.
    pub rampart_unit_limit: Option<usize>,
    pub force_single_group: bool,
    pub use_sufficient_sets: bool,
    /// 0 = off, 1 = quick rotation factors, 2 = also skip sufficient-set copies.
    pub optimize_mean: u8,
    pub max_debug_groups: usize,
    pub analyze_def_vars: bool,
    pub inverse_optimization: bool,
    pub max_shallow_depth: usize,
    pub simulation_seed: u64,
    pub max_export_obs: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            rampart_cycle_limit: None,
            rampart_unit_limit: None,
            force_single_group: false,
            use_sufficient_sets: true,
            optimize_mean: 0,
            max_debug_groups: 0,
            analyze_def_vars: true,
            inverse_optimization: true,
            max_shallow_depth: 64,
            simulation_seed: 0,
            max_export_obs: 500,
        }
    }
}

impl EngineOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(text).map_err(|e| EngineError::InvalidOptions(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::InvalidOptions(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.optimize_mean > 2 {
            return Err(EngineError::InvalidOptions(format!(
                "optimize_mean must be 0, 1 or 2 (got {})",
                self.optimize_mean
            )));
        }
        Ok(())
    }

    pub fn rampart_enabled(&self) -> bool {
        self.rampart_cycle_limit != Some(0)
    }
}
