//! Flattened unit arena.
//!
//! `Unit` holds what the numeric phase reads on every evaluation; `UnitSetup`
//! holds the planning-time bookkeeping. Both are indexed by `UnitId`.

use crate::error::{EngineError, Result};
use crate::store::{DatasetId, ModelId, RowKey, UnitId};
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SkipMean {
    #[default]
    Unknown,
    No,
    Yes,
}

/// Where a unit sits inside its independent group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Membership {
    pub group: usize,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Unit {
    pub model: ModelId,
    pub dataset: DatasetId,
    pub row: usize,
    pub num_vars: usize,
    pub num_obs: usize,
    pub rampart_scale: f64,
    pub quick_rotation_factor: f64,
    pub next_mean: usize,
    pub membership: Option<Membership>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UnitSetup {
    /// Parent unit per join of the owning model; `None` for an NA key.
    pub parents: SmallVec<[Option<UnitId>; 2]>,
    pub parent1: Option<UnitId>,
    pub fk1: Option<i64>,
    pub num_kids: usize,
    pub num_joins: usize,
    pub clumped: bool,
    pub clump: SmallVec<[UnitId; 4]>,
    pub skip_mean: SkipMean,
    pub heterogeneous_mean: bool,
    pub rset: Option<usize>,
    /// `true` where the manifest column is observed (finite).
    pub observed: Vec<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct Layout {
    pub units: Vec<Unit>,
    pub setup: Vec<UnitSetup>,
    pub row_map: HashMap<RowKey, UnitId>,
    /// Sum of variable counts over all units.
    pub max_size: usize,
    /// Models in order of first appearance.
    pub models: Vec<ModelId>,
}

impl Layout {
    pub fn len(&self) -> usize { self.units.len() }
    pub fn is_empty(&self) -> bool { self.units.is_empty() }

    #[inline(always)]
    pub fn unit(&self, id: UnitId) -> &Unit { &self.units[id.index()] }

    #[inline(always)]
    pub fn unit_mut(&mut self, id: UnitId) -> &mut Unit { &mut self.units[id.index()] }

    #[inline(always)]
    pub fn setup(&self, id: UnitId) -> &UnitSetup { &self.setup[id.index()] }

    #[inline(always)]
    pub fn setup_mut(&mut self, id: UnitId) -> &mut UnitSetup { &mut self.setup[id.index()] }

    pub fn ids(&self) -> impl DoubleEndedIterator<Item = UnitId> { (0..self.units.len()).map(UnitId::new) }

    pub fn unit_of_row(&self, dataset: DatasetId, row: usize, name: &str) -> Result<UnitId> {
        self.row_map
            .get(&(dataset, row))
            .copied()
            .ok_or_else(|| EngineError::RowNotPlaced { dataset: name.to_string(), row })
    }

    /// Parent of `unit` through join `jx`, if the key is not NA.
    #[inline]
    pub fn joined_with(&self, unit: UnitId, jx: usize) -> Option<UnitId> {
        self.setup(unit).parents.get(jx).copied().flatten()
    }

    pub fn clump_with(&mut self, parent: UnitId, child: UnitId) {
        self.setup_mut(parent).clump.push(child);
        self.setup_mut(child).clumped = true;
    }

    /// Appends `unit` and, depth first, everything clumped into it.
    pub fn append_clump(&self, unit: UnitId, out: &mut Vec<UnitId>) {
        out.push(unit);
        for &member in &self.setup(unit).clump {
            self.append_clump(member, out);
        }
    }
}
