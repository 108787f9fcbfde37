use super::layout::{Layout, Unit, UnitSetup};
use crate::error::{EngineError, Result};
use crate::store::{ModelId, Registry, RowKey, UnitId};
use smallvec::SmallVec;
use std::collections::HashMap;
use tracing::{debug, info};

/// Flattens every row of the home model's dataset, recursing into join
/// targets, into one unit per (dataset, row).
///
/// Parents are emitted before their children (post-order), and home rows are
/// visited in row order so the layout is reproducible.
pub fn flatten(registry: &Registry, home: ModelId) -> Result<Layout> {
    let home_model = registry.try_model(home)?;
    let mut flattener = Flattener {
        registry,
        layout: Layout::default(),
        state: HashMap::new(),
    };

    let rows = registry.dataset(home_model.dataset()).num_rows();
    for row in 0..rows {
        flattener.visit(home, row)?;
    }
    let layout = flattener.layout;

    for &id in &layout.models {
        let data = registry.data_of(id);
        if data.has_weights() || data.has_frequencies() {
            return Err(EngineError::WeightsWithJoins {
                model: home_model.name().to_string(),
                dataset: data.name().to_string(),
            });
        }
    }

    info!(model = home_model.name(), units = layout.len(), max_size = layout.max_size, "flattened");
    Ok(layout)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting, // Used for cycle detection
    Visited(UnitId),
}

struct Flattener<'a> {
    registry: &'a Registry,
    layout: Layout,
    state: HashMap<RowKey, VisitState>,
}

impl<'a> Flattener<'a> {
    fn visit(&mut self, id: ModelId, row: usize) -> Result<UnitId> {
        let registry = self.registry;
        let model = registry.model(id);
        let data = registry.dataset(model.dataset());
        let key = (model.dataset(), row);

        // Only keyed rows are shared; unkeyed rows get a fresh unit per visit
        if data.has_primary_key() {
            match self.state.get(&key) {
                Some(VisitState::Visited(unit)) => return Ok(*unit),
                Some(VisitState::Visiting) => {
                    return Err(EngineError::CycleDetected { dataset: data.name().to_string(), row })
                }
                None => {
                    self.state.insert(key, VisitState::Visiting);
                }
            }
        }
        if !self.layout.models.contains(&id) {
            self.layout.models.push(id);
        }

        // Recurse on join targets (parents)
        let mut setup = UnitSetup::default();
        let mut parents: SmallVec<[Option<UnitId>; 2]> = SmallVec::new();
        for (jx, join) in model.joins().iter().enumerate() {
            let Some(fk) = data.key_element(row, join.foreign_key) else {
                parents.push(None);
                continue;
            };
            let parent_data = registry.data_of(join.parent);
            let parent_row = parent_data.lookup_row_of_key(fk)?;
            let parent = self.visit(join.parent, parent_row)?;
            // Only the first join identifies siblings; a row whose first
            // key is NA has no parent1 and is never a rampart candidate.
            if jx == 0 {
                setup.fk1 = Some(fk);
                setup.parent1 = Some(parent);
            }
            parents.push(Some(parent));
        }
        for parent in parents.iter().flatten() {
            self.layout.setup_mut(*parent).num_kids += 1;
            setup.num_joins += 1;
        }
        setup.parents = parents;

        let columns = model.data_columns();
        if !columns.is_empty() && !model.has_mean_structure() {
            return Err(EngineError::MissingMeans { model: model.name().to_string() });
        }
        setup.observed = columns.iter().map(|&col| data.column_value(row, col).is_finite()).collect();

        let unit = Unit {
            model: id,
            dataset: model.dataset(),
            row,
            num_vars: model.num_vars(),
            num_obs: setup.observed.iter().filter(|&&o| o).count(),
            rampart_scale: 1.0,
            quick_rotation_factor: 1.0,
            next_mean: 1,
            membership: None,
        };
        let uid = UnitId::new(self.layout.len());
        self.layout.max_size += unit.num_vars;
        self.layout.units.push(unit);
        self.layout.setup.push(setup);

        if data.has_primary_key() {
            self.state.insert(key, VisitState::Visited(uid));
        }
        self.layout.row_map.entry(key).or_insert(uid);
        debug!(model = model.name(), row, unit = %uid, "placed unit");
        Ok(uid)
    }
}
